use quickbeam_config::EchoConfig;
use quickbeam_ipc::{Connection, RequestHeader, ResponseHeader};
use tracing::debug;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = EchoConfig::default();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let text: String = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let text = if text.is_empty() { "ping".to_string() } else { text };

    let dir = config.runtime_dir();
    let conn = Connection::connect(&dir, &config.service_name, config.max_msg_size)?;
    debug!(
        buffer_size = conn.buffer_size(),
        conn_id = conn.conn_id(),
        "connected"
    );

    let hdr = RequestHeader {
        id: 1,
        size: (RequestHeader::SIZE + text.len()) as i32,
    };
    let mut buf = vec![0u8; conn.buffer_size()];
    let n = conn.sendv_recv(&[&hdr.encode(), text.as_bytes()], &mut buf, 5_000)?;

    let resp = ResponseHeader::decode(&buf[..n]).ok_or("short response")?;
    if resp.error != 0 {
        return Err(format!("server reported error {}", resp.error).into());
    }
    println!(
        "{}",
        String::from_utf8_lossy(&buf[ResponseHeader::SIZE..n])
    );

    conn.disconnect()?;
    Ok(())
}
