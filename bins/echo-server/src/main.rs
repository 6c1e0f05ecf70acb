use quickbeam_config::EchoConfig;
use quickbeam_ipc::{
    ConnectionRef, Credentials, IpcType, RequestHeader, ResponseHeader, Service, ServiceHandlers,
};
use quickbeam_loop::{Loop, Priority};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Answers every request with its own payload.
struct EchoHandlers;

impl ServiceHandlers for EchoHandlers {
    fn authenticate(&mut self, creds: &Credentials) -> bool {
        info!(uid = creds.uid, pid = creds.pid, "client connecting");
        true
    }

    fn connection_created(&mut self, conn: &mut ConnectionRef<'_>) {
        info!(conn_id = conn.id(), "connection up");
    }

    fn message(&mut self, conn: &mut ConnectionRef<'_>, data: &[u8]) {
        let Some(req) = RequestHeader::decode(data) else {
            warn!(conn_id = conn.id(), "dropping malformed request");
            return;
        };
        let payload = &data[RequestHeader::SIZE..];
        let resp = ResponseHeader {
            id: req.id,
            size: (ResponseHeader::SIZE + payload.len()) as i32,
            error: 0,
        };
        if let Err(err) = conn.response_sendv(&[&resp.encode(), payload]) {
            warn!(conn_id = conn.id(), %err, "response dropped");
        }
    }

    fn connection_destroyed(&mut self, conn_id: u64) {
        info!(conn_id, "connection down");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = EchoConfig::load_or_default(std::env::args().nth(1))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let mut lp = Loop::new()?;
    let service = Service::new(
        config.runtime_dir(),
        &config.service_name,
        IpcType::Shm,
        config.max_msg_size,
        EchoHandlers,
    );
    service.run(&mut lp)?;

    lp.signal_add(Priority::High, libc::SIGINT, |lp, _| lp.stop())?;
    lp.signal_add(Priority::High, libc::SIGTERM, |lp, _| lp.stop())?;

    info!(
        service = config.service_name,
        max_msg_size = config.max_msg_size,
        "echo service running"
    );
    lp.run()?;

    service.destroy(&mut lp);
    info!("echo service stopped");
    Ok(())
}
