//! Wire protocol: message headers, reserved ids, and the connect handshake
//! payloads. Everything is encoded explicitly as little-endian so the layout
//! is the contract, not the compiler.
//!
//! Every request starts with [`RequestHeader`] (8 bytes). Every response
//! starts with [`ResponseHeader`] (16 bytes; `error` is 0 or a negative
//! errno-style code). Events carry their own [`EventHeader`] (16 bytes)
//! whose `seq` field increases by one per event sent on a connection, so a
//! client can count events dropped under overwrite backpressure.

/// Reserved message ids. All ids >= 0 belong to the application.
pub const MSG_AUTHENTICATE: i32 = -1;
pub const MSG_NEW_EVENT_SOCK: i32 = -2;
pub const MSG_DISCONNECT: i32 = -3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(8))]
pub struct RequestHeader {
    /// Message type; negative values are reserved for the transport.
    pub id: i32,
    /// Total size in bytes, header included.
    pub size: i32,
}

impl RequestHeader {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..4].copy_from_slice(&self.id.to_le_bytes());
        b[4..8].copy_from_slice(&self.size.to_le_bytes());
        b
    }

    pub fn decode(b: &[u8]) -> Option<Self> {
        if b.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            id: i32::from_le_bytes(b[0..4].try_into().ok()?),
            size: i32::from_le_bytes(b[4..8].try_into().ok()?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(8))]
pub struct ResponseHeader {
    pub id: i32,
    pub size: i32,
    /// 0 on success, negative errno-style code otherwise.
    pub error: i32,
}

impl ResponseHeader {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..4].copy_from_slice(&self.id.to_le_bytes());
        b[4..8].copy_from_slice(&self.size.to_le_bytes());
        b[8..12].copy_from_slice(&self.error.to_le_bytes());
        b
    }

    pub fn decode(b: &[u8]) -> Option<Self> {
        if b.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            id: i32::from_le_bytes(b[0..4].try_into().ok()?),
            size: i32::from_le_bytes(b[4..8].try_into().ok()?),
            error: i32::from_le_bytes(b[8..12].try_into().ok()?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(8))]
pub struct EventHeader {
    pub id: i32,
    pub size: i32,
    /// Per-connection counter, incremented by the server for every event.
    pub seq: u32,
}

impl EventHeader {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..4].copy_from_slice(&self.id.to_le_bytes());
        b[4..8].copy_from_slice(&self.size.to_le_bytes());
        b[8..12].copy_from_slice(&self.seq.to_le_bytes());
        b
    }

    pub fn decode(b: &[u8]) -> Option<Self> {
        if b.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            id: i32::from_le_bytes(b[0..4].try_into().ok()?),
            size: i32::from_le_bytes(b[4..8].try_into().ok()?),
            seq: u32::from_le_bytes(b[8..12].try_into().ok()?),
        })
    }
}

/// How a connection's channels are realised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcType {
    /// Three shared-memory rings plus eventfd notifiers.
    Shm,
    /// Three SOCK_SEQPACKET pairs.
    Socket,
}

impl IpcType {
    fn code(self) -> u32 {
        match self {
            IpcType::Shm => 0,
            IpcType::Socket => 1,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(IpcType::Shm),
            1 => Some(IpcType::Socket),
            _ => None,
        }
    }
}

/// Payload of the AUTHENTICATE request. Credentials never travel here; the
/// server takes them from the socket.
#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest {
    pub max_msg_size: u32,
}

impl ConnectRequest {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..4].copy_from_slice(&self.max_msg_size.to_le_bytes());
        b
    }

    pub fn decode(b: &[u8]) -> Option<Self> {
        if b.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            max_msg_size: u32::from_le_bytes(b[0..4].try_into().ok()?),
        })
    }
}

/// Payload of a successful AUTHENTICATE response. The channel fds (three
/// eventfds for `Shm`, three socket ends for `Socket`) ride alongside as
/// SCM_RIGHTS.
#[derive(Debug, Clone, Copy)]
pub struct ConnectAccept {
    pub conn_id: u64,
    /// The size the server enforces; at least what the client asked for.
    pub max_msg_size: u32,
    pub transport: IpcType,
}

impl ConnectAccept {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..8].copy_from_slice(&self.conn_id.to_le_bytes());
        b[8..12].copy_from_slice(&self.max_msg_size.to_le_bytes());
        b[12..16].copy_from_slice(&self.transport.code().to_le_bytes());
        b
    }

    pub fn decode(b: &[u8]) -> Option<Self> {
        if b.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            conn_id: u64::from_le_bytes(b[0..8].try_into().ok()?),
            max_msg_size: u32::from_le_bytes(b[8..12].try_into().ok()?),
            transport: IpcType::from_code(u32::from_le_bytes(b[12..16].try_into().ok()?))?,
        })
    }
}

/// Payload of a successful NEW_EVENT_SOCK response; the replacement event
/// channel's fd rides alongside as SCM_RIGHTS.
#[derive(Debug, Clone, Copy)]
pub struct NewEventReply {
    /// Generation of the event channel; names the replacement ring role
    /// (`event`, `event1`, `event2`, ...).
    pub generation: u32,
}

impl NewEventReply {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..4].copy_from_slice(&self.generation.to_le_bytes());
        b
    }

    pub fn decode(b: &[u8]) -> Option<Self> {
        if b.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            generation: u32::from_le_bytes(b[0..4].try_into().ok()?),
        })
    }
}

/// Role string of the event channel at `generation`.
pub fn event_role(generation: u32) -> String {
    if generation == 0 {
        "event".to_string()
    } else {
        format!("event{generation}")
    }
}

/// Name of one per-connection ring; the ring layer turns this into
/// `qb-<service>-<conn-id>-<role>.rb` in the runtime directory.
pub fn ring_name(service: &str, conn_id: u64, role: &str) -> String {
    format!("{service}-{conn_id}-{role}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_have_wire_sizes() {
        assert_eq!(std::mem::size_of::<RequestHeader>(), RequestHeader::SIZE);
        assert_eq!(std::mem::size_of::<ResponseHeader>(), ResponseHeader::SIZE);
        assert_eq!(std::mem::size_of::<EventHeader>(), EventHeader::SIZE);
    }

    #[test]
    fn header_round_trip() {
        let req = RequestHeader { id: 7, size: 64 };
        assert_eq!(RequestHeader::decode(&req.encode()), Some(req));

        let resp = ResponseHeader {
            id: MSG_AUTHENTICATE,
            size: 24,
            error: -libc::EACCES,
        };
        assert_eq!(ResponseHeader::decode(&resp.encode()), Some(resp));

        let ev = EventHeader {
            id: 3,
            size: 80,
            seq: u32::MAX,
        };
        assert_eq!(EventHeader::decode(&ev.encode()), Some(ev));
    }

    #[test]
    fn connect_accept_round_trip() {
        let accept = ConnectAccept {
            conn_id: 42,
            max_msg_size: 1 << 20,
            transport: IpcType::Socket,
        };
        let decoded = ConnectAccept::decode(&accept.encode()).unwrap();
        assert_eq!(decoded.conn_id, 42);
        assert_eq!(decoded.max_msg_size, 1 << 20);
        assert_eq!(decoded.transport, IpcType::Socket);
        // Unknown transports are rejected, not guessed.
        let mut bad = accept.encode();
        bad[12] = 9;
        assert!(ConnectAccept::decode(&bad).is_none());
    }

    #[test]
    fn ring_names_follow_the_segment_convention() {
        assert_eq!(ring_name("echo", 3, "request"), "echo-3-request");
    }
}
