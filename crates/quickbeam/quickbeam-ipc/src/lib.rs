//! `quickbeam-ipc`: client–server IPC over shared memory or sockets.
//!
//! A connection rides three one-way channels: a synchronous
//! request/response pair, and an asynchronous server→client event channel
//! that may drop its oldest entries under backpressure. Rendezvous happens
//! over a Unix stream socket used only for connect, authenticate,
//! disconnect and event-channel renegotiation; once established, payload
//! moves through private shared-memory rings (or SOCK_SEQPACKET pairs) with
//! eventfd wakeups.
//!
//! The server side is driven by a `quickbeam_loop::Loop`; the client side
//! blocks with millisecond timeouts or integrates into any poll loop via
//! [`Connection::fd_get`].
//!
//! ```ignore
//! // server
//! struct Echo;
//! impl ServiceHandlers for Echo {
//!     fn message(&mut self, conn: &mut ConnectionRef<'_>, data: &[u8]) {
//!         let Some(req) = RequestHeader::decode(data) else { return };
//!         let resp = ResponseHeader {
//!             id: req.id,
//!             size: (ResponseHeader::SIZE + data.len() - RequestHeader::SIZE) as i32,
//!             error: 0,
//!         };
//!         if let Err(err) = conn.response_sendv(&[&resp.encode(), &data[RequestHeader::SIZE..]]) {
//!             tracing::warn!(%err, "response dropped");
//!         }
//!     }
//! }
//! let mut lp = Loop::new()?;
//! let service = Service::new(RuntimeDir::resolve(), "echo", IpcType::Shm, 8192, Echo);
//! service.run(&mut lp)?;
//! lp.run()?;
//! ```

mod channel;
mod client;
mod error;
mod proto;
mod server;
mod sock;

pub use client::Connection;
pub use error::IpcError;
pub use proto::{
    ConnectAccept, ConnectRequest, EventHeader, IpcType, MSG_AUTHENTICATE, MSG_DISCONNECT,
    MSG_NEW_EVENT_SOCK, NewEventReply, RequestHeader, ResponseHeader,
};
pub use server::{ConnectionRef, Service, ServiceHandlers};
pub use sock::Credentials;
