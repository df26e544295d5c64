//! Channel transport between the session and the backend agent cluster.
//!
//! The session only sees [`Connector`] and [`Channel`]. A connector performs the
//! handshake; the channel it yields carries typed frames in both directions until
//! closed. Inbound traffic is handed over once, as a receiver, so there is exactly
//! one consumer of inbound frames per connection.

pub mod mock;
pub mod protocol;
pub mod ws;

use crate::error::{ConnectError, ProtocolError, SendError};
use crate::identity::Credential;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use protocol::{InboundFrame, OutboundFrame};

/// Something delivered by the transport's reader, in receipt order.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Frame(InboundFrame),
    /// A frame arrived but could not be decoded. The connection stays up.
    Invalid(ProtocolError),
    /// The peer closed the connection or the transport failed.
    Closed { reason: String },
}

/// Opens channels to the backend.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Perform the handshake, attaching `credential`.
    async fn open(&self, credential: &Credential) -> Result<Box<dyn Channel>, ConnectError>;

    /// Where this connector points, for status output.
    fn endpoint(&self) -> String;
}

/// One open connection.
#[async_trait]
pub trait Channel: Send {
    /// Write one frame. Fails with [`SendError::NotOpen`] after `close`.
    async fn send(&mut self, frame: &OutboundFrame) -> Result<(), SendError>;

    /// Take the inbound stream. Returns `None` on every call after the first.
    fn take_inbound(&mut self) -> Option<mpsc::Receiver<InboundEvent>>;

    /// Close the connection. Idempotent and infallible.
    async fn close(&mut self);

    fn is_open(&self) -> bool;
}
