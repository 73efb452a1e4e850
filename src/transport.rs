//! Transport abstraction for the PubSub protocol.
//!
//! The [`Transport`] trait defines a bidirectional text message channel between
//! the client and the notification service. Every frame is one JSON text
//! message, so implementations handle framing internally.
//!
//! Unlike a one-shot client, a session reconnects many times over its life,
//! so it never receives a transport directly. It is handed a [`Connector`]
//! instead and asks it for a fresh, connected [`Transport`] on every attempt.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use channel_point_sounds::error::ChannelPointsError;
//! use channel_point_sounds::transport::{Connector, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), ChannelPointsError> {
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, ChannelPointsError>> {
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), ChannelPointsError> {
//!         todo!()
//!     }
//! }
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     async fn connect(&self) -> Result<Box<dyn Transport>, ChannelPointsError> {
//!         Ok(Box::new(MyTransport {}))
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::ChannelPointsError;

/// A bidirectional text message transport.
///
/// Each call to [`send`](Transport::send) transmits one complete JSON frame and
/// each call to [`recv`](Transport::recv) returns one complete JSON frame.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because it is
/// polled inside `tokio::select!` next to timers. If `recv` is cancelled before
/// completion, calling it again must not lose data.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text frame to the server.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelPointsError::TransportSend`] if the frame could not be
    /// sent, or [`ChannelPointsError::TransportClosed`] after [`close`](Transport::close).
    async fn send(&mut self, message: String) -> Result<(), ChannelPointsError>;

    /// Receive the next JSON text frame from the server.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete frame was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the connection was closed
    async fn recv(&mut self) -> Option<Result<String, ChannelPointsError>>;

    /// Close the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails. Implementations must
    /// still release resources in that case.
    async fn close(&mut self) -> Result<(), ChannelPointsError>;
}

/// Opens connected transports to the notification service.
///
/// Called once per connection attempt; the returned future is polled by the
/// session loop alongside everything else, so it must not block.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new connection.
    ///
    /// # Errors
    ///
    /// Any error is logged by the caller and handled as a closed connection,
    /// which schedules the next retry.
    async fn connect(&self) -> Result<Box<dyn Transport>, ChannelPointsError>;
}
