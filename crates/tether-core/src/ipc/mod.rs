//! Multiplexed streaming RPC over one websocket.
//!
//! # Architecture
//!
//! - **Connection**: client side; owns the socket, demultiplexes frames by
//!   correlation id and reconnects with backoff
//! - **Stream**: one logical call layered on the connection
//! - **Server**: runtime side; runs registered stream methods per call
//! - **Protocol**: frame types shared by both sides

pub mod backoff;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod stream;

pub use connection::{ConnectionManager, ConnectionState, DisconnectCause, FrameRoute, RouteEvent};
pub use protocol::{ClientFrame, FrameKind, InboundFrame, PubSubMessage, ServerFrame};
pub use server::{StreamMethod, StreamServer, StreamServerHandle, StreamSink};
pub use stream::{
    call_unary, CloseCause, StartReceipt, StreamCallbacks, StreamError, StreamHandle, StreamHandler,
    StreamState,
};
