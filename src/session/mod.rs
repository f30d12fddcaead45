//! Consumer sessions
//!
//! An HTTP client attached to a channel, the per-channel send pass that feeds
//! it from the ring buffer, and the socket options it is tuned with.

pub mod consumer;
pub mod fanout;
pub mod socket;

pub use consumer::{ClientInfo, Consumer, SERVICE_UNAVAILABLE};
pub use fanout::{send_pass, CloseReason, PassReport, SendPolicy};
pub use socket::SocketDiagnostics;
