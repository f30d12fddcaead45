//! Channel registry
//!
//! Maps channel keys to the worker that owns them and keeps each channel's
//! source, ring buffer and consumers on that worker.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<ChannelRegistry>
//!                    ┌───────────────────────────┐
//!                    │ RuntimeHandle<HubWorker>  │
//!                    │ HubShared { config,       │
//!                    │   header, stats slots }   │
//!                    └─────────────┬─────────────┘
//!          attach(socket) ─────────┤ key.worker(n)
//!                                  ▼
//!    ┌──────────────────── worker k ─────────────────────┐
//!    │ HubWorker { channels: Vec<Channel> }               │
//!    │                                                    │
//!    │  UdpSocket ──ingest──► RingBuffer ──send pass──►   │
//!    │   (demux)              (one writer)   Consumer A   │
//!    │                                       Consumer B   │
//!    └────────────────────────────────────────────────────┘
//! ```
//!
//! # Zero-Copy Design
//!
//! Source payload is received straight into the ring's write reservation, and
//! consumers are sent vectored slices borrowed from the ring's backing store.
//! The only copies are the RTP header strip (a shift within the reservation)
//! and datagrams arriving right at the wrap point.

pub mod channel;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod source;
pub mod store;
pub mod worker;

pub use channel::{Channel, ChannelId};
pub use config::RegistryConfig;
pub use error::RegistryError;
pub use lifecycle::Teardown;
pub use source::{ChannelKey, Interface, SourceParams};
pub use store::{ChannelRegistry, EnumerateReport};
pub use worker::{Attached, HubWorker};
