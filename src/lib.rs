//! udp-hub: multicast / RTP transport stream to HTTP relay
//!
//! Receives live MPEG-TS from UDP sources (raw or RTP-wrapped) and fans each
//! source out to any number of HTTP clients. Every source ("channel") lives on
//! one worker thread together with its ring buffer and its consumers; clients
//! join mid-stream with a configurable precache and fall behind
//! independently.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use udp_hub::{ChannelRegistry, HubServer, HubWorker, RegistryConfig, ServerConfig, WorkerRuntime};
//!
//! #[tokio::main]
//! async fn main() -> udp_hub::Result<()> {
//!     let config = ServerConfig::default();
//!     let runtime = WorkerRuntime::start(config.workers, |_| HubWorker::default())?;
//!     let registry = Arc::new(ChannelRegistry::create(
//!         runtime.handle().clone(),
//!         RegistryConfig::default(),
//!     )?);
//!
//!     let server = HubServer::new(config, Arc::clone(&registry))?;
//!     server.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//!
//!     registry.destroy()?;
//!     runtime.shutdown();
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod media;
pub mod registry;
pub mod ring;
pub mod runtime;
pub mod server;
pub mod session;
pub mod source;
pub mod stats;

pub use error::{ConfigError, Error, Result};
pub use registry::{
    Attached, ChannelKey, ChannelRegistry, HubWorker, Interface, RegistryConfig, RegistryError,
    SourceParams,
};
pub use runtime::{RuntimeHandle, WorkerRuntime};
pub use server::{HubServer, ServerConfig};
pub use stats::Stats;
