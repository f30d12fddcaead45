//! HTTP front end
//!
//! A deliberately small HTTP/1.x layer: one request head per connection, no
//! keep-alive. Stream requests hand the socket to the channel registry; the
//! remaining routes are answered directly.

pub mod config;
pub mod listener;
pub mod request;

pub use config::ServerConfig;
pub use listener::HubServer;
pub use request::{route, Method, RequestError, RequestHead, Route};
