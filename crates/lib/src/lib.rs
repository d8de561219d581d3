//! pushgate core library: per-app sessions to the binary push backend, the wire codec,
//! and the WebSocket gateway used by the CLI.

pub mod codec;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod init;
pub mod registry;
pub mod service;
pub mod session;
pub mod tls;

pub use error::{PushError, Result};
