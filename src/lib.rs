//! Streaming GET gateway in front of a single object-storage origin.
//!
//! `/health` answers locally. Every other path is relayed to the origin with a
//! small allow-list of request headers, and the origin's status, headers and
//! body come back untouched.

pub mod config;
pub mod error;
pub mod handlers;
pub mod proxy;
pub mod server;
pub mod telemetry;

pub use config::AppConfig;
pub use error::AppError;
pub use proxy::OssProxy;
pub use server::Server;
