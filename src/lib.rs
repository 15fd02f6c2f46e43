//! tired-proxy - A reverse proxy that shuts itself down when nobody uses it
//!
//! This library provides a single-origin reverse proxy that:
//! - Forwards HTTP traffic to one origin over pooled connections
//! - Optionally starts the origin server as a supervised child process
//! - Waits for the origin port to come online before accepting traffic
//! - Shuts down the proxy and the child after a period without requests
//! - Relays SIGINT/SIGTERM to the child and exits with its exit code

pub mod config;
pub mod error;
pub mod idle;
pub mod origin;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod signal;
pub mod supervisor;
pub mod wait;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
