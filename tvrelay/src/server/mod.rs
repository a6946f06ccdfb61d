//! HTTP server and viewer sessions.

pub mod listener;
pub mod session;

pub use listener::{Server, ServerConfig};
pub use session::default_placeholder;
