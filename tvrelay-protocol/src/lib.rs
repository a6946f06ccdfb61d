//! Shared types for the tvrelay live-TV gateway.
//!
//! This crate defines the values that cross the boundary between the
//! buffering engine and its collaborators:
//!
//! - [`ChannelRequest`]: a resolved channel with up to three backups
//! - [`ProviderParams`]: buffering mode, tuner limit and upstream overrides
//!   for one playlist
//! - [`StreamError`] / [`AdmissionError`]: the engine's error taxonomy
//! - [`StatusSummary`], [`SessionStatus`], [`StreamStatus`]: status panel data
//!
//! ```rust
//! use tvrelay_protocol::{BufferMode, ChannelRequest, ProviderParams};
//!
//! let request = ChannelRequest::new("M1", "http://src/ch1", "Channel 1")
//!     .with_backup("M2", "http://backup/ch1b");
//! assert_eq!(request.backups.len(), 1);
//!
//! let params = ProviderParams::new("Provider", BufferMode::Ffmpeg, 2);
//! assert!(params.buffer_mode.uses_transcoder());
//! ```

pub mod error;
pub mod types;

pub use error::{AdmissionError, ServeError, StreamError};
pub use types::*;
