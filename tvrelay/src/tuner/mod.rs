//! Shared upstream streams.
//!
//! This module provides:
//! - [`SessionRegistry`]: per-playlist sessions with tuner-limit admission
//! - [`SharedStream`]: one buffered upstream URL shared by its viewers
//! - [`FailoverPlan`]: primary → backup progression of a viewer request
//! - [`key`]: stream fingerprints, viewer labels and folder names

pub mod failover;
pub mod key;
pub mod pool;
pub mod shared;

pub use pool::SessionRegistry;
