//! Identity keys for streams and viewers.

use std::fmt;
use std::net::IpAddr;

use sha2::{Digest, Sha256};

/// Deterministic hash of an upstream URL.
///
/// The same URL always yields the same fingerprint, which names the stream's
/// segment folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of an upstream URL (hex SHA-256, truncated to 32 chars).
    pub fn of(url: &str) -> Self {
        let digest = Sha256::digest(url.as_bytes());
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable label for a viewer context, derived from its IP and user agent.
///
/// Used for logging only: reconnects from the same player share a label, but
/// the label never decides which stream a viewer is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewerKey(String);

impl ViewerKey {
    pub fn new(ip: Option<IpAddr>, user_agent: &str) -> Self {
        let mut hasher = Sha256::new();
        if let Some(ip) = ip {
            hasher.update(ip.to_string().as_bytes());
        }
        hasher.update(b"\0");
        hasher.update(user_agent.as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..6]))
    }
}

impl fmt::Display for ViewerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Make a playlist id safe to use as a folder name.
pub fn folder_name(playlist_id: &str) -> String {
    playlist_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
