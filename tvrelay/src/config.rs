//! Configuration file format.
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:34400"
//!
//! [buffer]
//! size_kb = 1024
//! store = "memory"
//!
//! [[playlists]]
//! id = "M1"
//! name = "Provider"
//! buffer = "ffmpeg"
//! tuners = 2
//!
//! [[channels]]
//! token = "1001"
//! playlist = "M1"
//! name = "News"
//! url = "http://provider/news.ts"
//! backups = [{ playlist = "M1", url = "http://mirror/news.ts" }]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tvrelay_protocol::{BufferMode, ChannelRequest, ProviderParams, ProxyAddr};

use crate::buffer::{BufferConfig, TranscoderConfig};
use crate::directory::StaticDirectory;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Where segments are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Disk,
}

#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub buffer: BufferSection,
    #[serde(default)]
    pub transcoder: TranscoderSection,
    #[serde(default)]
    pub playlists: Vec<PlaylistEntry>,
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerSection {
    pub listen: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct BufferSection {
    pub size_kb: Option<usize>,
    pub store: Option<StoreKind>,
    pub temp_dir: Option<String>,
    pub first_byte_timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    /// File sent to viewers when no tuner is free.
    pub placeholder: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct TranscoderSection {
    pub ffmpeg_path: Option<String>,
    pub ffmpeg_options: Option<String>,
    pub vlc_path: Option<String>,
    pub vlc_options: Option<String>,
    pub user_agent: Option<String>,
    pub force_http: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PlaylistEntry {
    pub id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub buffer: BufferMode,
    #[serde(default = "default_tuners")]
    pub tuners: usize,
    pub proxy: Option<ProxyAddr>,
    pub user_agent: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_tuners() -> usize {
    1
}

#[derive(Debug, Deserialize)]
pub struct ChannelEntry {
    pub token: String,
    pub playlist: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub backups: Vec<BackupEntry>,
}

#[derive(Debug, Deserialize)]
pub struct BackupEntry {
    pub playlist: String,
    pub url: String,
}

pub fn load_config(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&contents)?)
}

impl ConfigFile {
    /// Build the channel and playlist tables.
    pub fn directory(&self) -> Result<StaticDirectory, ConfigError> {
        let mut directory = StaticDirectory::new();
        let mut playlist_ids = HashSet::new();

        for entry in &self.playlists {
            if !playlist_ids.insert(entry.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate playlist id {}",
                    entry.id
                )));
            }
            let mut params = ProviderParams::new(
                entry.name.clone().unwrap_or_else(|| entry.id.clone()),
                entry.buffer,
                entry.tuners,
            );
            params.proxy = entry.proxy.clone();
            params.user_agent = entry.user_agent.clone();
            params.headers = entry.headers.clone();
            directory = directory.with_playlist(entry.id.clone(), params);
        }

        let mut tokens = HashSet::new();
        for entry in &self.channels {
            if !tokens.insert(entry.token.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate channel token {}",
                    entry.token
                )));
            }
            let referenced = std::iter::once(&entry.playlist)
                .chain(entry.backups.iter().map(|b| &b.playlist));
            for playlist in referenced {
                if !playlist_ids.contains(playlist.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "channel {} references unknown playlist {}",
                        entry.token, playlist
                    )));
                }
            }

            let request = entry.backups.iter().fold(
                ChannelRequest::new(entry.playlist.clone(), entry.url.clone(), entry.name.clone()),
                |request, backup| request.with_backup(backup.playlist.clone(), backup.url.clone()),
            );
            directory = directory.with_channel(entry.token.clone(), request);
        }

        Ok(directory)
    }

    /// Buffer settings; `temp_dir` from the command line wins.
    pub fn buffer_config(&self, temp_dir: Option<PathBuf>) -> BufferConfig {
        let defaults = BufferConfig::default();
        let section = &self.buffer;
        BufferConfig {
            buffer_size_kb: section.size_kb.unwrap_or(defaults.buffer_size_kb),
            temp_dir: temp_dir
                .or_else(|| section.temp_dir.as_ref().map(PathBuf::from))
                .unwrap_or(defaults.temp_dir),
            first_byte_timeout_secs: section
                .first_byte_timeout_secs
                .unwrap_or(defaults.first_byte_timeout_secs),
            poll_interval_ms: section.poll_interval_ms.unwrap_or(defaults.poll_interval_ms),
        }
    }

    pub fn transcoder_config(&self) -> TranscoderConfig {
        let defaults = TranscoderConfig::default();
        let section = &self.transcoder;
        TranscoderConfig {
            ffmpeg_path: section
                .ffmpeg_path
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or(defaults.ffmpeg_path),
            ffmpeg_options: section
                .ffmpeg_options
                .clone()
                .unwrap_or(defaults.ffmpeg_options),
            vlc_path: section
                .vlc_path
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or(defaults.vlc_path),
            vlc_options: section.vlc_options.clone().unwrap_or(defaults.vlc_options),
            user_agent: section.user_agent.clone().unwrap_or(defaults.user_agent),
            force_http: section.force_http.unwrap_or(defaults.force_http),
        }
    }
}
