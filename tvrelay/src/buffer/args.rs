//! Transcoder command line construction.
//!
//! Options are configured as a whitespace separated template in which
//! `[URL]` is replaced with the upstream URL. User agent, proxy and header
//! overrides are added in the syntax of the selected backend.

use std::path::PathBuf;

use log::debug;
use tvrelay_protocol::{BufferMode, ProviderParams, StreamError};

/// Placeholder replaced with the upstream URL.
pub const URL_PLACEHOLDER: &str = "[URL]";

pub const DEFAULT_FFMPEG_OPTIONS: &str =
    "-hide_banner -loglevel error -i [URL] -c copy -f mpegts pipe:1";
pub const DEFAULT_VLC_OPTIONS: &str = "-I dummy [URL] --sout #std{mux=ts,access=file,dst=-}";
pub const DEFAULT_USER_AGENT: &str = "tvrelay";

/// Transcoder binaries and option templates.
#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    pub ffmpeg_path: PathBuf,
    pub ffmpeg_options: String,
    pub vlc_path: PathBuf,
    pub vlc_options: String,
    /// User agent sent upstream unless the playlist overrides it.
    pub user_agent: String,
    /// Rewrite `https://` upstreams to `http://` for ffmpeg.
    pub force_http: bool,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffmpeg_options: DEFAULT_FFMPEG_OPTIONS.to_string(),
            vlc_path: PathBuf::from("cvlc"),
            vlc_options: DEFAULT_VLC_OPTIONS.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            force_http: false,
        }
    }
}

/// A fully resolved transcoder invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscoderCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl TranscoderCommand {
    /// Build the command for `url` in the given buffer mode.
    pub fn build(
        config: &TranscoderConfig,
        mode: BufferMode,
        url: &str,
        params: &ProviderParams,
    ) -> Result<Self, StreamError> {
        let user_agent = params
            .user_agent
            .as_deref()
            .unwrap_or(config.user_agent.as_str());

        match mode {
            BufferMode::None => Err(StreamError::StartupFailed(
                "buffer mode 'none' has no transcoder".to_string(),
            )),
            BufferMode::Ffmpeg => {
                let url = if config.force_http {
                    url.replacen("https://", "http://", 1)
                } else {
                    url.to_string()
                };
                Ok(Self {
                    program: config.ffmpeg_path.clone(),
                    args: ffmpeg_args(&config.ffmpeg_options, &url, user_agent, params),
                })
            }
            BufferMode::Vlc => Ok(Self {
                program: config.vlc_path.clone(),
                args: vlc_args(&config.vlc_options, url, user_agent, params),
            }),
        }
    }
}

fn ffmpeg_args(template: &str, url: &str, user_agent: &str, params: &ProviderParams) -> Vec<String> {
    // Input options have to precede the `-i` they apply to.
    let mut input_opts = Vec::new();
    if !user_agent.is_empty() {
        input_opts.push("-user_agent".to_string());
        input_opts.push(user_agent.to_string());
    }
    if let Some(proxy) = &params.proxy {
        input_opts.push("-http_proxy".to_string());
        input_opts.push(proxy.to_string());
    }
    if !params.headers.is_empty() {
        let headers: String = params
            .headers
            .iter()
            .map(|(k, v)| format!("{}: {}\r\n", k, v))
            .collect();
        input_opts.push("-headers".to_string());
        input_opts.push(headers);
    }

    let tokens: Vec<&str> = template.split_whitespace().collect();
    let insert_at = tokens.iter().position(|t| *t == "-i").unwrap_or(0);

    let mut args = Vec::with_capacity(tokens.len() + input_opts.len());
    for (i, token) in tokens.iter().enumerate() {
        if i == insert_at {
            args.append(&mut input_opts);
        }
        args.push(token.replace(URL_PLACEHOLDER, url));
    }
    args.append(&mut input_opts);
    args
}

fn vlc_args(template: &str, url: &str, user_agent: &str, params: &ProviderParams) -> Vec<String> {
    let mut args = Vec::new();
    for token in template.split_whitespace() {
        let has_url = token.contains(URL_PLACEHOLDER);
        args.push(token.replace(URL_PLACEHOLDER, url));
        if !has_url {
            continue;
        }
        // Input options follow the MRL.
        if !user_agent.is_empty() {
            args.push(format!(":http-user-agent={}", user_agent));
        }
        for (name, value) in &params.headers {
            if name.eq_ignore_ascii_case("referer") {
                args.push(format!(":http-referrer={}", value));
            } else {
                debug!("[Transcoder] VLC has no option for header {}, skipping", name);
            }
        }
    }
    if let Some(proxy) = &params.proxy {
        args.push(format!("--http-proxy={}:{}", proxy.host, proxy.port));
    }
    args
}
