//! Loading [`EngineConfig`] and [`ConnectionConfig`] from outside sources.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::{ConnectionConfig, EngineConfig, FtpSecurityMode};
use percent_encoding::percent_decode_str;
use std::path::Path;
use url::Url;

impl EngineConfig {
    /// Parse a JSON object; missing fields take their defaults.
    pub fn from_json(text: &str) -> FtpResult<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| FtpError::invalid_config(format!("engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> FtpResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            FtpError::invalid_config(format!("cannot read {}: {}", path.display(), e))
                .with_os_error(e.raw_os_error())
        })?;
        log::debug!("config: loading engine settings from {}", path.display());
        Self::from_json(&text)
    }

    pub fn validate(&self) -> FtpResult<()> {
        if self.server_reply_timeout_secs == 0 {
            return Err(FtpError::invalid_config("serverReplyTimeoutSecs must be positive"));
        }
        if self.no_data_transfer_timeout_secs == 0 {
            return Err(FtpError::invalid_config("noDataTransferTimeoutSecs must be positive"));
        }
        if self.flush_buffer_size == 0 {
            return Err(FtpError::invalid_config("flushBufferSize must be positive"));
        }
        if self.keep_alive && self.keep_alive_every_secs == 0 {
            return Err(FtpError::invalid_config("keepAliveEverySecs must be positive"));
        }
        Ok(())
    }
}

impl ConnectionConfig {
    /// Build from `ftp://`, `ftps://` (implicit) or `ftpes://` (explicit)
    /// URLs. The path becomes the initial directory; `?mode=active` turns
    /// passive mode off.
    pub fn from_url(input: &str) -> FtpResult<Self> {
        let url = Url::parse(input).map_err(|e| FtpError::invalid_config(format!("invalid URL '{}': {}", input, e)))?;

        let (security, default_port) = match url.scheme() {
            "ftp" => (FtpSecurityMode::None, 21),
            "ftps" => (FtpSecurityMode::Implicit, 990),
            "ftpes" => (FtpSecurityMode::Explicit, 21),
            other => return Err(FtpError::invalid_config(format!("unsupported scheme '{}'", other))),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| FtpError::invalid_config(format!("URL '{}' has no host", input)))?;
        // Url keeps the brackets of IPv6 literals
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();

        let mut config = ConnectionConfig {
            host,
            port: url.port().unwrap_or(default_port),
            security,
            ..Default::default()
        };
        if !url.username().is_empty() {
            config.user = Some(percent_decode(url.username())?);
            config.password = url.password().map(percent_decode).transpose()?;
        }

        let path = percent_decode(url.path())?;
        if path != "/" && !path.is_empty() {
            config.initial_path = Some(path);
        }
        for (key, value) in url.query_pairs() {
            match (key.as_ref(), value.as_ref()) {
                ("mode", "active") => config.passive = false,
                ("mode", "passive") => config.passive = true,
                _ => log::debug!("config: ignoring URL parameter {}={}", key, value),
            }
        }
        Ok(config)
    }
}

fn percent_decode(text: &str) -> FtpResult<String> {
    percent_decode_str(text)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| FtpError::invalid_config(format!("'{}' is not UTF-8", text)))
}
