//! Settings handed to the in-page agent by the proxy.

use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;
use wp_core::ProxyError;
use wp_core::ProxyResult;
use wp_net::url::parse_absolute;

const DEFAULT_UNLOAD_GRACE_MS: u64 = 2000;
const DEFAULT_QUIESCENCE_POLL_MS: u64 = 50;

/// Channel configuration, deserialized from the settings document the proxy
/// injects into each page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelSettings {
    /// Endpoint control messages are POSTed to.
    pub service_msg_url: String,
    pub session_id: String,
    /// Address of the page hosting an address-less frame.
    pub referer: Option<String>,
    /// Set when the agent runs in a frame without its own URL (`about:blank`
    /// or `srcdoc`), where the server cannot infer the referer itself.
    pub addressless_frame: bool,
    /// How long synchronous sending stays forced after an unload signal.
    pub unload_grace_ms: u64,
    pub quiescence_poll_ms: u64,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            service_msg_url: String::new(),
            session_id: String::new(),
            referer: None,
            addressless_frame: false,
            unload_grace_ms: DEFAULT_UNLOAD_GRACE_MS,
            quiescence_poll_ms: DEFAULT_QUIESCENCE_POLL_MS,
        }
    }
}

impl ChannelSettings {
    pub fn new(service_msg_url: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            service_msg_url: service_msg_url.into(),
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    /// Parses and validates a JSON settings document.
    pub fn from_json(document: &str) -> ProxyResult<Self> {
        let settings: Self = serde_json::from_str(document).map_err(|error| {
            ProxyError::new(
                "channel.settings_invalid",
                format!("failed to parse channel settings: {error}"),
            )
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> ProxyResult<()> {
        if self.service_msg_url.trim().is_empty() {
            return Err(ProxyError::new(
                "channel.service_url_missing",
                "channel settings must name a service message URL",
            ));
        }

        parse_absolute(self.service_msg_url.trim()).map_err(|error| {
            ProxyError::new(
                "channel.service_url_invalid",
                format!("service message URL must be absolute: {error}"),
            )
        })?;

        if self.session_id.is_empty() {
            return Err(ProxyError::new(
                "channel.session_missing",
                "channel settings must carry a session id",
            ));
        }

        if self.quiescence_poll_ms == 0 {
            return Err(ProxyError::new(
                "channel.poll_interval_invalid",
                "quiescence poll interval must be greater than zero",
            ));
        }

        if self.addressless_frame && self.referer.is_none() {
            log::warn!("address-less frame configured without a referer; messages go out without one");
        }

        Ok(())
    }

    pub fn unload_grace(&self) -> Duration {
        Duration::from_millis(self.unload_grace_ms)
    }

    pub fn quiescence_poll(&self) -> Duration {
        Duration::from_millis(self.quiescence_poll_ms)
    }
}
