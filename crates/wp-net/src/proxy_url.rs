//! Translation of origin URLs into URLs served by the proxy.

use crate::url::is_proxyable;
use ::url::Url;
use wp_core::ProxyError;
use wp_core::ProxyResult;

/// Kind of resource a rewritten URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Script,
    Stylesheet,
    Iframe,
    Form,
    Worker,
}

impl ResourceType {
    /// Single-character flag embedded in proxy URLs.
    pub fn flag(self) -> char {
        match self {
            Self::Script => 's',
            Self::Stylesheet => 'c',
            Self::Iframe => 'i',
            Self::Form => 'f',
            Self::Worker => 'w',
        }
    }
}

/// Produces the proxy URL for an absolute origin URL.
pub trait ProxyUrlTranslator: Send + Sync {
    fn to_proxy_url(
        &self,
        url: &Url,
        resource_type: Option<ResourceType>,
        charset: Option<&str>,
    ) -> ProxyResult<String>;
}

/// Session-scoped translator:
/// `{proxy-origin}/{session}[!{type}][!{charset}]/{origin-url}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProxyTranslator {
    proxy_origin: String,
    session_id: String,
}

impl SessionProxyTranslator {
    pub fn new(proxy_origin: &Url, session_id: impl Into<String>) -> ProxyResult<Self> {
        if !is_proxyable(proxy_origin) {
            return Err(ProxyError::new(
                "net.proxy_url.origin_invalid",
                format!("proxy origin `{proxy_origin}` must be an http(s) URL with a host"),
            ));
        }

        let session_id = session_id.into();
        if session_id.is_empty() || session_id.contains(['/', '!']) {
            return Err(ProxyError::new(
                "net.proxy_url.session_invalid",
                format!("session id `{session_id}` is empty or contains `/` or `!`"),
            ));
        }

        Ok(Self {
            proxy_origin: proxy_origin.origin().ascii_serialization(),
            session_id,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl ProxyUrlTranslator for SessionProxyTranslator {
    fn to_proxy_url(
        &self,
        url: &Url,
        resource_type: Option<ResourceType>,
        charset: Option<&str>,
    ) -> ProxyResult<String> {
        if !is_proxyable(url) {
            return Err(ProxyError::new(
                "net.proxy_url.scheme_unsupported",
                format!("`{url}` cannot be served through the proxy"),
            ));
        }

        let mut descriptor = self.session_id.clone();
        let charset = charset.map(str::trim).filter(|value| !value.is_empty());
        if resource_type.is_some() || charset.is_some() {
            descriptor.push('!');
            if let Some(kind) = resource_type {
                descriptor.push(kind.flag());
            }
        }
        if let Some(charset) = charset {
            descriptor.push('!');
            descriptor.push_str(&charset.to_ascii_lowercase());
        }

        Ok(format!("{}/{descriptor}/{url}", self.proxy_origin))
    }
}
