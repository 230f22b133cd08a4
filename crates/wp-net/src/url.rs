//! URL preparation and resolution helpers.

use ::url::Url;
use wp_core::ProxyError;
use wp_core::ProxyResult;

/// Schemes the proxy can fetch on behalf of the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn from_url(url: &Url) -> Option<Self> {
        match url.scheme() {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// Normalizes a raw URL taken from page markup.
///
/// Leading/trailing whitespace is trimmed and embedded tab and newline
/// characters are dropped, matching how browsers read attribute URLs.
pub fn prepare_url(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|ch| !matches!(ch, '\t' | '\n' | '\r'))
        .collect()
}

/// Parses an absolute URL.
pub fn parse_absolute(input: &str) -> ProxyResult<Url> {
    Url::parse(input).map_err(|error| {
        ProxyError::new(
            "net.url.invalid",
            format!("failed to parse URL `{input}`: {error}"),
        )
    })
}

/// Resolves `reference` against `base`.
///
/// Protocol-relative references (`//host/path`) inherit the scheme of
/// `base`.
pub fn resolve_url(base: &Url, reference: &str) -> ProxyResult<Url> {
    base.join(reference).map_err(|error| {
        ProxyError::new(
            "net.url.unresolvable",
            format!("failed to resolve `{reference}` against `{base}`: {error}"),
        )
    })
}

/// Returns true when the URL targets a scheme the proxy can serve.
pub fn is_proxyable(url: &Url) -> bool {
    Scheme::from_url(url).is_some() && url.host_str().is_some()
}
