//! Per-resource state handed to the dispatcher.

use std::sync::Arc;
use url::Url;
use wp_core::ProxyResult;
use wp_net::Charset;
use wp_net::ContentEncoding;
use wp_net::ProxyUrlTranslator;

const PAGE_MIME_TYPES: &[&str] = &["text/html", "application/xhtml+xml", "application/xml"];
const MANIFEST_MIME_TYPES: &[&str] = &["text/cache-manifest"];
const SCRIPT_MIME_TYPES: &[&str] = &[
    "text/javascript",
    "application/javascript",
    "application/x-javascript",
    "text/ecmascript",
    "application/ecmascript",
];
const STYLESHEET_MIME_TYPES: &[&str] = &["text/css"];

/// What the response headers say about a resource.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContentInfo {
    /// Lower-cased MIME type without parameters.
    pub mime: String,
    pub encoding: ContentEncoding,
    pub is_page: bool,
    pub is_manifest: bool,
    pub is_script: bool,
    pub is_stylesheet: bool,
}

impl ContentInfo {
    /// Classifies a resource from its `Content-Type` and `Content-Encoding`
    /// header values.
    pub fn from_headers(content_type: &str, content_encoding: Option<&str>) -> ProxyResult<Self> {
        let encoding = match content_encoding {
            Some(value) => ContentEncoding::parse(value)?,
            None => ContentEncoding::Identity,
        };

        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        Ok(Self {
            is_page: PAGE_MIME_TYPES.contains(&mime.as_str()),
            is_manifest: MANIFEST_MIME_TYPES.contains(&mime.as_str()),
            is_script: SCRIPT_MIME_TYPES.contains(&mime.as_str()),
            is_stylesheet: STYLESHEET_MIME_TYPES.contains(&mime.as_str()),
            mime,
            encoding,
        })
    }

    /// Charset named by the `charset` parameter of a `Content-Type` value.
    pub fn charset_param(content_type: &str) -> Option<&str> {
        content_type.split(';').skip(1).find_map(|param| {
            let (name, value) = param.split_once('=')?;
            if name.trim().eq_ignore_ascii_case("charset") {
                Some(value.trim().trim_matches('"'))
            } else {
                None
            }
        })
    }
}

/// A fetched resource on its way back to the browser.
///
/// The charset is the only part transforms may change; a transform that
/// discovers the real charset (a `<meta charset>` for instance) sets it and
/// asks for a restart.
pub struct ResourceContext {
    pub dest_url: Url,
    pub body: Vec<u8>,
    pub content_info: ContentInfo,
    pub charset: Charset,
    pub translator: Arc<dyn ProxyUrlTranslator>,
}

impl ResourceContext {
    pub fn new(
        dest_url: Url,
        body: Vec<u8>,
        content_info: ContentInfo,
        charset: Charset,
        translator: Arc<dyn ProxyUrlTranslator>,
    ) -> Self {
        Self {
            dest_url,
            body,
            content_info,
            charset,
            translator,
        }
    }
}

impl std::fmt::Debug for ResourceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceContext")
            .field("dest_url", &self.dest_url.as_str())
            .field("body_len", &self.body.len())
            .field("content_info", &self.content_info)
            .field("charset", &self.charset.label())
            .finish_non_exhaustive()
    }
}
