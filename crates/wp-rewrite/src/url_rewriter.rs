//! Rewrites resource URLs found in content to proxy URLs.

use crate::context::ResourceContext;
use url::Url;
use wp_net::ResourceType;
use wp_net::url::prepare_url;
use wp_net::url::resolve_url;

/// URL callback handed to a transform for one pass over a resource.
#[derive(Debug, Clone, Copy)]
pub struct UrlRewriter<'a> {
    ctx: &'a ResourceContext,
}

impl<'a> UrlRewriter<'a> {
    pub fn new(ctx: &'a ResourceContext) -> Self {
        Self { ctx }
    }

    /// Returns the proxy URL for `resource_url` as it appears in content.
    ///
    /// `base_url` (a `<base href>` value, possibly protocol-relative) is
    /// resolved against the destination first. The charset passed on is
    /// `charset`, or for scripts the resource's current charset. When the
    /// translator refuses the URL the resolved absolute URL is returned, and
    /// when the URL cannot be resolved it is returned as prepared.
    pub fn rewrite(
        &self,
        resource_url: &str,
        resource_type: Option<ResourceType>,
        charset: Option<&str>,
        base_url: Option<&str>,
    ) -> String {
        let dest = &self.ctx.dest_url;
        let base = base_url.and_then(|base| self.resolve_base(base));
        let base = base.as_ref().unwrap_or(dest);

        let prepared = prepare_url(resource_url);
        let resolved = match resolve_url(base, &prepared) {
            Ok(url) => url,
            Err(error) => {
                log::debug!("leaving URL as written: {error}");
                return prepared;
            }
        };

        let charset = match charset.map(str::trim).filter(|value| !value.is_empty()) {
            Some(value) => Some(value.to_owned()),
            None if resource_type == Some(ResourceType::Script) => Some(self.ctx.charset.label()),
            None => None,
        };

        match self
            .ctx
            .translator
            .to_proxy_url(&resolved, resource_type, charset.as_deref())
        {
            Ok(proxied) => proxied,
            Err(error) => {
                log::debug!("serving `{resolved}` directly: {error}");
                resolved.into()
            }
        }
    }

    fn resolve_base(&self, base: &str) -> Option<Url> {
        let base = prepare_url(base);
        if base.is_empty() {
            return None;
        }

        match resolve_url(&self.ctx.dest_url, &base) {
            Ok(url) => Some(url),
            Err(error) => {
                log::debug!("ignoring base URL: {error}");
                None
            }
        }
    }
}
