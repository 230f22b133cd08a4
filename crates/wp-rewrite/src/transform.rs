//! Content transforms and the ordered set the dispatcher picks from.

use crate::context::ResourceContext;
use crate::url_rewriter::UrlRewriter;
use wp_core::ProxyError;
use wp_core::ProxyResult;

/// Resource family a transform handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformKind {
    Page,
    Manifest,
    Script,
    Stylesheet,
}

impl TransformKind {
    /// Selection order.
    pub const ORDER: [Self; 4] = [Self::Page, Self::Manifest, Self::Script, Self::Stylesheet];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::Manifest => "manifest",
            Self::Script => "script",
            Self::Stylesheet => "stylesheet",
        }
    }
}

/// Result of one transform pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformOutput {
    Rewritten(String),
    /// Start over from selection with the context as the transform left it.
    Restart,
}

pub trait Transform: Send + Sync {
    fn kind(&self) -> TransformKind;

    /// Whether this transform applies to `ctx`. Defaults to the
    /// classification flag for the transform's kind.
    fn matches(&self, ctx: &ResourceContext) -> bool {
        let info = &ctx.content_info;
        match self.kind() {
            TransformKind::Page => info.is_page,
            TransformKind::Manifest => info.is_manifest,
            TransformKind::Script => info.is_script,
            TransformKind::Stylesheet => info.is_stylesheet,
        }
    }

    fn rewrite(
        &self,
        text: &str,
        ctx: &ResourceContext,
        urls: &UrlRewriter<'_>,
    ) -> ProxyResult<TransformOutput>;
}

/// One transform per kind, tried in [`TransformKind::ORDER`].
pub struct TransformSet {
    slots: [Box<dyn Transform>; 4],
}

impl TransformSet {
    pub fn new(
        page: Box<dyn Transform>,
        manifest: Box<dyn Transform>,
        script: Box<dyn Transform>,
        stylesheet: Box<dyn Transform>,
    ) -> ProxyResult<Self> {
        let slots = [page, manifest, script, stylesheet];
        for (slot, expected) in slots.iter().zip(TransformKind::ORDER) {
            if slot.kind() != expected {
                return Err(ProxyError::new(
                    "rewrite.transform_slot_mismatch",
                    format!(
                        "{} transform registered in the {} slot",
                        slot.kind().as_str(),
                        expected.as_str()
                    ),
                ));
            }
        }

        Ok(Self { slots })
    }

    /// First transform whose predicate accepts `ctx`.
    pub fn select(&self, ctx: &ResourceContext) -> Option<&dyn Transform> {
        self.slots
            .iter()
            .map(Box::as_ref)
            .find(|transform| transform.matches(ctx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Transform> {
        self.slots.iter().map(Box::as_ref)
    }
}

impl std::fmt::Debug for TransformSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|transform| transform.kind()))
            .finish()
    }
}
