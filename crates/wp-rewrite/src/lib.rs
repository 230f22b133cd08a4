//! Resource rewrite dispatch: picks the transform for a fetched resource and
//! decodes/re-encodes the body around it.

pub mod context;
pub mod dispatcher;
pub mod transform;
pub mod url_rewriter;

pub use context::ContentInfo;
pub use context::ResourceContext;
pub use dispatcher::Dispatcher;
pub use dispatcher::DispatcherConfig;
pub use transform::Transform;
pub use transform::TransformKind;
pub use transform::TransformOutput;
pub use transform::TransformSet;
pub use url_rewriter::UrlRewriter;
