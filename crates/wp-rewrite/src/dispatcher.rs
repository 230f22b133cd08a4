//! Selects a transform for a resource and runs it between decode and encode.

use crate::context::ResourceContext;
use crate::transform::TransformOutput;
use crate::transform::TransformSet;
use crate::url_rewriter::UrlRewriter;
use wp_core::ProxyError;
use wp_core::ProxyResult;
use wp_net::ContentCodec;

const DEFAULT_MAX_RESTARTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Restarts allowed for one resource before the rewrite fails.
    pub max_restarts: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_RESTARTS,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> ProxyResult<()> {
        if self.max_restarts == 0 {
            return Err(ProxyError::new(
                "rewrite.config_invalid",
                "max_restarts must allow at least one restart",
            ));
        }

        Ok(())
    }
}

pub struct Dispatcher {
    transforms: TransformSet,
    codec: Box<dyn ContentCodec>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        transforms: TransformSet,
        codec: Box<dyn ContentCodec>,
        config: DispatcherConfig,
    ) -> ProxyResult<Self> {
        config.validate()?;
        Ok(Self {
            transforms,
            codec,
            config,
        })
    }

    /// Returns the body to send to the browser.
    ///
    /// A resource no transform accepts comes back byte-for-byte. Otherwise
    /// the body is decoded with the context's encoding and charset, passed
    /// through the selected transform and encoded again with the charset as
    /// the transform left it.
    pub fn rewrite(&self, ctx: &mut ResourceContext) -> ProxyResult<Vec<u8>> {
        let mut restarts = 0;

        loop {
            let ctx: &ResourceContext = ctx;
            let Some(transform) = self.transforms.select(ctx) else {
                log::trace!("no transform for {} ({})", ctx.dest_url, ctx.content_info.mime);
                return Ok(ctx.body.clone());
            };

            let encoding = ctx.content_info.encoding;
            let text = self.codec.decode(&ctx.body, encoding, &ctx.charset)?;
            let urls = UrlRewriter::new(ctx);

            match transform.rewrite(&text, ctx, &urls)? {
                TransformOutput::Rewritten(output) => {
                    return self.codec.encode(&output, encoding, &ctx.charset);
                }
                TransformOutput::Restart => {
                    restarts += 1;
                    if restarts > self.config.max_restarts {
                        return Err(ProxyError::new(
                            "rewrite.restart_limit_exceeded",
                            format!(
                                "{} transform restarted {} more than {} times",
                                transform.kind().as_str(),
                                ctx.dest_url,
                                self.config.max_restarts
                            ),
                        ));
                    }
                    log::debug!(
                        "{} transform restarted {} with charset {}",
                        transform.kind().as_str(),
                        ctx.dest_url,
                        ctx.charset.label()
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("transforms", &self.transforms)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::Dispatcher;
    use super::DispatcherConfig;
    use crate::context::ContentInfo;
    use crate::context::ResourceContext;
    use crate::transform::Transform;
    use crate::transform::TransformKind;
    use crate::transform::TransformOutput;
    use crate::transform::TransformSet;
    use crate::url_rewriter::UrlRewriter;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::PoisonError;
    use url::Url;
    use wp_core::ProxyResult;
    use wp_net::Charset;
    use wp_net::ContentEncoding;
    use wp_net::ResourceType;
    use wp_net::SessionProxyTranslator;
    use wp_net::StandardCodec;
    use wp_net::codec::compress;
    use wp_net::codec::decompress;

    // "привет" in windows-1251.
    const CP1251_GREETING: &[u8] = &[0xEF, 0xF0, 0xE8, 0xE2, 0xE5, 0xF2];

    #[derive(Clone, Copy)]
    enum Behavior {
        Upper,
        RewriteScriptSrc,
        RestartOnceAs(&'static str),
        AlwaysRestart,
    }

    /// What a fake transform saw, shared with the test body.
    #[derive(Default)]
    struct Observed {
        seen: Mutex<Vec<String>>,
    }

    impl Observed {
        fn seen(&self) -> Vec<String> {
            self.seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    struct Fake {
        kind: TransformKind,
        behavior: Behavior,
        observer: Arc<Observed>,
    }

    impl Transform for Fake {
        fn kind(&self) -> TransformKind {
            self.kind
        }

        fn rewrite(
            &self,
            text: &str,
            ctx: &ResourceContext,
            urls: &UrlRewriter<'_>,
        ) -> ProxyResult<TransformOutput> {
            let calls = {
                let mut seen = self.observer.seen.lock().unwrap_or_else(PoisonError::into_inner);
                seen.push(text.to_owned());
                seen.len()
            };

            Ok(match self.behavior {
                Behavior::Upper => TransformOutput::Rewritten(text.to_uppercase()),
                Behavior::RewriteScriptSrc => TransformOutput::Rewritten(urls.rewrite(
                    text,
                    Some(ResourceType::Script),
                    None,
                    None,
                )),
                Behavior::RestartOnceAs(label) if calls == 1 => {
                    ctx.charset.set_label(label);
                    TransformOutput::Restart
                }
                Behavior::RestartOnceAs(_) => TransformOutput::Rewritten(text.to_owned()),
                Behavior::AlwaysRestart => TransformOutput::Restart,
            })
        }
    }

    struct Harness {
        observers: [Arc<Observed>; 4],
        dispatcher: Dispatcher,
    }

    fn harness(behaviors: [Behavior; 4], config: DispatcherConfig) -> Harness {
        let observers: [Arc<Observed>; 4] = Default::default();
        let fake = |index: usize| -> Box<dyn Transform> {
            Box::new(Fake {
                kind: TransformKind::ORDER[index],
                behavior: behaviors[index],
                observer: Arc::clone(&observers[index]),
            })
        };
        let transforms = match TransformSet::new(fake(0), fake(1), fake(2), fake(3)) {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        };
        let dispatcher = match Dispatcher::new(transforms, Box::new(StandardCodec), config) {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        };
        Harness { observers, dispatcher }
    }

    fn upper_everywhere() -> Harness {
        harness([Behavior::Upper; 4], DispatcherConfig::default())
    }

    fn context(body: &[u8], info: ContentInfo) -> ResourceContext {
        let dest = match Url::parse("https://site.example/page") {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        };
        let proxy = match Url::parse("http://localhost:1337/") {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        };
        let translator = match SessionProxyTranslator::new(&proxy, "s1") {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        };
        ResourceContext::new(
            dest,
            body.to_vec(),
            info,
            Charset::default(),
            Arc::new(translator),
        )
    }

    fn script_info() -> ContentInfo {
        ContentInfo {
            mime: "application/javascript".to_owned(),
            is_script: true,
            ..ContentInfo::default()
        }
    }

    #[test]
    fn only_the_matching_transform_runs() {
        let harness = upper_everywhere();
        let mut ctx = context(b"let a = 1;", script_info());

        let output = harness.dispatcher.rewrite(&mut ctx);
        assert_eq!(output, Ok(b"LET A = 1;".to_vec()));

        let calls: Vec<usize> = harness.observers.iter().map(|observer| observer.seen().len()).collect();
        assert_eq!(calls, vec![0, 0, 1, 0]);
    }

    #[test]
    fn unmatched_body_is_returned_byte_for_byte() {
        let harness = upper_everywhere();
        // Not valid UTF-8 and not gzip despite the header: it must never be decoded.
        let body = [0x89, b'P', b'N', b'G', 0xFF, 0x00];
        let mut ctx = context(
            &body,
            ContentInfo {
                mime: "image/png".to_owned(),
                encoding: ContentEncoding::Gzip,
                ..ContentInfo::default()
            },
        );

        assert_eq!(harness.dispatcher.rewrite(&mut ctx), Ok(body.to_vec()));
        assert!(harness.observers.iter().all(|observer| observer.seen().is_empty()));
    }

    #[test]
    fn compressed_body_is_decoded_and_reencoded() {
        let harness = upper_everywhere();
        let body = match compress(b"body { color: red }", ContentEncoding::Gzip) {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        };
        let mut ctx = context(
            &body,
            ContentInfo {
                mime: "text/css".to_owned(),
                encoding: ContentEncoding::Gzip,
                is_stylesheet: true,
                ..ContentInfo::default()
            },
        );

        let output = match harness.dispatcher.rewrite(&mut ctx) {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        };
        assert_eq!(
            decompress(&output, ContentEncoding::Gzip),
            Ok(b"BODY { COLOR: RED }".to_vec())
        );
        assert_eq!(harness.observers[3].seen(), vec!["body { color: red }"]);
    }

    #[test]
    fn restart_reruns_once_with_mutated_charset() {
        let harness = harness(
            [
                Behavior::Upper,
                Behavior::Upper,
                Behavior::RestartOnceAs("windows-1251"),
                Behavior::Upper,
            ],
            DispatcherConfig::default(),
        );
        let mut ctx = context(CP1251_GREETING, script_info());

        let output = harness.dispatcher.rewrite(&mut ctx);
        assert_eq!(output, Ok(CP1251_GREETING.to_vec()));

        let seen = harness.observers[2].seen();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0], "привет");
        assert_eq!(seen[1], "привет");
        assert_eq!(ctx.charset.label(), "windows-1251");
    }

    #[test]
    fn endless_restarts_hit_the_limit() {
        let harness = harness(
            [
                Behavior::AlwaysRestart,
                Behavior::Upper,
                Behavior::Upper,
                Behavior::Upper,
            ],
            DispatcherConfig { max_restarts: 3 },
        );
        let mut ctx = context(
            b"<html></html>",
            ContentInfo {
                mime: "text/html".to_owned(),
                is_page: true,
                ..ContentInfo::default()
            },
        );

        let output = harness.dispatcher.rewrite(&mut ctx);
        assert!(output.is_err());
        if let Err(error) = output {
            assert_eq!(error.code, "rewrite.restart_limit_exceeded");
        }
        assert_eq!(harness.observers[0].seen().len(), 4);
    }

    #[test]
    fn transforms_rewrite_urls_through_the_translator() {
        let harness = harness(
            [
                Behavior::Upper,
                Behavior::Upper,
                Behavior::RewriteScriptSrc,
                Behavior::Upper,
            ],
            DispatcherConfig::default(),
        );
        let mut ctx = context(b"/lib.js", script_info());

        let output = harness.dispatcher.rewrite(&mut ctx);
        assert_eq!(
            output,
            Ok(b"http://localhost:1337/s1!s!utf-8/https://site.example/lib.js".to_vec())
        );
    }

    #[test]
    fn corrupt_compressed_body_is_an_error() {
        let harness = upper_everywhere();
        let mut ctx = context(
            b"definitely not gzip",
            ContentInfo {
                encoding: ContentEncoding::Gzip,
                ..script_info()
            },
        );
        assert!(harness.dispatcher.rewrite(&mut ctx).is_err());
    }

    #[test]
    fn zero_restart_budget_is_rejected() {
        assert!(DispatcherConfig { max_restarts: 0 }.validate().is_err());
        assert!(DispatcherConfig::default().validate().is_ok());
    }
}
