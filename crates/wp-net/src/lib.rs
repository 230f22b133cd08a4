//! Networking contracts: URL resolution, content codecs, proxy URL
//! translation, and the control-message service transport.

pub mod codec;
pub mod proxy_url;
pub mod transport;
pub mod url;

pub use codec::Charset;
pub use codec::ContentCodec;
pub use codec::ContentEncoding;
pub use codec::StandardCodec;
pub use proxy_url::ProxyUrlTranslator;
pub use proxy_url::ResourceType;
pub use proxy_url::SessionProxyTranslator;
pub use transport::HttpServiceTransport;
pub use transport::ServiceResponse;
pub use transport::ServiceTransport;
