//! Reliable control channel from the in-page agent to the proxy server.
//!
//! Messages that share a [`CommandId`] are delivered one at a time in
//! submission order. Transport failures are absorbed: a message is either
//! retried once synchronously or parked in the [`MessageStore`] for replay on
//! the next channel start, depending on the [`ReliabilityPolicy`].

pub mod channel;
pub mod message;
pub mod policy;
pub mod settings;
pub mod store;

pub use channel::ControlChannel;
pub use channel::SendMode;
pub use message::CommandId;
pub use message::ControlMessage;
pub use message::ServiceMessage;
pub use policy::EngineFamily;
pub use policy::FailureAction;
pub use policy::ReliabilityPolicy;
pub use settings::ChannelSettings;
pub use store::MessageStore;
