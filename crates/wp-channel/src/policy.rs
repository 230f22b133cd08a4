//! What to do when a control message fails at the transport level.

/// Browser engine family hosting the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineFamily {
    /// WebKit and its Blink descendants.
    WebKit,
    Gecko,
    Trident,
    Other,
}

impl EngineFamily {
    pub fn from_user_agent(user_agent: &str) -> Self {
        if user_agent.contains("Trident/") || user_agent.contains("MSIE ") {
            Self::Trident
        } else if user_agent.contains("Edge/") {
            Self::Other
        } else if user_agent.contains("AppleWebKit/") {
            Self::WebKit
        } else if user_agent.contains("Gecko/") {
            Self::Gecko
        } else {
            Self::Other
        }
    }
}

/// Recovery applied to a failed, non-forced send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Re-issue once, forced synchronous. A failure of that retry is final.
    RetrySynchronously,
    /// Park the message in the persistent store and complete the send with
    /// no response.
    PersistAndComplete,
}

/// Transport reliability policy.
///
/// Engines that may report an error for a request the server actually
/// processed must not retry, or the command would run twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliabilityPolicy {
    pub failure_signaling_trustworthy: bool,
}

impl Default for ReliabilityPolicy {
    fn default() -> Self {
        Self::trustworthy()
    }
}

impl ReliabilityPolicy {
    pub fn trustworthy() -> Self {
        Self {
            failure_signaling_trustworthy: true,
        }
    }

    pub fn untrustworthy() -> Self {
        Self {
            failure_signaling_trustworthy: false,
        }
    }

    pub fn for_engine(engine: EngineFamily) -> Self {
        match engine {
            EngineFamily::WebKit => Self::untrustworthy(),
            EngineFamily::Gecko | EngineFamily::Trident | EngineFamily::Other => {
                Self::trustworthy()
            }
        }
    }

    pub fn on_failure(self) -> FailureAction {
        if self.failure_signaling_trustworthy {
            FailureAction::RetrySynchronously
        } else {
            FailureAction::PersistAndComplete
        }
    }
}
