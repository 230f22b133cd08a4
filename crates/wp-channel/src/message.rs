//! Control message types and their JSON wire shape.

use serde::Deserialize;
use serde::Serialize;
use wp_core::ProxyError;
use wp_core::ProxyResult;

/// Discriminator grouping messages that must be delivered in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandId {
    SetCookie,
    GetIframeTaskScript,
    UploadFiles,
    GetUploadedFiles,
}

impl CommandId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SetCookie => "setCookie",
            Self::GetIframeTaskScript => "getIframeTaskScript",
            Self::UploadFiles => "uploadFiles",
            Self::GetUploadedFiles => "getUploadedFiles",
        }
    }
}

/// Command issued by the in-page agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum ControlMessage {
    /// Mirrors a `document.cookie` write to the proxy's cookie jar.
    SetCookie { url: String, cookie: String },
    GetIframeTaskScript {},
    UploadFiles {
        data: Vec<String>,
        #[serde(rename = "fileNames")]
        file_names: Vec<String>,
    },
    GetUploadedFiles {
        #[serde(rename = "filePaths")]
        file_paths: Vec<String>,
    },
}

impl ControlMessage {
    pub fn command(&self) -> CommandId {
        match self {
            Self::SetCookie { .. } => CommandId::SetCookie,
            Self::GetIframeTaskScript {} => CommandId::GetIframeTaskScript,
            Self::UploadFiles { .. } => CommandId::UploadFiles,
            Self::GetUploadedFiles { .. } => CommandId::GetUploadedFiles,
        }
    }
}

/// Wire envelope: the command fields plus session bookkeeping.
///
/// ```json
/// { "cmd": "setCookie", "sessionId": "s1", "referer": "...", "url": "...", "cookie": "..." }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMessage {
    #[serde(flatten)]
    pub message: ControlMessage,
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
}

impl ServiceMessage {
    /// Unstamped envelope; the channel fills in session data before sending.
    pub fn new(message: ControlMessage) -> Self {
        Self {
            message,
            session_id: String::new(),
            referer: None,
        }
    }

    pub fn command(&self) -> CommandId {
        self.message.command()
    }

    pub fn to_json(&self) -> ProxyResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|error| {
            ProxyError::new(
                "channel.message_encode_failed",
                format!(
                    "failed to serialize `{}` message: {error}",
                    self.command().as_str()
                ),
            )
        })
    }
}
