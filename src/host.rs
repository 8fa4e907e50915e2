//! Capabilities the chat host provides. Any host that satisfies these traits can drive
//! the recorder and the command surface.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::EchoAvatarError;

/// One inbound chat message as delivered by the host's event source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub sender_id: String,
    pub text: String,
    /// Seconds since the Unix epoch, as stamped by the host.
    pub timestamp: i64,
}

/// Reference to an image produced by the rendering collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedImage {
    pub path: PathBuf,
}

/// What a command hands back to the host. A single command may yield several replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    Text(String),
    Image(RenderedImage),
    /// A prompt the host should submit on its asynchronous LLM path and relay to the caller.
    LlmRequest { prompt: String },
}

impl CommandReply {
    pub fn text(s: impl Into<String>) -> Self {
        CommandReply::Text(s.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CommandReply::Text(s) => Some(s),
            _ => None,
        }
    }
}

pub trait PermissionGate: Send + Sync {
    fn is_privileged(&self, caller_id: &str) -> bool;
}

/// Admin list taken from configuration.
pub struct AdminList {
    admins: Vec<String>,
}

impl AdminList {
    pub fn new(admins: Vec<String>) -> Self {
        AdminList { admins }
    }
}

impl PermissionGate for AdminList {
    fn is_privileged(&self, caller_id: &str) -> bool {
        self.admins.iter().any(|id| id == caller_id)
    }
}

pub type ReplyStream = mpsc::Receiver<Result<String, EchoAvatarError>>;

#[async_trait]
pub trait LlmClient: Send + Sync + 'static {
    /// Complete `prompt` and return the reply text, or `None` when the model produced nothing.
    async fn complete(&self, prompt: &str) -> Result<Option<String>, EchoAvatarError>;

    /// Submit `prompt` in the background and stream the reply. The default delivers the
    /// whole completion as a single chunk. Must be called inside a tokio runtime.
    fn stream(self: Arc<Self>, prompt: String) -> ReplyStream {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let chunk = match self.complete(&prompt).await {
                Ok(Some(text)) => Ok(text),
                Ok(None) => Err(EchoAvatarError::EmptyReply),
                Err(e) => Err(e),
            };
            let _ = tx.send(chunk).await;
        });
        rx
    }
}

#[async_trait]
pub trait HtmlRenderer: Send + Sync {
    async fn render(
        &self,
        template: &str,
        data: &serde_json::Value,
    ) -> Result<RenderedImage, EchoAvatarError>;
}
