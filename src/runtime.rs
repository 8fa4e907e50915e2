use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use crate::commands::handle_chat_command;
use crate::config::{Config, ConfigProvider};
use crate::db::StoreRoot;
use crate::error::EchoAvatarError;
use crate::host::{
    AdminList, CommandReply, HtmlRenderer, InboundMessage, LlmClient, PermissionGate,
};
use crate::preview::FileHtmlRenderer;
use crate::recorder::MessageRecorder;

pub struct AppState {
    /// Settings captured at startup. The allow-list is read through `config` instead.
    pub settings: Config,
    pub config: Arc<dyn ConfigProvider>,
    pub stores: Arc<StoreRoot>,
    pub gate: Arc<dyn PermissionGate>,
    pub llm: Arc<dyn LlmClient>,
    pub renderer: Arc<dyn HtmlRenderer>,
    pub recorder: MessageRecorder,
}

impl AppState {
    pub fn new(
        settings: Config,
        config: Arc<dyn ConfigProvider>,
        stores: Arc<StoreRoot>,
        gate: Arc<dyn PermissionGate>,
        llm: Arc<dyn LlmClient>,
        renderer: Arc<dyn HtmlRenderer>,
    ) -> Self {
        let recorder = MessageRecorder::new(config.clone(), stores.clone());
        AppState {
            settings,
            config,
            stores,
            gate,
            llm,
            renderer,
            recorder,
        }
    }

    /// Wire the default collaborators: on-disk stores, config admins, HTTP LLM, HTML files.
    pub fn from_config(
        settings: Config,
        config: Arc<dyn ConfigProvider>,
        extra_privileged: Option<String>,
    ) -> Result<Self, EchoAvatarError> {
        let stores = Arc::new(StoreRoot::new(settings.user_data_dir())?);
        let mut admins = settings.admin_ids.clone();
        admins.extend(extra_privileged);
        let gate: Arc<dyn PermissionGate> = Arc::new(AdminList::new(admins));
        let llm = crate::llm::create_llm_client(&settings)?;
        let renderer: Arc<dyn HtmlRenderer> =
            Arc::new(FileHtmlRenderer::new(settings.previews_dir()));
        Ok(AppState::new(settings, config, stores, gate, llm, renderer))
    }
}

/// Commands are dispatched; everything else goes to the recorder.
pub async fn handle_event(state: &AppState, event: &InboundMessage) -> Vec<CommandReply> {
    if let Some(replies) = handle_chat_command(state, &event.sender_id, &event.text).await {
        return replies;
    }
    state.recorder.on_message(event).await;
    Vec::new()
}

/// One line of `listen` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundLine {
    Text { to: String, text: String },
    Image { to: String, path: String },
    Error { to: String, error: String },
}

/// Resolve a reply into output lines. `LlmRequest` is submitted and its stream relayed.
pub async fn deliver_reply(state: &AppState, to: &str, reply: CommandReply) -> Vec<OutboundLine> {
    match reply {
        CommandReply::Text(text) => vec![OutboundLine::Text {
            to: to.to_string(),
            text,
        }],
        CommandReply::Image(image) => vec![OutboundLine::Image {
            to: to.to_string(),
            path: image.path.display().to_string(),
        }],
        CommandReply::LlmRequest { prompt } => {
            let mut stream = state.llm.clone().stream(prompt);
            let mut lines = Vec::new();
            while let Some(chunk) = stream.recv().await {
                match chunk {
                    Ok(text) => lines.push(OutboundLine::Text {
                        to: to.to_string(),
                        text,
                    }),
                    Err(e) => {
                        warn!(user_id = to, "LLM stream failed: {e}");
                        lines.push(OutboundLine::Error {
                            to: to.to_string(),
                            error: "LLM call failed or returned nothing.".into(),
                        });
                    }
                }
            }
            lines
        }
    }
}

/// Read JSON-lines `InboundMessage`s until EOF, writing replies as JSON lines.
pub async fn run_listen<R, W>(
    state: &AppState,
    reader: R,
    mut writer: W,
) -> Result<(), EchoAvatarError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    info!(
        data_dir = %state.settings.data_dir,
        users = state.config.target_users().len(),
        "listening for events on stdin"
    );
    let mut lines = reader.lines();
    let mut handled = 0usize;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: InboundMessage = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(e) => {
                warn!("skipping malformed event: {e}");
                continue;
            }
        };
        handled += 1;
        for reply in handle_event(state, &event).await {
            for out in deliver_reply(state, &event.sender_id, reply).await {
                let mut json = serde_json::to_string(&out)?;
                json.push('\n');
                writer.write_all(json.as_bytes()).await?;
            }
        }
        writer.flush().await?;
    }
    info!(events = handled, "input closed");
    Ok(())
}
