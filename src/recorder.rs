use std::sync::Arc;

use tracing::{debug, error};

use crate::config::ConfigProvider;
use crate::db::{call_blocking, StoreRoot};
use crate::host::InboundMessage;
use crate::text::snippet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// Sender not allow-listed, or the message had no text.
    Ignored,
    /// Storage failed; already logged.
    Failed,
}

/// Appends messages from allow-listed senders to their stores.
pub struct MessageRecorder {
    config: Arc<dyn ConfigProvider>,
    stores: Arc<StoreRoot>,
}

impl MessageRecorder {
    pub fn new(config: Arc<dyn ConfigProvider>, stores: Arc<StoreRoot>) -> Self {
        MessageRecorder { config, stores }
    }

    /// Never fails: storage errors are logged and reported as `Failed`.
    pub async fn on_message(&self, event: &InboundMessage) -> RecordOutcome {
        // Re-read per event so allow-list edits apply without a restart.
        let target_users = self.config.target_users();
        if !target_users.iter().any(|id| id == &event.sender_id) {
            return RecordOutcome::Ignored;
        }
        if event.text.trim().is_empty() {
            return RecordOutcome::Ignored;
        }

        let sender_id = event.sender_id.clone();
        let text = event.text.clone();
        let timestamp = event.timestamp;
        let result = call_blocking(self.stores.clone(), move |root| {
            root.ensure_schema(&sender_id)?;
            root.append_message(&sender_id, &text, timestamp)
        })
        .await;

        match result {
            Ok(Some(row_id)) => {
                debug!(
                    user_id = %event.sender_id,
                    row_id,
                    text = %snippet(&event.text, 40),
                    "recorded message"
                );
                RecordOutcome::Recorded
            }
            Ok(None) => RecordOutcome::Ignored,
            Err(e) => {
                error!(
                    operation = "append_message",
                    user_id = %event.sender_id,
                    "failed to record message: {e}"
                );
                RecordOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfig;
    use std::path::PathBuf;

    fn setup(users: &[&str]) -> (MessageRecorder, Arc<StaticConfig>, Arc<StoreRoot>, PathBuf) {
        let dir =
            std::env::temp_dir().join(format!("echo_avatar_recorder_{}", uuid::Uuid::new_v4()));
        let stores = Arc::new(StoreRoot::new(&dir).unwrap());
        let config = Arc::new(StaticConfig::new(
            users.iter().map(|s| s.to_string()).collect(),
        ));
        let recorder = MessageRecorder::new(config.clone(), stores.clone());
        (recorder, config, stores, dir)
    }

    fn msg(sender: &str, text: &str, ts: i64) -> InboundMessage {
        InboundMessage {
            sender_id: sender.into(),
            text: text.into(),
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_only_allow_listed_senders_are_recorded() {
        let (recorder, _config, stores, dir) = setup(&["1001"]);
        assert_eq!(
            recorder.on_message(&msg("1001", "hello", 1)).await,
            RecordOutcome::Recorded
        );
        assert_eq!(
            recorder.on_message(&msg("2002", "not me", 2)).await,
            RecordOutcome::Ignored
        );
        assert_eq!(stores.list_all_user_ids().unwrap(), vec!["1001"]);
        assert!(!stores.store_exists("2002").unwrap());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_each_message_one_row_in_arrival_order() {
        let (recorder, _config, stores, dir) = setup(&["1001"]);
        for text in ["a", "b", "", "c", "   "] {
            recorder.on_message(&msg("1001", text, 50)).await;
        }
        let store = stores.open_existing("1001").unwrap();
        let texts: Vec<String> = store
            .list_all_messages()
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_allow_list_changes_apply_immediately() {
        let (recorder, config, stores, dir) = setup(&[]);
        assert_eq!(
            recorder.on_message(&msg("1001", "early", 1)).await,
            RecordOutcome::Ignored
        );
        config.set_target_users(vec!["1001".into()]);
        assert_eq!(
            recorder.on_message(&msg("1001", "later", 2)).await,
            RecordOutcome::Recorded
        );
        assert_eq!(stores.count_messages("1001").unwrap(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_storage_failure_is_swallowed() {
        let (recorder, _config, _stores, dir) = setup(&["bad/id"]);
        assert_eq!(
            recorder.on_message(&msg("bad/id", "hello", 1)).await,
            RecordOutcome::Failed
        );
        let _ = std::fs::remove_dir_all(&dir);
    }
}
