use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Serialize;

use crate::db::{SortOrder, StoreRoot};
use crate::error::EchoAvatarError;
use crate::host::{HtmlRenderer, RenderedImage};
use crate::template::{self, escape_html};

pub const PREVIEW_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Echo Avatar · {user_id}</title>
<style>
body {{ font-family: sans-serif; background: #f6f7fb; color: #222; margin: 24px; }}
h1 {{ font-size: 20px; }}
section {{ background: #fff; border-radius: 8px; padding: 12px 16px; margin-bottom: 12px; }}
h2 {{ font-size: 15px; margin: 0 0 8px; }}
li {{ margin: 4px 0; }}
.meta {{ color: #888; font-size: 12px; margin-left: 6px; }}
.stats {{ color: #555; }}
</style>
</head>
<body>
<h1>{user_id} <span class="meta">nickname: {nickname}</span></h1>
<p class="stats">{message_count} messages recorded for this user · {total_stores} stores in total</p>
<section><h2>Annotations</h2><ul>{annotations}</ul></section>
<section><h2>Memories</h2><ul>{memories}</ul></section>
<section><h2>Recent messages</h2><ul>{recent_messages}</ul></section>
<p class="meta">generated {generated_at}</p>
</body>
</html>
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewEntry {
    pub text: String,
    pub meta: String,
}

/// Snapshot of one user's store for human review. Lists are newest first.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewData {
    pub user_id: String,
    pub nickname: String,
    pub annotations: Vec<PreviewEntry>,
    pub memories: Vec<PreviewEntry>,
    pub recent_messages: Vec<PreviewEntry>,
    pub total_stores: usize,
    pub message_count: i64,
    pub generated_at: String,
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

pub fn collect_preview(
    root: &StoreRoot,
    user_id: &str,
    recent_limit: usize,
) -> Result<PreviewData, EchoAvatarError> {
    let store = root.open_existing(user_id)?;
    let annotations = store
        .list_annotations(SortOrder::Descending)?
        .into_iter()
        .map(|a| PreviewEntry {
            meta: format!("by {} · {}", a.added_by, format_timestamp(a.timestamp)),
            text: a.text,
        })
        .collect();
    let memories = store
        .list_memories(SortOrder::Descending)?
        .into_iter()
        .map(|m| PreviewEntry {
            meta: format!("by {} · {}", m.added_by, format_timestamp(m.timestamp)),
            text: m.text,
        })
        .collect();
    let recent_messages = store
        .list_recent_messages(recent_limit, SortOrder::Descending)?
        .into_iter()
        .map(|m| PreviewEntry {
            meta: format_timestamp(m.timestamp),
            text: m.text,
        })
        .collect();
    let nickname = store
        .nickname()?
        .unwrap_or_else(|| crate::composer::NICKNAME_NOT_SET.to_string());
    let message_count = store.count_messages()?;
    drop(store);

    Ok(PreviewData {
        user_id: user_id.to_string(),
        nickname,
        annotations,
        memories,
        recent_messages,
        total_stores: root.list_all_user_ids()?.len(),
        message_count,
        generated_at: Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    })
}

fn html_list_items(items: &[serde_json::Value]) -> String {
    if items.is_empty() {
        return "<li class=\"meta\">(none)</li>".to_string();
    }
    items
        .iter()
        .map(|item| {
            let text = item
                .get("text")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| plain_value(item));
            match item.get("meta").and_then(|v| v.as_str()) {
                Some(meta) => format!(
                    "<li>{}<span class=\"meta\">{}</span></li>",
                    escape_html(&text),
                    escape_html(meta)
                ),
                None => format!("<li>{}</li>", escape_html(&text)),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn plain_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Turn a JSON record into HTML-safe template values: arrays become `<li>` lists.
pub fn html_vars(data: &serde_json::Value) -> Result<HashMap<&str, String>, EchoAvatarError> {
    let object = data
        .as_object()
        .ok_or_else(|| EchoAvatarError::Render("preview data must be an object".into()))?;
    Ok(object
        .iter()
        .map(|(key, value)| {
            let rendered = match value {
                serde_json::Value::Array(items) => html_list_items(items),
                other => escape_html(&plain_value(other)),
            };
            (key.as_str(), rendered)
        })
        .collect())
}

/// Writes the filled template to an `.html` file; rasterising it is left to the host.
pub struct FileHtmlRenderer {
    out_dir: PathBuf,
}

impl FileHtmlRenderer {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        FileHtmlRenderer {
            out_dir: out_dir.into(),
        }
    }
}

#[async_trait]
impl HtmlRenderer for FileHtmlRenderer {
    async fn render(
        &self,
        template_src: &str,
        data: &serde_json::Value,
    ) -> Result<RenderedImage, EchoAvatarError> {
        let vars = html_vars(data)?;
        let html = template::render(template_src, &vars)?;
        let stem = data
            .get("user_id")
            .and_then(|v| v.as_str())
            .filter(|id| crate::db::validate_user_id(id).is_ok())
            .unwrap_or("preview");
        tokio::fs::create_dir_all(&self.out_dir).await?;
        let path = self
            .out_dir
            .join(format!("{stem}-{}.html", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&path, html).await?;
        Ok(RenderedImage { path })
    }
}
