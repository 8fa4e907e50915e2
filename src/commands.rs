use tracing::{error, info};

use crate::composer::{compose_full_for_user, compose_sample_for_user, Composed};
use crate::db::call_blocking;
use crate::error::EchoAvatarError;
use crate::host::CommandReply;
use crate::preview::{collect_preview, PREVIEW_TEMPLATE};
use crate::runtime::AppState;
use crate::text::split_first_word;

pub const COMMAND_GROUP: &str = "echo_avatar";
const COMMAND_ALIASES: &[&str] = &["echo_avatar", "echoavatar"];
const TITLE: &str = "[Echo Avatar]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoCommand {
    Help,
    Status,
    UpdateProfile {
        user_id: String,
        key: String,
        value: String,
    },
    AddAnnotation {
        user_id: String,
        text: String,
    },
    AddMemory {
        user_id: String,
        text: String,
    },
    Preview {
        user_id: String,
    },
    GenerateSample {
        user_id: String,
    },
    Generate {
        user_id: String,
    },
    Count {
        user_id: String,
    },
    Clear {
        user_id: String,
    },
}

fn usage(sub: &str, args: &str) -> EchoAvatarError {
    EchoAvatarError::Validation(format!(
        "Invalid command format. Usage: /{COMMAND_GROUP} {sub} {args}"
    ))
}

fn required_user_id(sub: &str, rest: &str) -> Result<String, EchoAvatarError> {
    let (user_id, _) = split_first_word(rest);
    if user_id.is_empty() {
        return Err(usage(sub, "<userId>"));
    }
    Ok(user_id.to_string())
}

fn user_and_text(sub: &str, rest: &str) -> Result<(String, String), EchoAvatarError> {
    let (user_id, text) = split_first_word(rest);
    if user_id.is_empty() || text.is_empty() {
        return Err(usage(sub, "<userId> <text...>"));
    }
    Ok((user_id.to_string(), text.to_string()))
}

impl EchoCommand {
    /// Parse the text after the command group name.
    pub fn parse(args: &str) -> Result<Self, EchoAvatarError> {
        let (sub, rest) = split_first_word(args);
        match sub {
            "" | "help" => Ok(EchoCommand::Help),
            "status" => Ok(EchoCommand::Status),
            "update-profile" => {
                let (user_id, tail) = split_first_word(rest);
                let (key, value) = split_first_word(tail);
                if user_id.is_empty() || key.is_empty() || value.is_empty() {
                    return Err(usage(sub, "<userId> nickname <value...>"));
                }
                Ok(EchoCommand::UpdateProfile {
                    user_id: user_id.to_string(),
                    key: key.to_string(),
                    value: value.to_string(),
                })
            }
            "add-annotation" => {
                let (user_id, text) = user_and_text(sub, rest)?;
                Ok(EchoCommand::AddAnnotation { user_id, text })
            }
            "add-memory" => {
                let (user_id, text) = user_and_text(sub, rest)?;
                Ok(EchoCommand::AddMemory { user_id, text })
            }
            "preview" => Ok(EchoCommand::Preview {
                user_id: required_user_id(sub, rest)?,
            }),
            "generate-sample" => Ok(EchoCommand::GenerateSample {
                user_id: required_user_id(sub, rest)?,
            }),
            "generate" => Ok(EchoCommand::Generate {
                user_id: required_user_id(sub, rest)?,
            }),
            "count" => Ok(EchoCommand::Count {
                user_id: required_user_id(sub, rest)?,
            }),
            "clear" => Ok(EchoCommand::Clear {
                user_id: required_user_id(sub, rest)?,
            }),
            other => Err(EchoAvatarError::Validation(format!(
                "Unknown subcommand '{other}'. Try /{COMMAND_GROUP} help."
            ))),
        }
    }

    /// Only `add-memory` and `help` are open to every caller.
    pub fn requires_privilege(&self) -> bool {
        !matches!(self, EchoCommand::Help | EchoCommand::AddMemory { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            EchoCommand::Help => "help",
            EchoCommand::Status => "status",
            EchoCommand::UpdateProfile { .. } => "update-profile",
            EchoCommand::AddAnnotation { .. } => "add-annotation",
            EchoCommand::AddMemory { .. } => "add-memory",
            EchoCommand::Preview { .. } => "preview",
            EchoCommand::GenerateSample { .. } => "generate-sample",
            EchoCommand::Generate { .. } => "generate",
            EchoCommand::Count { .. } => "count",
            EchoCommand::Clear { .. } => "clear",
        }
    }
}

/// Text after `/echo_avatar`, if `text` is one of our commands.
pub fn command_args(text: &str) -> Option<&str> {
    let rest = text.trim_start().strip_prefix('/')?;
    let (group, args) = split_first_word(rest);
    if !COMMAND_ALIASES.contains(&group) {
        return None;
    }
    Some(args)
}

pub fn is_echo_command(text: &str) -> bool {
    command_args(text).is_some()
}

pub fn help_text() -> String {
    format!(
        "{TITLE}\n\
         /{COMMAND_GROUP} status\n\
         /{COMMAND_GROUP} update-profile <userId> nickname <value>\n\
         /{COMMAND_GROUP} add-annotation <userId> <text>\n\
         /{COMMAND_GROUP} add-memory <userId> <text>\n\
         /{COMMAND_GROUP} preview <userId>\n\
         /{COMMAND_GROUP} generate-sample <userId>\n\
         /{COMMAND_GROUP} generate <userId>\n\
         /{COMMAND_GROUP} count <userId>\n\
         /{COMMAND_GROUP} clear <userId>"
    )
}

fn not_found_reply(user_id: &str) -> CommandReply {
    CommandReply::text(format!("No data found for user {user_id}."))
}

/// Map a failed operation to a caller-facing reply. Storage and upstream errors are logged.
fn failure_reply(operation: &str, user_id: &str, err: EchoAvatarError) -> CommandReply {
    if err.is_validation() {
        return CommandReply::text(err.to_string());
    }
    match &err {
        EchoAvatarError::NotFound(_) => not_found_reply(user_id),
        EchoAvatarError::EmptyReply | EchoAvatarError::LlmApi(_) | EchoAvatarError::Http(_) => {
            error!(operation, user_id, "LLM call failed: {err}");
            CommandReply::text("LLM call failed or returned nothing.")
        }
        _ => {
            error!(operation, user_id, "{err}");
            CommandReply::text(format!("{operation} failed, see logs for details."))
        }
    }
}

/// Handle one `/echo_avatar ...` message. Returns `None` when `text` is not ours.
pub async fn handle_chat_command(
    state: &AppState,
    caller_id: &str,
    text: &str,
) -> Option<Vec<CommandReply>> {
    let args = command_args(text)?;
    let command = match EchoCommand::parse(args) {
        Ok(c) => c,
        Err(e) => return Some(vec![CommandReply::text(e.to_string())]),
    };
    Some(execute_command(state, caller_id, command).await)
}

pub async fn execute_command(
    state: &AppState,
    caller_id: &str,
    command: EchoCommand,
) -> Vec<CommandReply> {
    if command.requires_privilege() && !state.gate.is_privileged(caller_id) {
        info!(caller_id, command = command.name(), "rejected unprivileged command");
        return vec![CommandReply::text(
            "Permission denied: this command is limited to administrators.",
        )];
    }

    match command {
        EchoCommand::Help => vec![CommandReply::text(help_text())],
        EchoCommand::Status => vec![status_reply(state)],
        EchoCommand::UpdateProfile {
            user_id,
            key,
            value,
        } => vec![update_profile(state, &user_id, &key, &value).await],
        EchoCommand::AddAnnotation { user_id, text } => {
            vec![add_annotation(state, caller_id, &user_id, &text).await]
        }
        EchoCommand::AddMemory { user_id, text } => {
            vec![add_memory(state, caller_id, &user_id, &text).await]
        }
        EchoCommand::Preview { user_id } => vec![preview(state, &user_id).await],
        EchoCommand::GenerateSample { user_id } => generate_sample(state, &user_id).await,
        EchoCommand::Generate { user_id } => generate_full(state, &user_id).await,
        EchoCommand::Count { user_id } => vec![count(state, &user_id).await],
        EchoCommand::Clear { user_id } => vec![clear(state, &user_id).await],
    }
}

pub fn status_reply(state: &AppState) -> CommandReply {
    let users = state.config.target_users();
    if users.is_empty() {
        CommandReply::text(format!("{TITLE}\nNo users are being monitored."))
    } else {
        CommandReply::text(format!(
            "{TITLE}\nMonitoring the following users:\n- {}",
            users.join("\n- ")
        ))
    }
}

async fn update_profile(state: &AppState, user_id: &str, key: &str, value: &str) -> CommandReply {
    let (uid, k, v) = (user_id.to_string(), key.to_string(), value.to_string());
    match call_blocking(state.stores.clone(), move |root| {
        root.set_profile_field(&uid, &k, &v)
    })
    .await
    {
        Ok(()) => CommandReply::text(format!(
            "{TITLE}\nSet {key} of user {user_id} to '{value}'."
        )),
        Err(e) => failure_reply("update-profile", user_id, e),
    }
}

async fn add_annotation(state: &AppState, author: &str, user_id: &str, text: &str) -> CommandReply {
    let (uid, t, a) = (user_id.to_string(), text.to_string(), author.to_string());
    match call_blocking(state.stores.clone(), move |root| {
        root.add_annotation(&uid, &t, &a)
    })
    .await
    {
        Ok(id) => CommandReply::text(format!(
            "{TITLE}\nAdded annotation #{id} for user {user_id}."
        )),
        Err(e) => failure_reply("add-annotation", user_id, e),
    }
}

async fn add_memory(state: &AppState, author: &str, user_id: &str, text: &str) -> CommandReply {
    let (uid, t, a) = (user_id.to_string(), text.to_string(), author.to_string());
    match call_blocking(state.stores.clone(), move |root| root.add_memory(&uid, &t, &a)).await {
        Ok(id) => CommandReply::text(format!("{TITLE}\nAdded memory #{id} for user {user_id}.")),
        Err(e) => failure_reply("add-memory", user_id, e),
    }
}

async fn preview(state: &AppState, user_id: &str) -> CommandReply {
    let uid = user_id.to_string();
    let limit = state.settings.preview_recent_limit;
    let data = match call_blocking(state.stores.clone(), move |root| {
        collect_preview(root, &uid, limit)
    })
    .await
    {
        Ok(d) => d,
        Err(e) => return failure_reply("preview", user_id, e),
    };
    let value = match serde_json::to_value(&data) {
        Ok(v) => v,
        Err(e) => return failure_reply("preview", user_id, e.into()),
    };
    match state.renderer.render(PREVIEW_TEMPLATE, &value).await {
        Ok(image) => CommandReply::Image(image),
        Err(e) => failure_reply("preview", user_id, e),
    }
}

async fn store_exists(state: &AppState, user_id: &str) -> Result<bool, EchoAvatarError> {
    let uid = user_id.to_string();
    call_blocking(state.stores.clone(), move |root| root.store_exists(&uid)).await
}

async fn generate_sample(state: &AppState, user_id: &str) -> Vec<CommandReply> {
    match store_exists(state, user_id).await {
        Ok(true) => {}
        Ok(false) => return vec![not_found_reply(user_id)],
        Err(e) => return vec![failure_reply("generate-sample", user_id, e)],
    }
    let mut replies = vec![CommandReply::text(format!(
        "Generating a sample prompt for user {user_id}, please wait..."
    ))];

    let uid = user_id.to_string();
    let size = state.settings.sample_size;
    let composed = call_blocking(state.stores.clone(), move |root| {
        compose_sample_for_user(root, &uid, size, &mut rand::rng())
    })
    .await;
    let prompt = match composed {
        Ok(Composed::Prompt(p)) => p,
        Ok(Composed::NoData) => {
            replies.push(CommandReply::text(format!(
                "No chat messages recorded for user {user_id} yet."
            )));
            return replies;
        }
        Err(e) => {
            replies.push(failure_reply("generate-sample", user_id, e));
            return replies;
        }
    };

    let reply = match state.llm.complete(&prompt).await {
        Ok(Some(text)) => CommandReply::text(format!(
            "Sample prompt generated for user {user_id}:\n\n{text}"
        )),
        Ok(None) => failure_reply("generate-sample", user_id, EchoAvatarError::EmptyReply),
        Err(e) => failure_reply("generate-sample", user_id, e),
    };
    replies.push(reply);
    replies
}

async fn generate_full(state: &AppState, user_id: &str) -> Vec<CommandReply> {
    match store_exists(state, user_id).await {
        Ok(true) => {}
        Ok(false) => return vec![not_found_reply(user_id)],
        Err(e) => return vec![failure_reply("generate", user_id, e)],
    }

    let uid = user_id.to_string();
    let limit = state.settings.full_history_limit;
    let format = state.settings.prompt_format;
    let composed = call_blocking(state.stores.clone(), move |root| {
        compose_full_for_user(root, &uid, limit, format)
    })
    .await;
    match composed {
        Ok(Composed::Prompt(prompt)) => vec![
            CommandReply::text(format!(
                "Generating the full prompt for user {user_id}. This may take a while..."
            )),
            CommandReply::LlmRequest { prompt },
        ],
        Ok(Composed::NoData) => vec![CommandReply::text(format!(
            "No chat messages recorded for user {user_id} yet."
        ))],
        Err(e) => vec![failure_reply("generate", user_id, e)],
    }
}

async fn count(state: &AppState, user_id: &str) -> CommandReply {
    let uid = user_id.to_string();
    match call_blocking(state.stores.clone(), move |root| root.count_messages(&uid)).await {
        Ok(n) => CommandReply::text(format!(
            "{TITLE}\nUser {user_id} has {n} recorded messages."
        )),
        Err(e) => failure_reply("count", user_id, e),
    }
}

async fn clear(state: &AppState, user_id: &str) -> CommandReply {
    let uid = user_id.to_string();
    match call_blocking(state.stores.clone(), move |root| root.delete_store(&uid)).await {
        Ok(()) => {
            info!(user_id, "cleared user data");
            CommandReply::text(format!("{TITLE}\nCleared all data for user {user_id}."))
        }
        Err(EchoAvatarError::NotFound(_)) => CommandReply::text(format!(
            "No data found for user {user_id}, nothing to clear."
        )),
        Err(e) => failure_reply("clear", user_id, e),
    }
}
