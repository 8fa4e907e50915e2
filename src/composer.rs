use std::collections::HashMap;

use rand::seq::IndexedRandom;
use rand::Rng;
use serde::Serialize;

use crate::config::PromptFormat;
use crate::db::{Annotation, ChatMessage, Memory, SortOrder, StoreRoot, UserStore};
use crate::error::EchoAvatarError;
use crate::template;

pub const NICKNAME_NOT_SET: &str = "not set";
const NONE_RECORDED: &str = "(none)";

const OUTPUT_FORMAT: &str = "Output strictly in the following format and fill in every section:
## Profile
- author: {user_id}
- version: 1.0
- language: (the user's main language)
- description: (a short description of the user's style)

## Skills
(the user's expressive skills and traits)

## Rules
(the rules and habits the user follows when writing)

## Workflows
(how the user usually develops a conversation)

## Init
(an opening line in the user's voice)";

const SAMPLE_TEMPLATE: &str = "You are an expert in linguistic style analysis and a creative prompt engineer.
Analyse the following chat records from user '{user_id}' and summarise their distinctive language style: catchphrases, tone and common sentence patterns.
Based on that analysis, write a brand-new prompt that imitates this user's style.
{output_format}
--- Chat record sample ---
{messages}
";

const FULL_TEMPLATE: &str = "You are a master of language-style imitation and an expert prompt author.
Your task is to study the material below about user '{user_id}' in depth and write a high-quality prompt that lets a model speak exactly like this user: catchphrases, tone, sentence patterns, emoji and favourite topics.

The material comes from sources of different trustworthiness. Weigh them in this order, highest first:
1. Administrator annotations: verified facts and style notes. Always follow them.
2. Profile: basic facts such as the nickname.
3. Chat history: the user's own words and the main evidence for their style.
4. Memories: notes left by other people. Least reliable, use them only as hints.
If a memory contradicts the chat history, trust the chat history and ignore the memory.

=== Administrator annotations (highest trust) ===
{annotations}

=== Profile ===
- nickname: {nickname}

=== Chat history ({message_count} most recent messages, newest first) ===
{messages}

=== Memories (lowest trust) ===
{memories}

{output_format}
";

const YAML_TEMPLATE: &str = "You are a master of language-style imitation and an expert prompt author.
The YAML document below holds everything known about user '{user_id}'. Sources are listed in `trust_order`, highest first; follow `conflict_rule` whenever they disagree.
Study it in depth and write a high-quality prompt that lets a model speak exactly like this user.

```yaml
{material}```

{output_format}
";

/// Everything full-mode generation reads for one user.
#[derive(Debug, Clone, Default)]
pub struct PromptMaterial {
    pub user_id: String,
    pub nickname: Option<String>,
    /// Oldest first.
    pub annotations: Vec<Annotation>,
    /// Newest first.
    pub messages: Vec<ChatMessage>,
    /// Oldest first.
    pub memories: Vec<Memory>,
}

impl PromptMaterial {
    pub fn load(store: &UserStore, history_limit: usize) -> Result<Self, EchoAvatarError> {
        Ok(PromptMaterial {
            user_id: store.user_id().to_string(),
            nickname: store.nickname()?,
            annotations: store.list_annotations(SortOrder::Ascending)?,
            messages: store.list_recent_messages(history_limit, SortOrder::Descending)?,
            memories: store.list_memories(SortOrder::Ascending)?,
        })
    }

    pub fn nickname_or_placeholder(&self) -> &str {
        self.nickname.as_deref().unwrap_or(NICKNAME_NOT_SET)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Composed {
    /// The store exists but holds no chat messages; the model must not be called.
    NoData,
    Prompt(String),
}

/// Uniform sample without replacement of `min(len, size)` messages.
pub fn sample_messages<R: Rng + ?Sized>(
    messages: &[String],
    size: usize,
    rng: &mut R,
) -> Vec<String> {
    messages.choose_multiple(rng, size).cloned().collect()
}

fn bullet_list<'a>(items: impl Iterator<Item = &'a str>, prefix: &str) -> String {
    let lines: Vec<String> = items.map(|text| format!("{prefix}{text}")).collect();
    if lines.is_empty() {
        NONE_RECORDED.to_string()
    } else {
        lines.join("\n")
    }
}

fn base_vars(user_id: &str) -> Result<HashMap<&'static str, String>, EchoAvatarError> {
    let mut vars = HashMap::new();
    vars.insert("user_id", user_id.to_string());
    let output_format = template::render(OUTPUT_FORMAT, &vars)?;
    vars.insert("output_format", output_format);
    Ok(vars)
}

pub fn compose_sample_prompt(user_id: &str, sample: &[String]) -> Result<String, EchoAvatarError> {
    let mut vars = base_vars(user_id)?;
    vars.insert(
        "messages",
        bullet_list(sample.iter().map(String::as_str), "- "),
    );
    template::render(SAMPLE_TEMPLATE, &vars)
}

pub fn compose_full_prompt(
    material: &PromptMaterial,
    format: PromptFormat,
) -> Result<String, EchoAvatarError> {
    match format {
        PromptFormat::Natural => compose_natural(material),
        PromptFormat::Yaml => compose_yaml(material),
    }
}

fn compose_natural(material: &PromptMaterial) -> Result<String, EchoAvatarError> {
    let mut vars = base_vars(&material.user_id)?;
    vars.insert(
        "annotations",
        bullet_list(material.annotations.iter().map(|a| a.text.as_str()), "- "),
    );
    vars.insert("nickname", material.nickname_or_placeholder().to_string());
    vars.insert("message_count", material.messages.len().to_string());
    let messages: Vec<String> = material
        .messages
        .iter()
        .map(|m| format!("\"{}\"", m.text))
        .collect();
    vars.insert("messages", messages.join("\n"));
    let memories: Vec<String> = material
        .memories
        .iter()
        .map(|m| format!("- {} (noted by {})", m.text, m.added_by))
        .collect();
    vars.insert(
        "memories",
        if memories.is_empty() {
            NONE_RECORDED.to_string()
        } else {
            memories.join("\n")
        },
    );
    template::render(FULL_TEMPLATE, &vars)
}

#[derive(Serialize)]
struct YamlMaterial<'a> {
    user_id: &'a str,
    trust_order: [&'static str; 4],
    conflict_rule: &'static str,
    annotations: Vec<&'a str>,
    profile: YamlProfile<'a>,
    chat_history: Vec<&'a str>,
    memories: Vec<YamlMemory<'a>>,
}

#[derive(Serialize)]
struct YamlProfile<'a> {
    nickname: &'a str,
}

#[derive(Serialize)]
struct YamlMemory<'a> {
    text: &'a str,
    noted_by: &'a str,
}

fn compose_yaml(material: &PromptMaterial) -> Result<String, EchoAvatarError> {
    let doc = YamlMaterial {
        user_id: &material.user_id,
        trust_order: ["annotations", "profile", "chat_history", "memories"],
        conflict_rule: "when memories contradict chat_history, trust chat_history",
        annotations: material.annotations.iter().map(|a| a.text.as_str()).collect(),
        profile: YamlProfile {
            nickname: material.nickname_or_placeholder(),
        },
        chat_history: material.messages.iter().map(|m| m.text.as_str()).collect(),
        memories: material
            .memories
            .iter()
            .map(|m| YamlMemory {
                text: &m.text,
                noted_by: &m.added_by,
            })
            .collect(),
    };
    let mut vars = base_vars(&material.user_id)?;
    vars.insert("material", serde_yaml::to_string(&doc)?);
    template::render(YAML_TEMPLATE, &vars)
}

/// Sampling mode: random subset of the whole history in the small template.
pub fn compose_sample_for_user<R: Rng + ?Sized>(
    root: &StoreRoot,
    user_id: &str,
    sample_size: usize,
    rng: &mut R,
) -> Result<Composed, EchoAvatarError> {
    let store = root.open_existing(user_id)?;
    let messages: Vec<String> = store
        .list_all_messages()?
        .into_iter()
        .map(|m| m.text)
        .collect();
    drop(store);
    if messages.is_empty() {
        return Ok(Composed::NoData);
    }
    let sample = sample_messages(&messages, sample_size, rng);
    compose_sample_prompt(user_id, &sample).map(Composed::Prompt)
}

/// Full mode: recent history, annotations, memories and profile in the weighted template.
pub fn compose_full_for_user(
    root: &StoreRoot,
    user_id: &str,
    history_limit: usize,
    format: PromptFormat,
) -> Result<Composed, EchoAvatarError> {
    let store = root.open_existing(user_id)?;
    let material = PromptMaterial::load(&store, history_limit)?;
    drop(store);
    if material.messages.is_empty() {
        return Ok(Composed::NoData);
    }
    compose_full_prompt(&material, format).map(Composed::Prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn test_root() -> (StoreRoot, PathBuf) {
        let dir =
            std::env::temp_dir().join(format!("echo_avatar_composer_{}", uuid::Uuid::new_v4()));
        (StoreRoot::new(&dir).unwrap(), dir)
    }

    fn kai_store(root: &StoreRoot) {
        root.append_message("kai", "hi", 100).unwrap();
        root.append_message("kai", "lol", 200).unwrap();
        root.append_message("kai", "k thx", 300).unwrap();
        root.add_annotation("kai", "always ends sentences with ~", "admin")
            .unwrap();
        root.set_profile_field("kai", "nickname", "Kai").unwrap();
    }

    #[test]
    fn test_sample_returns_all_when_fewer_than_size() {
        let messages: Vec<String> = (0..7).map(|i| format!("m{i}")).collect();
        let mut rng = StdRng::seed_from_u64(1);
        let sample = sample_messages(&messages, 20, &mut rng);
        assert_eq!(sample.len(), 7);
        let got: HashSet<_> = sample.into_iter().collect();
        let want: HashSet<_> = messages.into_iter().collect();
        assert_eq!(got, want);
    }

    #[test]
    fn test_sample_returns_exactly_size_distinct() {
        let messages: Vec<String> = (0..100).map(|i| format!("m{i}")).collect();
        for seed in 0..5 {
            let mut rng = StdRng::seed_from_u64(seed);
            let sample = sample_messages(&messages, 20, &mut rng);
            assert_eq!(sample.len(), 20);
            let distinct: HashSet<_> = sample.iter().collect();
            assert_eq!(distinct.len(), 20);
            assert!(sample.iter().all(|m| messages.contains(m)));
        }
    }

    #[test]
    fn test_full_prompt_contains_everything_in_trust_order() {
        let (root, dir) = test_root();
        kai_store(&root);
        let Composed::Prompt(prompt) =
            compose_full_for_user(&root, "kai", 200, PromptFormat::Natural).unwrap()
        else {
            panic!("expected a prompt");
        };
        for needle in ["\"hi\"", "\"lol\"", "\"k thx\"", "always ends sentences with ~", "Kai"] {
            assert!(prompt.contains(needle), "missing {needle}");
        }
        let annotation_at = prompt.find("always ends sentences with ~").unwrap();
        let history_at = prompt.find("\"k thx\"").unwrap();
        assert!(annotation_at < history_at);
        assert!(prompt.contains("trust the chat history"));
        assert!(prompt.contains("- author: kai"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_full_prompt_messages_newest_first_and_limited() {
        let (root, dir) = test_root();
        for i in 0..5 {
            root.append_message("u", &format!("msg{i}"), i).unwrap();
        }
        let Composed::Prompt(prompt) =
            compose_full_for_user(&root, "u", 3, PromptFormat::Natural).unwrap()
        else {
            panic!("expected a prompt");
        };
        assert!(!prompt.contains("\"msg1\""));
        let p4 = prompt.find("\"msg4\"").unwrap();
        let p2 = prompt.find("\"msg2\"").unwrap();
        assert!(p4 < p2);
        assert!(prompt.contains("3 most recent messages"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_nickname_placeholder_and_empty_sections() {
        let (root, dir) = test_root();
        root.append_message("u", "only one", 1).unwrap();
        let Composed::Prompt(prompt) =
            compose_full_for_user(&root, "u", 200, PromptFormat::Natural).unwrap()
        else {
            panic!("expected a prompt");
        };
        assert!(prompt.contains("- nickname: not set"));
        assert!(prompt.contains("(none)"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_zero_messages_is_no_data() {
        let (root, dir) = test_root();
        root.add_annotation("u", "has notes but no chat", "admin").unwrap();
        assert_eq!(
            compose_full_for_user(&root, "u", 200, PromptFormat::Natural).unwrap(),
            Composed::NoData
        );
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(
            compose_sample_for_user(&root, "u", 20, &mut rng).unwrap(),
            Composed::NoData
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_store_is_not_found() {
        let (root, dir) = test_root();
        let err = compose_full_for_user(&root, "ghost", 200, PromptFormat::Natural).unwrap_err();
        assert!(err.is_not_found());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_braces_in_user_text_survive_verbatim() {
        let (root, dir) = test_root();
        root.append_message("u", "look {messages} {user_id} }{", 1).unwrap();
        root.add_memory("u", "likes {nickname}", "friend").unwrap();
        let Composed::Prompt(prompt) =
            compose_full_for_user(&root, "u", 200, PromptFormat::Natural).unwrap()
        else {
            panic!("expected a prompt");
        };
        assert!(prompt.contains("\"look {messages} {user_id} }{\""));
        assert!(prompt.contains("- likes {nickname} (noted by friend)"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_sample_prompt_lists_messages() {
        let prompt = compose_sample_prompt("u1", &["a {b}".to_string(), "c".to_string()]).unwrap();
        assert!(prompt.contains("user 'u1'"));
        assert!(prompt.contains("- a {b}\n- c"));
        assert!(prompt.contains("--- Chat record sample ---"));
    }

    #[test]
    fn test_yaml_prompt_is_structured_in_trust_order() {
        let (root, dir) = test_root();
        kai_store(&root);
        root.add_memory("kai", "says: {weird} yaml", "friend").unwrap();
        let Composed::Prompt(prompt) =
            compose_full_for_user(&root, "kai", 200, PromptFormat::Yaml).unwrap()
        else {
            panic!("expected a prompt");
        };
        let start = prompt.find("```yaml\n").unwrap() + "```yaml\n".len();
        let end = prompt[start..].find("```").unwrap() + start;
        let doc: serde_yaml::Value = serde_yaml::from_str(&prompt[start..end]).unwrap();
        assert_eq!(doc["profile"]["nickname"].as_str(), Some("Kai"));
        assert_eq!(doc["annotations"][0].as_str(), Some("always ends sentences with ~"));
        assert_eq!(doc["chat_history"][0].as_str(), Some("k thx"));
        assert_eq!(doc["memories"][0]["text"].as_str(), Some("says: {weird} yaml"));
        assert_eq!(doc["trust_order"][0].as_str(), Some("annotations"));
        assert!(prompt.find("annotations:").unwrap() < prompt.find("chat_history:").unwrap());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
