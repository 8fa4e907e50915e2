use crate::error::EchoAvatarError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::warn;

pub const CONFIG_ENV_VAR: &str = "ECHO_AVATAR_CONFIG";

fn default_data_dir() -> String {
    "./echo_avatar.data".into()
}
fn default_llm_provider() -> String {
    "openai".into()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_sample_size() -> usize {
    20
}
fn default_full_history_limit() -> usize {
    200
}
fn default_preview_recent_limit() -> usize {
    10
}
fn default_log_retention_days() -> i64 {
    crate::logging::DEFAULT_LOG_RETENTION_DAYS
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptFormat {
    #[default]
    Natural,
    Yaml,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Users whose messages are recorded.
    #[serde(default)]
    pub target_users: Vec<String>,
    /// Callers allowed to run privileged commands.
    #[serde(default)]
    pub admin_ids: Vec<String>,
    #[serde(default = "default_llm_provider")]
    pub llm_provider: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub llm_base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    #[serde(default)]
    pub prompt_format: PromptFormat,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    #[serde(default = "default_full_history_limit")]
    pub full_history_limit: usize,
    #[serde(default = "default_preview_recent_limit")]
    pub preview_recent_limit: usize,
    #[serde(default)]
    pub log_to_file: bool,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: default_data_dir(),
            target_users: Vec::new(),
            admin_ids: Vec::new(),
            llm_provider: default_llm_provider(),
            api_key: String::new(),
            model: String::new(),
            llm_base_url: None,
            max_tokens: default_max_tokens(),
            llm_timeout_secs: default_llm_timeout_secs(),
            prompt_format: PromptFormat::Natural,
            sample_size: default_sample_size(),
            full_history_limit: default_full_history_limit(),
            preview_recent_limit: default_preview_recent_limit(),
            log_to_file: false,
            log_retention_days: default_log_retention_days(),
        }
    }
}

fn normalize_ids(ids: &mut Vec<String>) {
    for id in ids.iter_mut() {
        *id = id.trim().to_string();
    }
    ids.retain(|id| !id.is_empty());
    ids.dedup();
}

impl Config {
    pub fn data_root_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    /// Directory holding one store file per monitored user.
    pub fn user_data_dir(&self) -> PathBuf {
        self.data_root_dir().join("user_data")
    }

    pub fn previews_dir(&self) -> PathBuf {
        self.data_root_dir().join("previews")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root_dir().join("logs")
    }

    pub fn resolve_config_path() -> Result<Option<PathBuf>, EchoAvatarError> {
        if let Ok(custom) = std::env::var(CONFIG_ENV_VAR) {
            if Path::new(&custom).exists() {
                return Ok(Some(PathBuf::from(custom)));
            }
            return Err(EchoAvatarError::Config(format!(
                "{CONFIG_ENV_VAR} points to non-existent file: {custom}"
            )));
        }

        for candidate in ["./echo_avatar.config.yaml", "./echo_avatar.config.yml"] {
            if Path::new(candidate).exists() {
                return Ok(Some(PathBuf::from(candidate)));
            }
        }
        Ok(None)
    }

    pub fn load() -> Result<Self, EchoAvatarError> {
        match Self::resolve_config_path()? {
            Some(path) => Self::load_from(&path),
            None => Err(EchoAvatarError::Config(format!(
                "No echo_avatar.config.yaml found. Create one or set {CONFIG_ENV_VAR}."
            ))),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, EchoAvatarError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EchoAvatarError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&content)
            .map_err(|e| EchoAvatarError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_yaml(content: &str) -> Result<Self, EchoAvatarError> {
        let mut config: Config = serde_yaml::from_str(content)
            .map_err(|e| EchoAvatarError::Config(format!("Failed to parse config: {e}")))?;
        config.post_deserialize()?;
        Ok(config)
    }

    /// Apply post-deserialization normalization and validation.
    pub(crate) fn post_deserialize(&mut self) -> Result<(), EchoAvatarError> {
        self.llm_provider = self.llm_provider.trim().to_lowercase();
        if self.model.trim().is_empty() {
            self.model = match self.llm_provider.as_str() {
                "anthropic" => "claude-sonnet-4-5-20250929".into(),
                "ollama" => "llama3.2".into(),
                _ => "gpt-4o-mini".into(),
            };
        }
        if let Some(url) = &self.llm_base_url {
            if url.trim().is_empty() {
                self.llm_base_url = None;
            }
        }
        if self.data_dir.trim().is_empty() {
            self.data_dir = default_data_dir();
        }
        normalize_ids(&mut self.target_users);
        normalize_ids(&mut self.admin_ids);

        if self.sample_size == 0 {
            return Err(EchoAvatarError::Config("sample_size must be > 0".into()));
        }
        if self.full_history_limit == 0 {
            return Err(EchoAvatarError::Config(
                "full_history_limit must be > 0".into(),
            ));
        }
        if self.preview_recent_limit == 0 {
            self.preview_recent_limit = default_preview_recent_limit();
        }
        if self.llm_timeout_secs == 0 {
            self.llm_timeout_secs = default_llm_timeout_secs();
        }
        if self.log_retention_days <= 0 {
            self.log_retention_days = default_log_retention_days();
        }
        if self.api_key.trim().is_empty() && self.llm_provider != "ollama" {
            return Err(EchoAvatarError::Config("api_key is required".into()));
        }
        Ok(())
    }
}

/// Source of the live allow-list. Queried on every invocation, never cached by callers.
pub trait ConfigProvider: Send + Sync {
    fn target_users(&self) -> Vec<String>;
}

/// Re-reads the YAML file on every query, falling back to the last good snapshot.
pub struct LiveConfig {
    path: PathBuf,
    last_good: RwLock<Config>,
}

impl LiveConfig {
    pub fn new(path: PathBuf, initial: Config) -> Self {
        LiveConfig {
            path,
            last_good: RwLock::new(initial),
        }
    }

    pub fn current(&self) -> Config {
        match Config::load_from(&self.path) {
            Ok(config) => {
                if let Ok(mut slot) = self.last_good.write() {
                    *slot = config.clone();
                }
                config
            }
            Err(e) => {
                warn!(path = %self.path.display(), "config reload failed, using last good: {e}");
                match self.last_good.read() {
                    Ok(guard) => guard.clone(),
                    Err(poisoned) => poisoned.into_inner().clone(),
                }
            }
        }
    }
}

impl ConfigProvider for LiveConfig {
    fn target_users(&self) -> Vec<String> {
        self.current().target_users
    }
}

/// Fixed allow-list, replaceable at runtime. Used by embedders and tests.
#[derive(Default)]
pub struct StaticConfig {
    users: RwLock<Vec<String>>,
}

impl StaticConfig {
    pub fn new(users: Vec<String>) -> Self {
        StaticConfig {
            users: RwLock::new(users),
        }
    }

    pub fn set_target_users(&self, users: Vec<String>) {
        match self.users.write() {
            Ok(mut guard) => *guard = users,
            Err(poisoned) => *poisoned.into_inner() = users,
        }
    }
}

impl ConfigProvider for StaticConfig {
    fn target_users(&self) -> Vec<String> {
        match self.users.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn test_config() -> Config {
        Config {
            api_key: "key".into(),
            model: "gpt-4o-mini".into(),
            target_users: vec!["1001".into()],
            admin_ids: vec!["admin".into()],
            ..Config::default()
        }
    }

    #[test]
    fn test_config_struct_clone_and_debug() {
        let config = test_config();
        let cloned = config.clone();
        assert_eq!(cloned.sample_size, 20);
        assert_eq!(cloned.full_history_limit, 200);
        assert_eq!(cloned.preview_recent_limit, 10);
        assert_eq!(cloned.prompt_format, PromptFormat::Natural);
        assert_eq!(
            cloned.log_retention_days,
            crate::logging::DEFAULT_LOG_RETENTION_DAYS
        );
        let _ = format!("{:?}", config);
    }

    #[test]
    fn test_data_dirs() {
        let config = Config {
            data_dir: "/tmp/ea".into(),
            ..test_config()
        };
        assert_eq!(config.user_data_dir(), PathBuf::from("/tmp/ea/user_data"));
        assert_eq!(config.previews_dir(), PathBuf::from("/tmp/ea/previews"));
        assert_eq!(config.logs_dir(), PathBuf::from("/tmp/ea/logs"));
    }

    #[test]
    fn test_post_deserialize_normalizes_ids() {
        let config =
            Config::from_yaml("api_key: k\ntarget_users: [' 1001 ', '', '1002']\nadmin_ids: ['a']\n")
                .unwrap();
        assert_eq!(config.target_users, vec!["1001", "1002"]);
        assert_eq!(config.admin_ids, vec!["a"]);
    }

    #[test]
    fn test_default_model_per_provider() {
        let config = Config::from_yaml("api_key: k\nllm_provider: Anthropic\n").unwrap();
        assert_eq!(config.llm_provider, "anthropic");
        assert!(config.model.starts_with("claude"));

        let config = Config::from_yaml("llm_provider: ollama\n").unwrap();
        assert_eq!(config.model, "llama3.2");
    }

    #[test]
    fn test_live_config_rereads_file() {
        let dir = std::env::temp_dir().join(format!("echo_avatar_cfg_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("echo_avatar.config.yaml");
        std::fs::write(&path, "api_key: k\ntarget_users: ['1']\n").unwrap();
        let initial = Config::load_from(&path).unwrap();
        let live = LiveConfig::new(path.clone(), initial);
        assert_eq!(live.target_users(), vec!["1"]);

        std::fs::write(&path, "api_key: k\ntarget_users: ['1', '2']\n").unwrap();
        assert_eq!(live.target_users(), vec!["1", "2"]);

        std::fs::write(&path, "target_users: [unterminated").unwrap();
        assert_eq!(live.target_users(), vec!["1", "2"]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_static_config_updates() {
        let cfg = StaticConfig::new(vec!["1".into()]);
        assert_eq!(cfg.target_users(), vec!["1"]);
        cfg.set_target_users(vec![]);
        assert!(cfg.target_users().is_empty());
    }
}
