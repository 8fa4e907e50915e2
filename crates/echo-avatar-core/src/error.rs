use thiserror::Error;

#[derive(Error, Debug)]
pub enum EchoAvatarError {
    #[error("{0}")]
    Validation(String),

    #[error("Unsupported profile key '{0}', only 'nickname' can be set")]
    UnsupportedProfileKey(String),

    #[error("No data found for user {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LLM API error: {0}")]
    LlmApi(String),

    #[error("LLM call failed or returned nothing")]
    EmptyReply,

    #[error("Template error: {0}")]
    Template(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Blocking task failed: {0}")]
    TaskJoin(String),
}

impl EchoAvatarError {
    /// Errors the caller caused and can fix by changing the input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EchoAvatarError::Validation(_) | EchoAvatarError::UnsupportedProfileKey(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EchoAvatarError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let e = EchoAvatarError::UnsupportedProfileKey("age".into());
        assert_eq!(
            e.to_string(),
            "Unsupported profile key 'age', only 'nickname' can be set"
        );

        let e = EchoAvatarError::NotFound("42".into());
        assert_eq!(e.to_string(), "No data found for user 42");

        let e = EchoAvatarError::EmptyReply;
        assert_eq!(e.to_string(), "LLM call failed or returned nothing");

        let e = EchoAvatarError::Validation("user id is required".into());
        assert_eq!(e.to_string(), "user id is required");
    }

    #[test]
    fn test_error_classification() {
        assert!(EchoAvatarError::Validation("x".into()).is_validation());
        assert!(EchoAvatarError::UnsupportedProfileKey("age".into()).is_validation());
        assert!(!EchoAvatarError::EmptyReply.is_validation());
        assert!(EchoAvatarError::NotFound("u".into()).is_not_found());
        assert!(!EchoAvatarError::Config("c".into()).is_not_found());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let e: EchoAvatarError = io_err.into();
        assert!(e.to_string().contains("not found"));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{{invalid").unwrap_err();
        let e: EchoAvatarError = json_err.into();
        assert!(e.to_string().contains("JSON error"));
    }
}
