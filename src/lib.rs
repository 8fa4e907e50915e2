pub mod commands;
pub mod composer;
pub mod config;
pub mod host;
pub mod llm;
pub mod preview;
pub mod recorder;
pub mod runtime;
pub mod template;

pub use echo_avatar_app::logging;
pub use echo_avatar_core::error;
pub use echo_avatar_core::llm_types;
pub use echo_avatar_core::text;
pub use echo_avatar_storage::db;
