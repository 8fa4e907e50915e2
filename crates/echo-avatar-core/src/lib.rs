//! Shared types for Echo Avatar: the error enum, LLM wire types and text helpers.

pub mod error;
pub mod llm_types;
pub mod text;
