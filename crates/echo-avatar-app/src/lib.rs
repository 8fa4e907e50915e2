//! Process-level concerns shared by Echo Avatar binaries.

pub mod logging;
