//! Per-user storage for Echo Avatar: one SQLite file per monitored user.

pub mod db;
