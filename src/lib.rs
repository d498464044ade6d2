//! Job orchestration and subprocess-fetch engine for a music catalog client.

pub mod catalog;
pub mod config;
pub mod config_persistence;
pub mod error;
pub mod fetch;
pub mod jobs;
pub mod lyrics;
pub mod orchestrator;
pub mod protocol;
