//! Fable Bot — session core for a children's fable chat bot.

pub mod channels;
pub mod config;
pub mod engine;
pub mod error;
pub mod guard;
pub mod llm;
pub mod morals;
pub mod profile;
pub mod stats;
pub mod store;
