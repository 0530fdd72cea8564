#![deny(unsafe_code)]

/// Chat core: conversation log, typewriter pacing and request orchestration.
pub mod chat;
/// Layered configuration.
pub mod settings;
/// Line-oriented terminal front end.
pub mod shell;
