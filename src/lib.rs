//! Mailbox synchronization and ingestion: keeps one IMAP session alive,
//! pulls new mail, and runs every message through index, classify and
//! notify.
pub mod app;
pub mod classify;
pub mod cli;
pub mod config;
pub mod errors;
pub mod imap;
pub mod normalize;
pub mod notify;
pub mod pipeline;
pub mod storage;
pub mod supervisor;
pub mod sync;
pub mod types;
