//! In-memory adapters: event log, typed repositories and KV store.

pub mod event_log;
pub mod kv;
pub mod repository;
