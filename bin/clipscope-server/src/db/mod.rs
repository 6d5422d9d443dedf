//! Persistence layer.
//!
//! The server journals every job snapshot so a restart can rebuild the job
//! registry. The journal contract is [`clipscope_core::JobJournal`]; the only
//! implementation is [`sqlite::SqliteStore`].

pub mod sqlite;
