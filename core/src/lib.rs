//! Keel - page-oriented transactional storage engine

pub mod config;
pub mod database;
pub mod error;
pub mod storage;

pub use config::{Config, MemorySize};
pub use database::{Database, DatabaseStats};
pub use error::{KeelError, KeelResult};
pub use storage::{IsolationLevel, Uid, Xid};
