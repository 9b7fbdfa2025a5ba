//! 核心层：错误与恢复、有界 worker 池

pub mod error;
pub mod recovery;
pub mod worker_pool;

pub use error::{AgentError, RecoveryAction};
pub use recovery::RecoveryEngine;
pub use worker_pool::{UnitOutcome, WorkerPool};
