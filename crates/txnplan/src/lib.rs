//! txnplan - transactional plan engine
//!
//! Runs caller-defined operations as dependency-ordered plans:
//! - Steps run in parallel once their prerequisites have completed
//! - Plans touching the same resource names never run at once
//! - The first failure rolls the plan back, newest work first
//! - Every transition is persisted, so a restarted engine picks up where
//!   it stopped
//!
//! # Example
//!
//! ```rust,ignore
//! use txnplan::prelude::*;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let executor = PlanExecutor::builder()
//!     .with_config(ExecutorConfig::new().with_max_concurrent_steps(8))
//!     .build()?;
//!
//! let mut builder = PlanBuilder::new();
//! let launch = builder.step(LaunchOp::new("pod-0"));
//! let verify = builder.step(VerifyOp::new("pod-0"));
//! builder.requires(verify, launch)?;
//!
//! let id = executor.submit_plan(builder.freeze()?, vec![]).await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod executor;
pub mod ids;
pub mod listener;
pub mod logging;
pub mod operation;
pub mod plan;
pub mod pool;
pub mod scheduler;
pub mod status;
pub mod storage;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use codec::{OperationCodec, OperationRecord, SCHEMA_VERSION};
pub use config::ExecutorConfig;
pub use error::{
    CodecError, ConfigError, Error, ExecutorError, PlanError, Result, StatusError, StepFailure,
    StorageError,
};
pub use executor::{ExecutorBuilder, PlanExecutor};
pub use ids::{PlanId, StepId};
pub use listener::{LoggingListener, PlanListener, SharedListener};
pub use operation::{
    MemoryDriverFactory, Operation, OperationDriver, OperationDriverFactory, ResourceRegistry,
    StepScope,
};
pub use plan::{Plan, PlanBuilder, Step};
pub use pool::{PoolStats, WorkerPool};
pub use scheduler::SchedulerState;
pub use status::{PlanStatus, StepState};
pub use storage::{
    CoordinationStore, FsStore, MemoryStore, PlanStorageDriver, StoreDriverFactory,
    StoreStorageDriver,
};
pub use tracker::{PlanTracker, TrackerBuilder};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for embedding the engine
    pub use crate::{
        ExecutorConfig, Operation, OperationDriver, Plan, PlanBuilder, PlanExecutor, PlanId,
        PlanListener, PlanStatus, PlanTracker, ResourceRegistry, SharedListener, StepId,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
