//! batch-exec - batch-change step execution
//!
//! Runs a list of steps against many repositories and collects the
//! resulting patches. Each repository gets its own workspace built from a
//! snapshot archive; steps run on the host or in containers, the workspace
//! is diffed against the pristine snapshot, and the result is cached under
//! a content-derived key so an identical task is never run twice.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod diff;
pub mod docker;
pub mod error;
pub mod events;
pub mod log;
pub mod process;
pub mod runner;
pub mod signal;
pub mod task;
pub mod timeout;
pub mod workspace;

pub use cache::{CachedResult, DiskCache, ExecutionCache};
pub use config::{ConfigError, ExecConfig};
pub use coordinator::{Coordinator, CoordinatorConfig, PatchReport, RunReport, TaskStatus};
pub use diff::DiffStat;
pub use error::{ErrorKind, ExitCode, RunError, TaskError};
pub use events::{EventFeed, LogEvent};
pub use signal::{CancelToken, SignalHandler};
pub use step_spec::Step;
pub use task::{CacheKey, Patch, Repository, Task, TaskBuilder, TaskFile};
pub use timeout::TaskTimeout;
pub use workspace::WorkspaceMode;
