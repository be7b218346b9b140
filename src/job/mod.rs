//! Job execution and output distribution.
//!
//! - [`Job`]: one child process, its status and captured output
//! - [`LogHub`]: per-job history with replay-then-live subscriptions
//! - [`JobRegistry`]: jobs scoped by owning identity
//!
//! # Lifecycle
//!
//! 1. [`Job::new`] validates the command; status is `Pending`
//! 2. [`Job::start`] spawns the process in its own process group and hands
//!    it to a capture task; status is `Running`
//! 3. The capture task publishes every stdout/stderr line to the hub
//! 4. On exit the task records `Exited(code)` or `Failed(reason)` and closes
//!    the hub; [`Job::stop`] instead records `Stopped`, publishes
//!    [`STOPPED_BY_USER_LINE`] and closes the hub itself
//!
//! Once terminal, status and history never change again.

#[allow(clippy::module_inception)]
pub mod job;
pub mod loghub;
pub mod registry;

pub use job::{Job, JobId, JobStatus, STOPPED_BY_USER_LINE};
pub use loghub::{LogHub, Subscription};
pub use registry::JobRegistry;
