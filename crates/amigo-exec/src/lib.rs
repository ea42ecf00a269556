//! A host-side implementation of the Amiga `exec.library` core: lists, signals, message ports
//! and cooperative tasks, operating directly on guest memory.
//!
//! [`ExecLib`] owns the system lists (public ports, ready and waiting tasks). Calls are made
//! through a [`TaskContext`], either directly or via [`TaskContext::dispatch`] with arguments
//! in the 68k registers. [`Scheduler`] runs a set of [`TaskSpec`]s as guest tasks, one at a
//! time, switching only when the running task waits or exits.

#![forbid(unsafe_code)]

mod config;
mod dispatch;
mod error;
mod exec;
mod msg;
mod promote;
mod sched;
mod signal;
pub mod structs;

pub use config::ExecConfig;
pub use dispatch::ExecFunction;
pub use error::{ExecError, ExecResult};
pub use exec::{ExecLib, TaskContext, EXEC_NAME};
pub use promote::{promote, Promoted};
pub use sched::{Scheduler, TaskKind, TaskSpec};
pub use signal::{FallbackSignals, SignalMasks, NO_SIGNAL};
