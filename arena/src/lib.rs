//! Filesystem-coordinated job queue that drives an external coding agent.
//!
//! Jobs are JSON records that move between `inbox/`, `running/`, `done/`
//! and `failed/` by atomic rename. Workers claim records, run a two-phase
//! plan-then-apply protocol against the agent CLI, and leave artifacts and
//! an event log behind; a drain loop folds finished jobs into a scoreboard.
//!
//! - **[`core`]**: Pure, deterministic logic (record schema, state machine,
//!   repo keys, rule concatenation, CLI flavor detection). No I/O.
//! - **[`io`]**: Side-effecting operations (state layout, job store,
//!   subprocesses, agent invocation, artifacts, event log, scoreboard).
//!
//! Orchestration modules ([`protocol`], [`worker`], [`pool`], [`drain`],
//! [`submit`]) coordinate core logic with I/O to implement the CLI and the
//! HTTP ingress.

pub mod core;
pub mod drain;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pool;
pub mod protocol;
pub mod submit;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod worker;
