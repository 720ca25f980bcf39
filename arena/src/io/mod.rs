//! I/O helpers: state layout, queue directories, subprocesses, artifacts.

pub mod agent;
pub mod artifacts;
pub mod atomic;
pub mod config;
pub mod journal;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod rules;
pub mod scoreboard;
pub mod store;
