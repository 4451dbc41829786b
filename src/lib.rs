//! Bub - a parallel planner/executor build engine for C-family source trees
//!
//! This crate provides the core library functionality for Bub: the
//! file/action dependency graph, incremental dependency discovery from
//! tool-emitted dependency output, inter-package visibility enforcement,
//! and the parallel scheduler that drives actions to completion.

pub mod builder;
pub mod core;
pub mod util;

pub use crate::builder::{BuildOutcome, Engine, Scheduler};
pub use crate::core::{BuildError, NodeTree, Options, Privacy};
