//! Core data model: errors, the ownership tree, options, and statements.

pub mod error;
pub mod node;
pub mod options;
pub mod statement;

pub use error::{BuildError, Origin};
pub use node::{NodeId, NodeKind, NodeTree, Privacy};
pub use options::{Options, Rule, RuleKind};
pub use statement::Statement;
