//! Execution tree runtime shared by operations, behaviors and commands

pub(crate) mod propagation;
pub(crate) mod tree;
pub(crate) mod variables;
