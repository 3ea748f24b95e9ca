//! Process engine
//!
//! [`ProcessEngine`] is the embedding surface: deployment, runtime commands,
//! job management and queries over one [`EngineConfig`](crate::config::EngineConfig).

mod process_engine;
mod registry;

pub use process_engine::ProcessEngine;
pub use registry::{DelegateRegistry, JobHandlerRegistry};
