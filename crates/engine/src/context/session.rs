//! Resource sessions opened lazily by a unit of work

use std::any::{Any, TypeId};

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::error::EngineError;

/// A resource bound to one unit of work
///
/// Sessions are opened on first request, at most one per type per context.
/// `flush` runs exactly once and only when no error was captured; `close`
/// always runs, with `committed` telling whether the flush went through.
#[async_trait]
pub trait Session: Send + 'static {
    async fn flush(&mut self) -> Result<(), EngineError>;

    async fn close(&mut self, committed: bool);

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Opens sessions of one concrete type
pub trait SessionFactory: Send + Sync + 'static {
    /// `TypeId` of the session this factory opens
    fn session_type(&self) -> TypeId;

    fn open(&self, config: &EngineConfig) -> Box<dyn Session>;
}
