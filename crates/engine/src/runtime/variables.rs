//! Variable scoping over the execution tree
//!
//! Lookup goes innermost-first from an execution to the root. Writes land on
//! the nearest execution that already defines the name, otherwise on the
//! root (the process instance scope).

use serde_json::Value;
use uuid::Uuid;

use crate::context::CommandContext;
use crate::error::EngineError;
use crate::persistence::Variables;

/// Execution ids from `execution_id` up to the root
pub(crate) fn chain(ctx: &mut CommandContext, execution_id: Uuid) -> Result<Vec<Uuid>, EngineError> {
    let session = ctx.entities()?;
    let mut ids = Vec::new();
    let mut current = Some(execution_id);
    while let Some(id) = current {
        ids.push(id);
        current = session.execution(id)?.parent_id;
    }
    Ok(ids)
}

/// Every variable visible from an execution, inner definitions shadowing outer ones
pub(crate) fn visible(ctx: &mut CommandContext, execution_id: Uuid) -> Result<Variables, EngineError> {
    let ids = chain(ctx, execution_id)?;
    let session = ctx.entities()?;

    let mut merged = Variables::new();
    for id in ids.iter().rev() {
        for (name, value) in &session.execution(*id)?.variables {
            merged.insert(name.clone(), value.clone());
        }
    }
    Ok(merged)
}

pub(crate) fn set_variable(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    name: &str,
    value: Value,
) -> Result<(), EngineError> {
    let ids = chain(ctx, execution_id)?;
    let session = ctx.entities()?;

    let defining = ids.iter().copied().find(|id| {
        session
            .execution(*id)
            .map(|e| e.variables.contains_key(name))
            .unwrap_or(false)
    });
    let Some(target) = defining.or_else(|| ids.last().copied()) else {
        return Ok(());
    };

    session
        .execution_mut(target)?
        .variables
        .insert(name.to_string(), value);
    Ok(())
}

pub(crate) fn set_variables(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    variables: Variables,
) -> Result<(), EngineError> {
    for (name, value) in variables {
        set_variable(ctx, execution_id, &name, value)?;
    }
    Ok(())
}

/// Write variables onto the execution itself
pub(crate) fn set_local(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    variables: Variables,
) -> Result<(), EngineError> {
    ctx.entities()?
        .execution_mut(execution_id)?
        .variables
        .extend(variables);
    Ok(())
}
