//! Connection resolution
//!
//! Build-time half: checks that every connection and source slot produces
//! the kind its destination declares. Run-time half: computes the concrete
//! input values of a ready instance from upstream outputs, the dataset file
//! list and the axis values, applying each connection's transform.

use crate::error::{ConfigError, ExecutionError};
use crate::runtime::expand::{AxisTuple, ExpandedPipeline, InstanceConnection, InstanceId};
use crate::workflow::{NodeTemplate, SlotKind, SlotSource, SlotValue};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Resolved outputs of one instance, by slot name
pub type SlotMap = BTreeMap<String, SlotValue>;

/// What feeds an input slot
#[derive(Debug, Clone)]
pub enum Binding {
    Connection(InstanceConnection),
    Source(SlotSource),
}

/// Check one instantiated connection against its endpoint declarations
pub fn check_connection(expanded: &ExpandedPipeline, conn: &InstanceConnection) -> Vec<ConfigError> {
    let mut errors = Vec::new();
    let target = &expanded.instances[conn.target.0 .0].template;
    let target_slot = &conn.target.1;

    if !conn.transform.accepts_arity(conn.sources.len()) {
        errors.push(ConfigError::InvalidArity {
            node: target.name.clone(),
            slot: target_slot.clone(),
            transform: conn.transform.name().to_string(),
            expected: conn.transform.arity().to_string(),
            actual: conn.sources.len(),
        });
    }

    let mut source_kinds = Vec::with_capacity(conn.sources.len());
    let mut source_names = Vec::with_capacity(conn.sources.len());
    for (source_id, slot) in &conn.sources {
        let source = &expanded.instances[source_id.0].template;
        source_names.push(format!("{}.{}", source.name, slot));
        match source.output_slot(slot) {
            Some(output) => source_kinds.push(output.kind),
            None => errors.push(ConfigError::UnknownSlot {
                node: source.name.clone(),
                slot: slot.clone(),
                direction: "output",
            }),
        }
    }

    let Some(input) = target.input_slot(target_slot) else {
        errors.push(ConfigError::UnknownSlot {
            node: target.name.clone(),
            slot: target_slot.clone(),
            direction: "input",
        });
        return errors;
    };

    // kinds are only meaningful once every source slot exists
    if source_kinds.len() == conn.sources.len() && !source_kinds.is_empty() {
        let source_desc = format!("{} via {}", source_names.join(" + "), conn.transform.name());
        match conn.transform.output_kind(&source_kinds) {
            Ok(kind) if kind == input.kind => {}
            Ok(kind) => errors.push(ConfigError::IncompatibleSlots {
                node: target.name.clone(),
                slot: target_slot.clone(),
                source_desc,
                expected: input.kind.to_string(),
                reason: format!("produces a {}", kind),
            }),
            Err(reason) => errors.push(ConfigError::IncompatibleSlots {
                node: target.name.clone(),
                slot: target_slot.clone(),
                source_desc,
                expected: input.kind.to_string(),
                reason,
            }),
        }
    }
    errors
}

/// Check a source slot (axis, dataset, literal) of a template
pub fn check_source(
    template: &NodeTemplate,
    slot: &str,
    kind: SlotKind,
    source: &SlotSource,
    tuple: &AxisTuple,
) -> Option<ConfigError> {
    let incompatible = |source_desc: String, reason: String| ConfigError::IncompatibleSlots {
        node: template.name.clone(),
        slot: slot.to_string(),
        source_desc,
        expected: kind.to_string(),
        reason,
    };

    match source {
        SlotSource::Axis { axis } => {
            if tuple.get(axis).is_none() {
                Some(incompatible(format!("axis '{}'", axis), "no such axis".to_string()))
            } else if kind != SlotKind::Scalar {
                Some(incompatible(
                    format!("axis '{}'", axis),
                    "axis values are scalars".to_string(),
                ))
            } else {
                None
            }
        }
        SlotSource::Dataset { transform } => {
            let desc = format!("dataset files via {}", transform.name());
            match transform.output_kind(&[SlotKind::FileList]) {
                Ok(produced) if produced == kind => None,
                Ok(produced) => Some(incompatible(desc, format!("produces a {}", produced))),
                Err(reason) => Some(incompatible(desc, reason)),
            }
        }
        SlotSource::Literal { value } => {
            if value.kind() == kind {
                None
            } else {
                Some(incompatible(
                    "literal value".to_string(),
                    format!("literal is a {}", value.kind()),
                ))
            }
        }
    }
}

/// Everything an instance's inputs can be resolved from
pub struct ResolveContext<'a> {
    pub tuple: &'a AxisTuple,
    pub dataset_files: &'a [PathBuf],
    pub upstream: &'a HashMap<InstanceId, SlotMap>,
}

/// Compute the concrete value of every input slot of an instance
///
/// Fails with a resolution error when a selection finds no match, so a
/// missing hemisphere never turns into an empty argument.
pub fn resolve_inputs(
    node_key: &str,
    template: &NodeTemplate,
    bindings: &BTreeMap<String, Binding>,
    ctx: &ResolveContext<'_>,
) -> Result<SlotMap, ExecutionError> {
    let mut resolved = SlotMap::new();

    for input in &template.inputs {
        let Some(binding) = bindings.get(&input.name) else {
            continue;
        };
        let value = match binding {
            Binding::Source(SlotSource::Axis { axis }) => {
                SlotValue::Scalar(ctx.tuple.get(axis).unwrap_or_default().to_string())
            }
            Binding::Source(SlotSource::Literal { value }) => value.clone(),
            Binding::Source(SlotSource::Dataset { transform }) => transform.apply(
                node_key,
                &input.name,
                vec![SlotValue::Files(ctx.dataset_files.to_vec())],
            )?,
            Binding::Connection(conn) => {
                let mut values = Vec::with_capacity(conn.sources.len());
                for (source_id, slot) in &conn.sources {
                    let value = ctx
                        .upstream
                        .get(source_id)
                        .and_then(|outputs| outputs.get(slot))
                        .ok_or_else(|| {
                            ExecutionError::Io(format!(
                                "upstream output '{}' for '{}.{}' is not available",
                                slot, node_key, input.name
                            ))
                        })?;
                    values.push(value.clone());
                }
                conn.transform.apply(node_key, &input.name, values)?
            }
        };
        resolved.insert(input.name.clone(), value);
    }

    Ok(resolved)
}
