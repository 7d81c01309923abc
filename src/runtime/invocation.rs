//! Invocation rendering and output checks
//!
//! Turns an instance plus its resolved inputs into a concrete command line,
//! names its expected outputs before it runs, and checks afterwards that
//! every declared output exists and is non-empty.

use crate::error::ExecutionError;
use crate::runtime::expand::{AxisTuple, NodeInstance};
use crate::runtime::resolve::SlotMap;
use crate::workflow::placeholder;
use crate::workflow::{SlotKind, SlotValue};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Working directory of one instance: `<work_dir>/<tuple path>/<node name>`
pub fn node_dir(work_dir: &Path, tuple: &AxisTuple, node: &str) -> PathBuf {
    work_dir.join(tuple.rel_path()).join(node)
}

/// A fully rendered external command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    /// The instance's node directory
    pub cwd: PathBuf,
}

impl Command {
    /// Single shell line, quoted for `sh`
    pub fn to_shell(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| shell_quote(s))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Quote a word for POSIX `sh` when it contains anything unusual
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Names visible to argument and output templates
///
/// Lookup order is inputs, outputs, parameters, axis values, builtins; the
/// first scope defining a name wins.
struct Scope<'a> {
    inputs: Option<&'a SlotMap>,
    outputs: Option<&'a SlotMap>,
    instance: &'a NodeInstance,
    tuple: &'a AxisTuple,
    node_dir: &'a Path,
    work_dir: &'a Path,
}

impl Scope<'_> {
    fn lookup(&self, name: &str) -> Option<Vec<String>> {
        let slot = |map: Option<&SlotMap>| map.and_then(|m| m.get(name)).map(SlotValue::to_args);
        slot(self.inputs)
            .or_else(|| slot(self.outputs))
            .or_else(|| self.instance.params.get(name).map(|v| vec![v.clone()]))
            .or_else(|| self.tuple.get(name).map(|v| vec![v.to_string()]))
            .or_else(|| match name {
                "node_dir" => Some(vec![self.node_dir.display().to_string()]),
                "work_dir" => Some(vec![self.work_dir.display().to_string()]),
                _ => None,
            })
    }

    fn render(&self, template: &str) -> Result<String, ExecutionError> {
        placeholder::render(template, |name| self.lookup(name).map(|v| v.join(" ")))
            .map_err(|name| self.unknown(&name, template))
    }

    fn unknown(&self, name: &str, template: &str) -> ExecutionError {
        ExecutionError::Render(format!(
            "unknown placeholder '{{{}}}' in '{}' of {}",
            name, template, self.instance.key
        ))
    }
}

/// Expected output paths of an instance
///
/// Relative naming rules are taken relative to the node directory.
pub fn expected_outputs(
    instance: &NodeInstance,
    tuple: &AxisTuple,
    node_dir: &Path,
    work_dir: &Path,
) -> Result<SlotMap, ExecutionError> {
    let scope = Scope {
        inputs: None,
        outputs: None,
        instance,
        tuple,
        node_dir,
        work_dir,
    };

    let mut outputs = SlotMap::new();
    for slot in &instance.template.outputs {
        let mut paths = Vec::with_capacity(slot.paths.len());
        for rule in &slot.paths {
            paths.push(node_dir.join(scope.render(rule)?));
        }
        let value = match slot.kind {
            SlotKind::File => match paths.pop() {
                Some(path) if paths.is_empty() => SlotValue::File(path),
                _ => {
                    return Err(ExecutionError::Render(format!(
                        "output '{}' of {} needs exactly one naming rule",
                        slot.name, instance.key
                    )))
                }
            },
            _ => SlotValue::Files(paths),
        };
        outputs.insert(slot.name.clone(), value);
    }
    Ok(outputs)
}

/// Render the program and argument templates of an instance
///
/// An argument that is exactly one list-valued placeholder expands to one
/// argument per file; elsewhere list values are joined with spaces.
pub fn render_command(
    instance: &NodeInstance,
    tuple: &AxisTuple,
    inputs: &SlotMap,
    outputs: &SlotMap,
    node_dir: &Path,
    work_dir: &Path,
) -> Result<Command, ExecutionError> {
    let scope = Scope {
        inputs: Some(inputs),
        outputs: Some(outputs),
        instance,
        tuple,
        node_dir,
        work_dir,
    };

    let invocation = &instance.template.invocation;
    let program = scope.render(&invocation.program)?;
    let mut args = Vec::with_capacity(invocation.args.len());
    for arg in &invocation.args {
        match placeholder::sole_placeholder(arg) {
            Some(name) => match scope.lookup(&name) {
                Some(values) => args.extend(values),
                None => return Err(scope.unknown(&name, arg)),
            },
            None => args.push(scope.render(arg)?),
        }
    }

    Ok(Command {
        program,
        args,
        cwd: node_dir.to_path_buf(),
    })
}

/// Every file an input refers to must exist before the tool starts
pub async fn check_inputs(inputs: &SlotMap) -> Result<(), ExecutionError> {
    for (slot, value) in inputs {
        for path in value.paths() {
            if tokio::fs::metadata(path).await.is_err() {
                return Err(ExecutionError::MissingInput {
                    slot: slot.clone(),
                    path: path.to_path_buf(),
                });
            }
        }
    }
    Ok(())
}

/// Every declared output must exist and, for files, be non-empty
pub async fn verify_outputs(outputs: &SlotMap) -> Result<(), ExecutionError> {
    for (slot, value) in outputs {
        for path in value.paths() {
            let metadata = tokio::fs::metadata(path).await.map_err(|_| ExecutionError::MissingOutput {
                slot: slot.clone(),
                path: path.to_path_buf(),
            })?;
            if metadata.is_file() && metadata.len() == 0 {
                return Err(ExecutionError::EmptyOutput {
                    slot: slot.clone(),
                    path: path.to_path_buf(),
                });
            }
        }
    }
    Ok(())
}
