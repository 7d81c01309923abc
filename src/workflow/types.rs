//! Core pipeline type definitions
//!
//! A pipeline is a template graph: node templates describing external tool
//! invocations, connections between their slots, the iterable axes the whole
//! graph is replicated over, and the sinks naming its final outputs. These
//! types are plain data, serialized to JSON for pipeline files, and are never
//! mutated once the pipeline is built.

use crate::workflow::transform::Transform;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Shape of the value carried by a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    /// A single file path
    File,
    /// An ordered list of file paths
    FileList,
    /// A plain string value
    Scalar,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKind::File => write!(f, "file"),
            SlotKind::FileList => write!(f, "file list"),
            SlotKind::Scalar => write!(f, "scalar"),
        }
    }
}

/// A resolved slot value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotValue {
    File(PathBuf),
    Files(Vec<PathBuf>),
    Scalar(String),
}

impl SlotValue {
    pub fn empty() -> Self {
        SlotValue::Files(Vec::new())
    }

    /// Kind of slot this value fits
    pub fn kind(&self) -> SlotKind {
        match self {
            SlotValue::File(_) => SlotKind::File,
            SlotValue::Files(_) => SlotKind::FileList,
            SlotValue::Scalar(_) => SlotKind::Scalar,
        }
    }

    /// File paths carried by this value (none for scalars)
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            SlotValue::File(p) => vec![p.as_path()],
            SlotValue::Files(ps) => ps.iter().map(PathBuf::as_path).collect(),
            SlotValue::Scalar(_) => Vec::new(),
        }
    }

    pub fn into_paths(self) -> Vec<PathBuf> {
        match self {
            SlotValue::File(p) => vec![p],
            SlotValue::Files(ps) => ps,
            SlotValue::Scalar(_) => Vec::new(),
        }
    }

    /// Render as command-line arguments, one per file for lists
    pub fn to_args(&self) -> Vec<String> {
        match self {
            SlotValue::File(p) => vec![p.display().to_string()],
            SlotValue::Files(ps) => ps.iter().map(|p| p.display().to_string()).collect(),
            SlotValue::Scalar(s) => vec![s.clone()],
        }
    }
}

/// Where a source slot gets its value when no connection feeds it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum SlotSource {
    /// The tuple's value for the named axis (scalar)
    Axis { axis: String },
    /// The dataset file list for the tuple, reshaped by the transform
    Dataset {
        #[serde(default)]
        transform: Transform,
    },
    /// A fixed value
    Literal { value: SlotValue },
}

/// Declared input of a node template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSlot {
    pub name: String,
    pub kind: SlotKind,
    /// `None` means the slot must be bound by exactly one connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SlotSource>,
}

/// Declared output of a node template
///
/// `paths` are naming rules with `{placeholder}` references to parameters,
/// axis values and builtins. A `File` output has exactly one rule; a
/// `FileList` output has one rule per produced file. Relative paths are
/// taken relative to the node working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSlot {
    pub name: String,
    pub kind: SlotKind,
    pub paths: Vec<String>,
}

/// External command and its argument template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Resource hints forwarded to a remote batch queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Overrides the run-level queue name for this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub walltime: Option<String>,
}

/// One unit of work: an external tool invocation with typed slots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTemplate {
    /// Unique within the pipeline
    pub name: String,
    pub invocation: Invocation,
    #[serde(default)]
    pub inputs: Vec<InputSlot>,
    #[serde(default)]
    pub outputs: Vec<OutputSlot>,
    /// Static parameters; values may reference axis names as `{axis}`
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceRequest,
}

impl NodeTemplate {
    /// Node running `program` with no arguments or slots
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            invocation: Invocation {
                program: program.into(),
                args: Vec::new(),
            },
            inputs: Vec::new(),
            outputs: Vec::new(),
            params: BTreeMap::new(),
            resources: ResourceRequest::default(),
        }
    }

    /// Append one argument template
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.invocation.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invocation.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Input bound by a connection
    pub fn input(mut self, name: impl Into<String>, kind: SlotKind) -> Self {
        self.inputs.push(InputSlot {
            name: name.into(),
            kind,
            source: None,
        });
        self
    }

    /// Input fed by the axis value, the dataset, or a literal
    pub fn source_input(mut self, name: impl Into<String>, kind: SlotKind, source: SlotSource) -> Self {
        self.inputs.push(InputSlot {
            name: name.into(),
            kind,
            source: Some(source),
        });
        self
    }

    /// Declare a single-file output named by a path rule
    pub fn output(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.outputs.push(OutputSlot {
            name: name.into(),
            kind: SlotKind::File,
            paths: vec![path.into()],
        });
        self
    }

    /// Declare a file-list output, one rule per file
    pub fn output_list<I, S>(mut self, name: impl Into<String>, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs.push(OutputSlot {
            name: name.into(),
            kind: SlotKind::FileList,
            paths: paths.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Set a parameter; axis placeholders are substituted per tuple
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Resources requested when submitted to a queue
    pub fn resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn input_slot(&self, name: &str) -> Option<&InputSlot> {
        self.inputs.iter().find(|s| s.name == name)
    }

    pub fn output_slot(&self, name: &str) -> Option<&OutputSlot> {
        self.outputs.iter().find(|s| s.name == name)
    }
}

/// A named dimension the whole pipeline is replicated over
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterableAxis {
    pub name: String,
    pub values: Vec<String>,
}

impl IterableAxis {
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Reference to a node slot by template name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotRef {
    pub node: String,
    pub slot: String,
}

impl<N: Into<String>, S: Into<String>> From<(N, S)> for SlotRef {
    fn from((node, slot): (N, S)) -> Self {
        Self {
            node: node.into(),
            slot: slot.into(),
        }
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.slot)
    }
}

/// Directed data dependency between template slots
///
/// Instantiated once per axis-value tuple; instances only ever connect to
/// instances of the same tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateConnection {
    pub sources: Vec<SlotRef>,
    pub target: SlotRef,
    #[serde(default)]
    pub transform: Transform,
}

/// Final output copied to `<results_dir>/<tuple path>/<logical_name>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkBinding {
    pub logical_name: String,
    pub source: SlotRef,
}

/// A complete, immutable template graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineTemplate {
    pub name: String,
    #[serde(default)]
    pub axes: Vec<IterableAxis>,
    pub nodes: Vec<NodeTemplate>,
    #[serde(default)]
    pub connections: Vec<TemplateConnection>,
    #[serde(default)]
    pub sinks: Vec<SinkBinding>,
}

impl PipelineTemplate {
    /// Node template by name
    pub fn node(&self, name: &str) -> Option<&NodeTemplate> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Replace the values of an axis, keeping the rest of the pipeline
    pub fn with_axis_values<I, S>(mut self, axis: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        match self.axes.iter_mut().find(|a| a.name == axis) {
            Some(existing) => existing.values = values,
            None => self.axes.push(IterableAxis {
                name: axis.to_string(),
                values,
            }),
        }
        self
    }
}
