//! Parameter expansion
//!
//! Clones the template graph once per combination of axis values. Each
//! combination is a tuple family: its node instances are wired only to each
//! other, never across families. Expansion is deterministic: tuples follow
//! the Cartesian product with the first axis outermost, and instances follow
//! template declaration order within a tuple.

use crate::error::{ConfigError, ValidationErrors};
use crate::workflow::placeholder;
use crate::workflow::{IterableAxis, NodeTemplate, PipelineTemplate, SinkBinding, Transform};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// One combination of axis values, in axis declaration order
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AxisTuple(Vec<(String, String)>);

impl AxisTuple {
    /// Tuple from `(axis, value)` pairs in axis order
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }

    /// Value of an axis, if the tuple has it
    pub fn get(&self, axis: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| value.as_str())
    }

    /// All `(axis, value)` pairs
    pub fn pairs(&self) -> &[(String, String)] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Nested directory of the values, e.g. `s1` or `s1/ses-1`
    pub fn rel_path(&self) -> PathBuf {
        self.0.iter().map(|(_, value)| value.as_str()).collect()
    }
}

impl fmt::Display for AxisTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<&str> = self.0.iter().map(|(_, v)| v.as_str()).collect();
        write!(f, "{}", values.join(","))
    }
}

/// Index of a node instance in the expanded pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InstanceId(pub usize);

/// A concrete, parameterized copy of a node template
#[derive(Debug, Clone)]
pub struct NodeInstance {
    pub id: InstanceId,
    pub template: Arc<NodeTemplate>,
    /// Index into [`ExpandedPipeline::tuples`]
    pub family: usize,
    /// Unique display key, e.g. `recon[s1]`
    pub key: String,
    /// Template parameters with axis placeholders substituted
    pub params: BTreeMap<String, String>,
}

impl NodeInstance {
    /// Template name
    pub fn name(&self) -> &str {
        &self.template.name
    }
}

/// An instantiated connection within one tuple family
#[derive(Debug, Clone)]
pub struct InstanceConnection {
    pub sources: Vec<(InstanceId, String)>,
    pub target: (InstanceId, String),
    pub transform: Transform,
}

/// Result of expansion: every instance and edge of the run
///
/// `issues` holds dangling references found while instantiating; the graph
/// builder reports them together with its own findings.
#[derive(Debug, Clone)]
pub struct ExpandedPipeline {
    pub name: String,
    pub tuples: Vec<AxisTuple>,
    pub instances: Vec<NodeInstance>,
    pub connections: Vec<InstanceConnection>,
    pub sinks: Vec<SinkBinding>,
    pub issues: Vec<ConfigError>,
}

impl ExpandedPipeline {
    /// Instance of a template within a family
    pub fn find(&self, family: usize, template: &str) -> Option<&NodeInstance> {
        self.instances
            .iter()
            .find(|i| i.family == family && i.template.name == template)
    }

    /// Instances belonging to one family
    pub fn family_members(&self, family: usize) -> impl Iterator<Item = &NodeInstance> {
        self.instances.iter().filter(move |i| i.family == family)
    }
}

/// Expand a template over the Cartesian product of its axes
///
/// Fails only when an axis is empty, declared twice or holds a value that
/// cannot name a directory. The family set is undefined then; see
/// [`stand_in`] for checking the rest of the template anyway.
pub fn expand(pipeline: &PipelineTemplate) -> Result<ExpandedPipeline, ValidationErrors> {
    let mut axis_errors = Vec::new();
    let mut seen_axes = HashSet::new();
    for axis in &pipeline.axes {
        if !seen_axes.insert(axis.name.as_str()) {
            axis_errors.push(ConfigError::DuplicateAxis {
                axis: axis.name.clone(),
            });
        }
        if axis.values.is_empty() {
            axis_errors.push(ConfigError::EmptyAxis {
                axis: axis.name.clone(),
            });
        }
        for value in axis.values.iter().filter(|v| !is_path_component(v)) {
            axis_errors.push(ConfigError::InvalidAxisValue {
                axis: axis.name.clone(),
                value: value.clone(),
            });
        }
    }
    if let Some(errors) = ValidationErrors::from_vec(axis_errors) {
        return Err(errors);
    }

    let tuples = cartesian_product(pipeline);
    let mut issues = Vec::new();

    // First declaration wins; later duplicates are reported and dropped
    let mut templates: Vec<Arc<NodeTemplate>> = Vec::new();
    let mut template_index: HashMap<&str, usize> = HashMap::new();
    for node in &pipeline.nodes {
        if template_index.contains_key(node.name.as_str()) {
            issues.push(ConfigError::DuplicateNode {
                node: node.name.clone(),
            });
            continue;
        }
        template_index.insert(node.name.as_str(), templates.len());
        templates.push(Arc::new(node.clone()));
    }

    for template in &templates {
        for (key, value) in &template.params {
            for name in placeholder::placeholders(value) {
                if !pipeline.axes.iter().any(|a| a.name == name) {
                    issues.push(ConfigError::UnresolvedPlaceholder {
                        node: template.name.clone(),
                        placeholder: name,
                        location: format!("parameter '{}'", key),
                    });
                }
            }
        }
    }

    let mut instances = Vec::with_capacity(tuples.len() * templates.len());
    for (family, tuple) in tuples.iter().enumerate() {
        for template in &templates {
            let id = InstanceId(instances.len());
            instances.push(NodeInstance {
                id,
                template: Arc::clone(template),
                family,
                key: instance_key(&template.name, tuple),
                params: resolve_params(template, tuple),
            });
        }
    }

    // Dangling endpoints are reported once per template connection
    let mut valid_connections = Vec::new();
    for conn in &pipeline.connections {
        let context = format!("connection into '{}'", conn.target);
        let mut ok = true;
        for endpoint in conn.sources.iter().chain(std::iter::once(&conn.target)) {
            if !template_index.contains_key(endpoint.node.as_str()) {
                issues.push(ConfigError::UnknownNode {
                    context: context.clone(),
                    node: endpoint.node.clone(),
                });
                ok = false;
            }
        }
        if ok {
            valid_connections.push(conn);
        }
    }

    let per_family = templates.len();
    let instance_of = |family: usize, node: &str| -> InstanceId {
        // checked above: every endpoint names a known template
        InstanceId(family * per_family + template_index[node])
    };

    let mut connections = Vec::with_capacity(tuples.len() * valid_connections.len());
    for family in 0..tuples.len() {
        for conn in &valid_connections {
            connections.push(InstanceConnection {
                sources: conn
                    .sources
                    .iter()
                    .map(|s| (instance_of(family, &s.node), s.slot.clone()))
                    .collect(),
                target: (instance_of(family, &conn.target.node), conn.target.slot.clone()),
                transform: conn.transform.clone(),
            });
        }
    }

    tracing::debug!(
        "🧬 Expanded '{}' into {} tuple families, {} instances, {} connections",
        pipeline.name,
        tuples.len(),
        instances.len(),
        connections.len()
    );

    Ok(ExpandedPipeline {
        name: pipeline.name.clone(),
        tuples,
        instances,
        connections,
        sinks: pipeline.sinks.clone(),
        issues,
    })
}

/// The template with each axis declared once and holding a single value
///
/// The value is the axis name itself. Used to validate nodes, connections
/// and sinks of a template whose axes were rejected.
pub fn stand_in(pipeline: &PipelineTemplate) -> PipelineTemplate {
    let mut seen = HashSet::new();
    let axes = pipeline
        .axes
        .iter()
        .filter(|axis| seen.insert(axis.name.as_str()))
        .map(|axis| IterableAxis::new(axis.name.clone(), [axis.name.clone()]))
        .collect();
    PipelineTemplate {
        axes,
        ..pipeline.clone()
    }
}

/// Tuple values become directories under the work and results roots
fn is_path_component(value: &str) -> bool {
    !value.is_empty() && value != "." && value != ".." && !value.contains(['/', '\\'])
}

fn cartesian_product(pipeline: &PipelineTemplate) -> Vec<AxisTuple> {
    let mut tuples: Vec<Vec<(String, String)>> = vec![Vec::new()];
    for axis in &pipeline.axes {
        let mut next = Vec::with_capacity(tuples.len() * axis.values.len());
        for prefix in &tuples {
            for value in &axis.values {
                let mut tuple = prefix.clone();
                tuple.push((axis.name.clone(), value.clone()));
                next.push(tuple);
            }
        }
        tuples = next;
    }
    tuples.into_iter().map(AxisTuple::new).collect()
}

fn instance_key(template: &str, tuple: &AxisTuple) -> String {
    if tuple.is_empty() {
        template.to_string()
    } else {
        format!("{}[{}]", template, tuple)
    }
}

fn resolve_params(template: &NodeTemplate, tuple: &AxisTuple) -> BTreeMap<String, String> {
    template
        .params
        .iter()
        .map(|(key, value)| {
            // unknown names were reported as issues; keep them verbatim
            let rendered = placeholder::render(value, |name| tuple.get(name).map(String::from))
                .unwrap_or_else(|_| value.clone());
            (key.clone(), rendered)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{NodeTemplate, PipelineBuilder, SlotKind};

    fn two_step(axis_values: &[&str]) -> PipelineTemplate {
        PipelineBuilder::new("two-step")
            .axis("subject_id", axis_values.iter().copied())
            .node(NodeTemplate::new("recon", "recon-all").output("out", "recon.txt"))
            .node(
                NodeTemplate::new("combine", "combine")
                    .input("in", SlotKind::File)
                    .output("out", "bh.stl")
                    .param("label", "{subject_id}-bh"),
            )
            .connect(("recon", "out"), ("combine", "in"))
            .build()
    }

    #[test]
    fn test_one_family_per_axis_value() {
        let expanded = expand(&two_step(&["s1", "s2", "s3"])).unwrap();

        assert_eq!(expanded.tuples.len(), 3);
        assert_eq!(expanded.instances.len(), 6);
        assert_eq!(expanded.connections.len(), 3);
        assert!(expanded.issues.is_empty());

        // no cross-family edges
        for conn in &expanded.connections {
            let target_family = expanded.instances[conn.target.0 .0].family;
            for (source, _) in &conn.sources {
                assert_eq!(expanded.instances[source.0].family, target_family);
            }
        }
    }

    #[test]
    fn test_product_of_axes() {
        let pipeline = PipelineBuilder::new("grid")
            .axis("subject_id", ["s1", "s2"])
            .axis("session", ["a", "b", "c"])
            .node(NodeTemplate::new("n", "true"))
            .build();
        let expanded = expand(&pipeline).unwrap();

        assert_eq!(expanded.tuples.len(), 6);
        assert_eq!(expanded.tuples[0].to_string(), "s1,a");
        assert_eq!(expanded.tuples[5].to_string(), "s2,c");
        assert_eq!(expanded.tuples[4].rel_path(), PathBuf::from("s2/b"));
        assert_eq!(expanded.instances[1].key, "n[s1,b]");
    }

    #[test]
    fn test_no_axes_yields_single_family() {
        let pipeline = PipelineBuilder::new("single")
            .node(NodeTemplate::new("n", "true"))
            .build();
        let expanded = expand(&pipeline).unwrap();
        assert_eq!(expanded.tuples.len(), 1);
        assert_eq!(expanded.instances[0].key, "n");
    }

    #[test]
    fn test_empty_axis_is_an_error() {
        let err = expand(&two_step(&[])).unwrap_err();
        assert!(err.contains(|e| matches!(e, ConfigError::EmptyAxis { axis } if axis == "subject_id")));
    }

    #[test]
    fn test_axis_values_must_be_plain_names() {
        let err = expand(&two_step(&["s1", "../escape", "a/b"])).unwrap_err();
        assert_eq!(err.len(), 2);
        assert!(err.contains(|e| matches!(e, ConfigError::InvalidAxisValue { value, .. } if value == "../escape")));
        assert!(err.contains(|e| matches!(e, ConfigError::InvalidAxisValue { value, .. } if value == "a/b")));
    }

    #[test]
    fn test_stand_in_has_one_value_per_axis() {
        let pipeline = PipelineBuilder::new("p")
            .axis("subject_id", Vec::<String>::new())
            .axis("subject_id", ["s1"])
            .node(NodeTemplate::new("n", "true"))
            .build();
        let expanded = expand(&stand_in(&pipeline)).unwrap();
        assert_eq!(expanded.tuples.len(), 1);
        assert_eq!(expanded.instances[0].key, "n[subject_id]");
    }

    #[test]
    fn test_params_resolve_axis_values() {
        let expanded = expand(&two_step(&["klb"])).unwrap();
        let combine = expanded.find(0, "combine").unwrap();
        assert_eq!(combine.params["label"], "klb-bh");
        assert_eq!(combine.key, "combine[klb]");
    }

    #[test]
    fn test_expansion_is_deterministic() {
        let a = expand(&two_step(&["s1", "s2"])).unwrap();
        let b = expand(&two_step(&["s1", "s2"])).unwrap();
        let keys = |e: &ExpandedPipeline| e.instances.iter().map(|i| i.key.clone()).collect::<Vec<_>>();
        assert_eq!(keys(&a), keys(&b));
    }

    #[test]
    fn test_dangling_connection_recorded_as_issue() {
        let pipeline = PipelineBuilder::new("dangling")
            .axis("subject_id", ["s1", "s2"])
            .node(NodeTemplate::new("a", "true").output("out", "a"))
            .connect(("a", "out"), ("ghost", "in"))
            .build();
        let expanded = expand(&pipeline).unwrap();

        assert!(expanded.connections.is_empty());
        assert_eq!(expanded.issues.len(), 1);
        assert!(matches!(&expanded.issues[0], ConfigError::UnknownNode { node, .. } if node == "ghost"));
    }
}
