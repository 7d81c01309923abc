//! Petgraph-backed instance graph construction and validation
//!
//! Turns an expanded pipeline into a validated DAG. Validation is pure and
//! runs to completion: every violation found (dangling references, slot
//! mismatches, unbound or doubly bound inputs, unknown placeholders, cycles)
//! is reported in one pass. Violations are named by template, since every
//! tuple family is wired identically, and each distinct one appears once.

use crate::error::{ConfigError, ValidationErrors};
use crate::runtime::expand::{expand, stand_in, AxisTuple, ExpandedPipeline, InstanceId, NodeInstance};
use crate::runtime::resolve::{self, Binding};
use crate::workflow::placeholder;
use crate::workflow::{PipelineTemplate, SinkBinding, SlotKind};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, EdgeRef};
use petgraph::Direction;
use std::collections::{BTreeMap, HashSet};

/// Placeholders always available to argument and output templates
pub const BUILTIN_PLACEHOLDERS: [&str; 2] = ["node_dir", "work_dir"];

/// A validated, acyclic graph of node instances
#[derive(Debug)]
pub struct PipelineGraph {
    expanded: ExpandedPipeline,
    /// Node weight `i` is `InstanceId(i)`
    graph: DiGraph<InstanceId, ()>,
    /// Input bindings per instance, by slot name
    bindings: Vec<BTreeMap<String, Binding>>,
    order: Vec<InstanceId>,
}

impl PipelineGraph {
    /// Expand a template and build its DAG
    ///
    /// When the axes are rejected the remaining checks still run, against a
    /// single stand-in tuple, and their findings follow the axis errors.
    pub fn from_template(pipeline: &PipelineTemplate) -> Result<Self, ValidationErrors> {
        let axis_errors = match expand(pipeline) {
            Ok(expanded) => return Self::build(expanded),
            Err(errors) => errors,
        };

        let mut errors = Validation::default();
        for err in axis_errors.errors() {
            errors.push(err.clone());
        }
        if let Ok(expanded) = expand(&stand_in(pipeline)) {
            if let Err(more) = Self::build(expanded) {
                for err in more.errors() {
                    errors.push(err.clone());
                }
            }
        }
        Err(ValidationErrors::from_vec(errors.into_vec()).unwrap_or(axis_errors))
    }

    /// Validate an expanded pipeline and build its DAG
    pub fn build(expanded: ExpandedPipeline) -> Result<Self, ValidationErrors> {
        tracing::debug!(
            "🏗️ Building instance graph for '{}' ({} instances)",
            expanded.name,
            expanded.instances.len()
        );

        let mut errors = Validation::default();
        for issue in &expanded.issues {
            errors.push(issue.clone());
        }

        let mut graph = DiGraph::with_capacity(expanded.instances.len(), expanded.connections.len());
        for instance in &expanded.instances {
            graph.add_node(instance.id);
        }

        let mut bindings: Vec<BTreeMap<String, Binding>> = vec![BTreeMap::new(); expanded.instances.len()];
        let mut binding_counts: Vec<BTreeMap<String, usize>> = vec![BTreeMap::new(); expanded.instances.len()];

        for conn in &expanded.connections {
            for err in resolve::check_connection(&expanded, conn) {
                errors.push(err);
            }
            let (target, slot) = &conn.target;
            *binding_counts[target.0].entry(slot.clone()).or_default() += 1;
            bindings[target.0].insert(slot.clone(), Binding::Connection(conn.clone()));
            for (source, _) in &conn.sources {
                graph.add_edge(NodeIndex::new(source.0), NodeIndex::new(target.0), ());
            }
        }

        for instance in &expanded.instances {
            let tuple = &expanded.tuples[instance.family];
            check_instance(instance, tuple, &binding_counts[instance.id.0], &mut bindings[instance.id.0], &mut errors);
        }

        check_sinks(&expanded.sinks, &expanded, &mut errors);

        for cycle in find_cycles(&graph, &expanded) {
            errors.push(ConfigError::Cycle { nodes: cycle });
        }

        if let Some(errors) = ValidationErrors::from_vec(errors.into_vec()) {
            tracing::error!("❌ Pipeline '{}' failed validation:\n{}", expanded.name, errors);
            return Err(errors);
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| {
                let node = &expanded.instances[graph[cycle.node_id()].0];
                ValidationErrors::single(ConfigError::Cycle {
                    nodes: vec![node.name().to_string()],
                })
            })?
            .into_iter()
            .map(|idx| graph[idx])
            .collect();

        tracing::debug!("✅ Graph validation successful - no cycles, all inputs bound");

        Ok(Self {
            expanded,
            graph,
            bindings,
            order,
        })
    }

    /// Pipeline name
    pub fn name(&self) -> &str {
        &self.expanded.name
    }

    /// Every node instance, indexed by `InstanceId`
    pub fn instances(&self) -> &[NodeInstance] {
        &self.expanded.instances
    }

    /// Instance by id; panics on an id from another graph
    pub fn instance(&self, id: InstanceId) -> &NodeInstance {
        &self.expanded.instances[id.0]
    }

    /// Axis tuples, one per family
    pub fn tuples(&self) -> &[AxisTuple] {
        &self.expanded.tuples
    }

    /// Results to copy out after the run
    pub fn sinks(&self) -> &[SinkBinding] {
        &self.expanded.sinks
    }

    /// The expansion this graph was built from
    pub fn expanded(&self) -> &ExpandedPipeline {
        &self.expanded
    }

    /// Topological order; a scheduling hint, not an execution order
    pub fn order(&self) -> &[InstanceId] {
        &self.order
    }

    /// How each input slot of an instance gets its value
    pub fn bindings(&self, id: InstanceId) -> &BTreeMap<String, Binding> {
        &self.bindings[id.0]
    }

    /// Distinct instances this one consumes outputs from
    pub fn upstream(&self, id: InstanceId) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self
            .graph
            .edges_directed(NodeIndex::new(id.0), Direction::Incoming)
            .map(|edge| self.graph[edge.source()])
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Every instance reachable downstream, excluding `id` itself
    pub fn descendants(&self, id: InstanceId) -> Vec<InstanceId> {
        let start = NodeIndex::new(id.0);
        let mut dfs = Dfs::new(&self.graph, start);
        let mut found = Vec::new();
        while let Some(idx) = dfs.next(&self.graph) {
            if idx != start {
                found.push(self.graph[idx]);
            }
        }
        found.sort();
        found
    }

    /// Instances of one tuple family, in declaration order
    pub fn family_members(&self, family: usize) -> Vec<InstanceId> {
        self.expanded.family_members(family).map(|i| i.id).collect()
    }
}

/// Ordered, de-duplicated violation list
#[derive(Default)]
struct Validation {
    errors: Vec<ConfigError>,
    seen: HashSet<String>,
}

impl Validation {
    fn push(&mut self, error: ConfigError) {
        if self.seen.insert(error.to_string()) {
            self.errors.push(error);
        }
    }

    fn into_vec(self) -> Vec<ConfigError> {
        self.errors
    }
}

fn check_instance(
    instance: &NodeInstance,
    tuple: &AxisTuple,
    counts: &BTreeMap<String, usize>,
    bindings: &mut BTreeMap<String, Binding>,
    errors: &mut Validation,
) {
    let template = &instance.template;

    for input in &template.inputs {
        let connected = counts.get(&input.name).copied().unwrap_or(0);
        match &input.source {
            Some(source) => {
                if connected > 0 {
                    errors.push(ConfigError::DuplicateBinding {
                        node: template.name.clone(),
                        slot: input.name.clone(),
                        count: connected + 1,
                    });
                }
                if let Some(err) = resolve::check_source(template, &input.name, input.kind, source, tuple) {
                    errors.push(err);
                }
                bindings.insert(input.name.clone(), Binding::Source(source.clone()));
            }
            None if connected == 0 => errors.push(ConfigError::UnboundInput {
                node: template.name.clone(),
                slot: input.name.clone(),
            }),
            None if connected > 1 => errors.push(ConfigError::DuplicateBinding {
                node: template.name.clone(),
                slot: input.name.clone(),
                count: connected,
            }),
            None => {}
        }
    }

    for output in &template.outputs {
        let bad_count = match output.kind {
            SlotKind::File => output.paths.len() != 1,
            SlotKind::FileList => output.paths.is_empty(),
            SlotKind::Scalar => true,
        };
        if bad_count {
            errors.push(ConfigError::IncompatibleSlots {
                node: template.name.clone(),
                slot: output.name.clone(),
                source_desc: format!("{} naming rule(s)", output.paths.len()),
                expected: output.kind.to_string(),
                reason: "a file output needs one rule, a list at least one; scalar outputs are not supported"
                    .to_string(),
            });
        }
    }

    let is_axis = |name: &str| tuple.get(name).is_some();
    let is_param = |name: &str| instance.params.contains_key(name);
    let is_builtin = |name: &str| BUILTIN_PLACEHOLDERS.contains(&name);

    for output in &template.outputs {
        for rule in &output.paths {
            for name in placeholder::placeholders(rule) {
                if !(is_param(&name) || is_axis(&name) || is_builtin(&name)) {
                    errors.push(ConfigError::UnresolvedPlaceholder {
                        node: template.name.clone(),
                        placeholder: name,
                        location: format!("output '{}'", output.name),
                    });
                }
            }
        }
    }

    let args = std::iter::once(&template.invocation.program).chain(template.invocation.args.iter());
    for arg in args {
        for name in placeholder::placeholders(arg) {
            let known = template.input_slot(&name).is_some()
                || template.output_slot(&name).is_some()
                || is_param(&name)
                || is_axis(&name)
                || is_builtin(&name);
            if !known {
                errors.push(ConfigError::UnresolvedPlaceholder {
                    node: template.name.clone(),
                    placeholder: name,
                    location: "invocation".to_string(),
                });
            }
        }
    }
}

fn check_sinks(sinks: &[SinkBinding], expanded: &ExpandedPipeline, errors: &mut Validation) {
    for sink in sinks {
        let found = expanded
            .instances
            .iter()
            .find(|i| i.template.name == sink.source.node)
            .and_then(|i| i.template.output_slot(&sink.source.slot));
        if found.is_none() {
            errors.push(ConfigError::UnknownSinkTarget {
                sink: sink.logical_name.clone(),
                node: sink.source.node.clone(),
                slot: sink.source.slot.clone(),
            });
        }
    }
}

/// Strongly connected components that form cycles, by template name
fn find_cycles(graph: &DiGraph<InstanceId, ()>, expanded: &ExpandedPipeline) -> Vec<Vec<String>> {
    let mut cycles = Vec::new();
    for component in tarjan_scc(graph) {
        let is_cycle = component.len() > 1
            || component
                .first()
                .map(|idx| graph.contains_edge(*idx, *idx))
                .unwrap_or(false);
        if !is_cycle {
            continue;
        }
        let mut names: Vec<String> = component
            .iter()
            .map(|idx| expanded.instances[graph[*idx].0].name().to_string())
            .collect();
        names.sort();
        names.dedup();
        cycles.push(names);
    }
    cycles
}
