//! Constructive builder for pipeline templates
//!
//! The builder only accumulates declarations. All checking happens when the
//! template is expanded and validated, so every mistake is reported at once.

use crate::workflow::transform::Transform;
use crate::workflow::types::{
    IterableAxis, NodeTemplate, PipelineTemplate, SinkBinding, SlotRef, TemplateConnection,
};

#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    axes: Vec<IterableAxis>,
    nodes: Vec<NodeTemplate>,
    connections: Vec<TemplateConnection>,
    sinks: Vec<SinkBinding>,
}

impl PipelineBuilder {
    /// Start an empty pipeline
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            axes: Vec::new(),
            nodes: Vec::new(),
            connections: Vec::new(),
            sinks: Vec::new(),
        }
    }

    /// Add an axis to replicate the pipeline over
    pub fn axis<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.axes.push(IterableAxis::new(name, values));
        self
    }

    /// Add a node template
    pub fn node(mut self, node: NodeTemplate) -> Self {
        self.nodes.push(node);
        self
    }

    /// Direct connection from one output to one input
    pub fn connect(self, from: impl Into<SlotRef>, to: impl Into<SlotRef>) -> Self {
        self.connect_with(vec![from.into()], to, Transform::Identity)
    }

    /// Connection through a selection transform
    pub fn select(self, from: impl Into<SlotRef>, to: impl Into<SlotRef>, transform: Transform) -> Self {
        self.connect_with(vec![from.into()], to, transform)
    }

    /// Several outputs packed into one list input, in the given order
    pub fn pack<I, R>(self, sources: I, to: impl Into<SlotRef>) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<SlotRef>,
    {
        let sources = sources.into_iter().map(Into::into).collect();
        self.connect_with(sources, to, Transform::PackList)
    }

    pub fn connect_with(
        mut self,
        sources: Vec<SlotRef>,
        to: impl Into<SlotRef>,
        transform: Transform,
    ) -> Self {
        self.connections.push(TemplateConnection {
            sources,
            target: to.into(),
            transform,
        });
        self
    }

    /// Copy an output to the results directory under `logical_name`
    pub fn sink(mut self, logical_name: impl Into<String>, from: impl Into<SlotRef>) -> Self {
        self.sinks.push(SinkBinding {
            logical_name: logical_name.into(),
            source: from.into(),
        });
        self
    }

    /// Finish the template; validation happens at expansion
    pub fn build(self) -> PipelineTemplate {
        PipelineTemplate {
            name: self.name,
            axes: self.axes,
            nodes: self.nodes,
            connections: self.connections,
            sinks: self.sinks,
        }
    }
}
