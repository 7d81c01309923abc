//! Pipeline definition layer
//!
//! Template types, the pure connection transforms, the constructive builder,
//! JSON persistence of pipeline files, and the built-in surface pipeline.

// Core template type definitions
pub mod types;

// Pure transforms applied on connections (identity, selection, packing)
pub mod transform;

// `{name}` placeholder parsing shared by arguments and output rules
pub mod placeholder;

// Builder producing immutable pipeline templates
pub mod builder;

// JSON pipeline files
pub mod storage;

// Built-in FreeSurfer surface reconstruction pipeline
pub mod surface;

pub use builder::PipelineBuilder;
pub use transform::{Predicate, Transform};
pub use types::{
    InputSlot, Invocation, IterableAxis, NodeTemplate, OutputSlot, PipelineTemplate,
    ResourceRequest, SinkBinding, SlotKind, SlotRef, SlotSource, SlotValue, TemplateConnection,
};
