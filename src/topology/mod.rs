//! Topology graph model: stages, streams, subscriptions.

pub mod builder;
pub mod definition;
pub mod model;
pub mod validate;

pub use builder::{ParallelismOverrides, Subscriptions, TopologyBuilder};
pub use definition::{TopologyDefinition, YamlDefinition};
pub use model::{
    Grouping, ShellCommand, Stage, StageKind, StageSpec, StreamKey, StreamSchema, Topology,
    DEFAULT_EXECUTION_COMMAND, DEFAULT_STREAM,
};
pub use validate::FieldCheck;
