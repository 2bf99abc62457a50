//! Core types of the topology graph model.
//!
//! A [`Topology`] maps stage ids to [`Stage`]s. Each stage declares its output
//! streams and, for transforms, the upstream streams it subscribes to.

use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Name of the stream a stage emits on unless told otherwise
pub const DEFAULT_STREAM: &str = "default";

/// Interpreter used for stages that do not name one
pub const DEFAULT_EXECUTION_COMMAND: &str = "python3";

/// Role of a stage in the topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Emits records into the topology (a spout)
    Source,
    /// Consumes upstream streams (a bolt)
    Transform,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Source => f.write_str("source"),
            StageKind::Transform => f.write_str("transform"),
        }
    }
}

/// Command line the engine runs for a stage: `<execution_command> <script>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellCommand {
    pub execution_command: String,
    pub script: String,
}

impl ShellCommand {
    pub fn new(execution_command: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            execution_command: execution_command.into(),
            script: script.into(),
        }
    }
}

/// Schema of one output stream
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamSchema {
    /// Ordered output field names
    pub fields: Vec<String>,
    /// Whether emitters address downstream tasks directly
    pub direct: bool,
}

impl StreamSchema {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            direct: false,
        }
    }

    pub fn direct(mut self, direct: bool) -> Self {
        self.direct = direct;
        self
    }
}

/// Identifies an upstream stream: the source stage and the stream name.
///
/// Used as the key of a stage's subscription map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub component: String,
    pub stream: String,
}

impl StreamKey {
    pub fn new(component: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            stream: stream.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.component, self.stream)
    }
}

/// How a stream's records are distributed across the subscriber's tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grouping {
    /// Partition by the values of these fields; empty means global
    Fields(Vec<String>),
    Shuffle,
    All,
    None,
    Direct,
    LocalOrShuffle,
}

impl Grouping {
    /// All records go to a single task
    pub fn global() -> Self {
        Grouping::Fields(Vec::new())
    }

    pub fn fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Grouping::Fields(fields.into_iter().map(Into::into).collect())
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Grouping::Fields(fields) if fields.is_empty())
    }
}

/// What a caller supplies when registering a stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub command: ShellCommand,
    /// Fields of the default stream
    pub output_fields: Vec<String>,
    pub config: Option<Value>,
}

impl StageSpec {
    /// A stage running `script` with the default interpreter
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            command: ShellCommand::new(DEFAULT_EXECUTION_COMMAND, script),
            output_fields: Vec::new(),
            config: None,
        }
    }

    pub fn execution_command(mut self, command: impl Into<String>) -> Self {
        self.command.execution_command = command.into();
        self
    }

    pub fn output_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }
}

/// A registered node of the topology
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub id: String,
    pub kind: StageKind,
    pub command: ShellCommand,
    pub streams: BTreeMap<String, StreamSchema>,
    pub inputs: BTreeMap<StreamKey, Grouping>,
    pub parallelism: Option<u32>,
    pub config: Option<Value>,
}

impl Stage {
    pub fn stream(&self, name: &str) -> Option<&StreamSchema> {
        self.streams.get(name)
    }
}

/// A complete, validated topology ready for serialization
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Topology {
    pub(crate) stages: BTreeMap<String, Stage>,
}

impl Topology {
    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.get(id)
    }

    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.values()
    }

    pub fn sources(&self) -> impl Iterator<Item = &Stage> {
        self.stages.values().filter(|s| s.kind == StageKind::Source)
    }

    pub fn transforms(&self) -> impl Iterator<Item = &Stage> {
        self.stages.values().filter(|s| s.kind == StageKind::Transform)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Directed graph of subscriptions, edges pointing downstream.
    ///
    /// Subscriptions naming unknown stages are left out.
    pub fn to_graph(&self) -> DiGraph<String, StreamKey> {
        subscription_graph(&self.stages)
    }
}

/// Nodes are added in id order, so node `n` is the `n`th key of `stages`
pub(crate) fn subscription_graph(stages: &BTreeMap<String, Stage>) -> DiGraph<String, StreamKey> {
    let mut graph = DiGraph::new();
    let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
    for id in stages.keys() {
        indices.insert(id.as_str(), graph.add_node(id.clone()));
    }
    for stage in stages.values() {
        let Some(&target) = indices.get(stage.id.as_str()) else {
            continue;
        };
        for key in stage.inputs.keys() {
            if let Some(&source) = indices.get(key.component.as_str()) {
                graph.add_edge(source, target, key.clone());
            }
        }
    }
    graph
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_is_empty_fields() {
        assert_eq!(Grouping::global(), Grouping::fields(Vec::<String>::new()));
        assert!(Grouping::global().is_global());
        assert!(!Grouping::fields(["word"]).is_global());
        assert!(!Grouping::Shuffle.is_global());
    }

    #[test]
    fn test_stream_key_ordering_is_structural() {
        let a = StreamKey::new("a", "z");
        let b = StreamKey::new("b", "a");
        assert!(a < b);
        assert_ne!(StreamKey::new("a", "b"), StreamKey::new("a", "c"));
    }

    #[test]
    fn test_stage_spec_builder() {
        let spec = StageSpec::new("split.py")
            .execution_command("python3.11")
            .output_fields(["word"]);
        assert_eq!(spec.command.script, "split.py");
        assert_eq!(spec.command.execution_command, "python3.11");
        assert_eq!(spec.output_fields, vec!["word"]);
    }
}
