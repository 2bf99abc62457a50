//! Topology definitions: the caller-supplied entry point that populates a
//! [`TopologyBuilder`].
//!
//! Any `Fn(&mut TopologyBuilder) -> Result<()>` is a definition. Topologies
//! can also be declared in YAML and loaded with [`YamlDefinition`]:
//!
//! ```yaml
//! sources:
//!   - id: spout
//!     script: randomsentence.py
//!     parallelism: 1
//!     fields: [sentence]
//! transforms:
//!   - id: split
//!     script: splitsentence.py
//!     fields: [word]
//!     inputs:
//!       - source: spout
//!         grouping: shuffle
//!   - id: count
//!     script: wordcount.py
//!     fields: [word, count]
//!     inputs:
//!       - source: split
//!         grouping: fields
//!         fields: [word]
//! ```

use crate::core::errors::{Result, SquallError};
use crate::topology::builder::TopologyBuilder;
use crate::topology::model::{Grouping, StageSpec, DEFAULT_STREAM};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

/// Populates a builder with the stages of one topology
pub trait TopologyDefinition {
    fn define(&self, builder: &mut TopologyBuilder) -> Result<()>;
}

impl<F> TopologyDefinition for F
where
    F: Fn(&mut TopologyBuilder) -> Result<()>,
{
    fn define(&self, builder: &mut TopologyBuilder) -> Result<()> {
        self(builder)
    }
}

/// Grouping names accepted in YAML definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingKind {
    Shuffle,
    Fields,
    Global,
    All,
    None,
    Direct,
    LocalOrShuffle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputDef {
    pub source: String,
    #[serde(default = "default_stream")]
    pub stream: String,
    pub grouping: GroupingKind,
    #[serde(default)]
    pub fields: Vec<String>,
}

impl InputDef {
    fn to_grouping(&self, target: &str) -> Result<Grouping> {
        if !self.fields.is_empty() && self.grouping != GroupingKind::Fields {
            return Err(SquallError::configuration_in(
                format!(
                    "Input of '{}' from '{}' lists fields but uses {:?} grouping",
                    target, self.source, self.grouping
                ),
                target,
            ));
        }
        Ok(match self.grouping {
            GroupingKind::Shuffle => Grouping::Shuffle,
            GroupingKind::Fields => Grouping::Fields(self.fields.clone()),
            GroupingKind::Global => Grouping::global(),
            GroupingKind::All => Grouping::All,
            GroupingKind::None => Grouping::None,
            GroupingKind::Direct => Grouping::Direct,
            GroupingKind::LocalOrShuffle => Grouping::LocalOrShuffle,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamDef {
    pub name: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub direct: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDef {
    pub id: String,
    pub script: String,
    #[serde(default)]
    pub execution_command: Option<String>,
    #[serde(default)]
    pub parallelism: Option<u32>,
    /// Fields of the default stream
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub streams: Vec<StreamDef>,
    #[serde(default)]
    pub inputs: Vec<InputDef>,
    #[serde(default)]
    pub config: Option<Value>,
}

impl StageDef {
    fn spec(&self) -> StageSpec {
        let mut spec = StageSpec::new(self.script.clone()).output_fields(self.fields.clone());
        if let Some(command) = &self.execution_command {
            spec = spec.execution_command(command.clone());
        }
        if let Some(config) = &self.config {
            spec = spec.config(config.clone());
        }
        spec
    }
}

/// A topology declared in a YAML document
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlDefinition {
    #[serde(default)]
    pub sources: Vec<StageDef>,
    #[serde(default)]
    pub transforms: Vec<StageDef>,
}

impl YamlDefinition {
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Load a definition file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SquallError::io(format!("read definition {}", path.display()), e))?;
        let definition = Self::from_yaml(&text).map_err(|e| match e {
            SquallError::Serialization { source, .. } => SquallError::Serialization {
                format: format!("yaml ({})", path.display()),
                source,
            },
            other => other,
        })?;
        info!(
            "Loaded topology definition {} ({} sources, {} transforms)",
            path.display(),
            definition.sources.len(),
            definition.transforms.len()
        );
        Ok(definition)
    }

    /// Conventional definition path inside a topology directory
    pub fn default_path(topology_dir: &Path) -> PathBuf {
        topology_dir.join("topology.yaml")
    }
}

impl TopologyDefinition for YamlDefinition {
    fn define(&self, builder: &mut TopologyBuilder) -> Result<()> {
        for source in &self.sources {
            if !source.inputs.is_empty() {
                return Err(SquallError::configuration_in(
                    format!("Source stage '{}' cannot declare inputs", source.id),
                    source.id.as_str(),
                ));
            }
            builder.register_source(source.id.clone(), source.spec(), source.parallelism)?;
        }
        for transform in &self.transforms {
            builder.register_transform(
                transform.id.clone(),
                transform.spec(),
                transform.parallelism,
            )?;
            for input in &transform.inputs {
                let grouping = input.to_grouping(&transform.id)?;
                builder.subscribe_on(
                    &transform.id,
                    input.source.clone(),
                    input.stream.clone(),
                    grouping,
                )?;
            }
        }
        for stage in self.sources.iter().chain(&self.transforms) {
            for stream in &stage.streams {
                builder.declare_stream(
                    &stage.id,
                    stream.name.clone(),
                    stream.fields.clone(),
                    stream.direct,
                )?;
            }
        }
        Ok(())
    }
}

fn default_stream() -> String {
    DEFAULT_STREAM.to_string()
}
