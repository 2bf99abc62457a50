//! Subscription checks run when a topology is built.
//!
//! The engine itself only notices a bad subscription once the topology is
//! running. These checks surface the same problems at build time, with a
//! configurable severity.

use crate::core::errors::{Result, SquallError};
use crate::topology::model::{subscription_graph, Grouping, Stage, StageKind};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use tracing::warn;

/// Severity of subscription problems found at build time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCheck {
    /// Do not check
    Off,
    /// Log each problem and continue
    #[default]
    Warn,
    /// Fail the build on the first problem
    Strict,
}

impl FromStr for FieldCheck {
    type Err = SquallError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(FieldCheck::Off),
            "warn" => Ok(FieldCheck::Warn),
            "strict" => Ok(FieldCheck::Strict),
            other => Err(SquallError::configuration(format!(
                "Unknown field check policy '{}' (expected off, warn or strict)",
                other
            ))),
        }
    }
}

/// A subscription that does not line up with its upstream stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionProblem {
    UnknownSource {
        target: String,
        source: String,
    },
    UnknownStream {
        target: String,
        source: String,
        stream: String,
    },
    UnknownField {
        target: String,
        source: String,
        stream: String,
        field: String,
    },
    /// No chain of subscriptions leads from a source to this stage
    Unreachable {
        target: String,
    },
}

impl SubscriptionProblem {
    fn target(&self) -> &str {
        match self {
            Self::UnknownSource { target, .. }
            | Self::UnknownStream { target, .. }
            | Self::UnknownField { target, .. }
            | Self::Unreachable { target } => target,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::UnknownSource { target, source } => {
                format!("'{}' subscribes to unknown stage '{}'", target, source)
            }
            Self::UnknownStream {
                target,
                source,
                stream,
            } => format!(
                "'{}' subscribes to stream '{}' which '{}' does not declare",
                target, stream, source
            ),
            Self::UnknownField {
                target,
                source,
                stream,
                field,
            } => format!(
                "'{}' groups on field '{}' missing from '{}' stream '{}'",
                target, field, source, stream
            ),
            Self::Unreachable { target } => {
                format!("'{}' is not fed by any source stage", target)
            }
        }
    }
}

/// Find every subscription problem among `stages`
pub fn find_problems(stages: &BTreeMap<String, Stage>) -> Vec<SubscriptionProblem> {
    let mut problems = Vec::new();
    for stage in stages.values() {
        for (key, grouping) in &stage.inputs {
            let Some(upstream) = stages.get(&key.component) else {
                problems.push(SubscriptionProblem::UnknownSource {
                    target: stage.id.clone(),
                    source: key.component.clone(),
                });
                continue;
            };
            let Some(schema) = upstream.streams.get(&key.stream) else {
                problems.push(SubscriptionProblem::UnknownStream {
                    target: stage.id.clone(),
                    source: key.component.clone(),
                    stream: key.stream.clone(),
                });
                continue;
            };
            if let Grouping::Fields(fields) = grouping {
                for field in fields {
                    if !schema.fields.contains(field) {
                        problems.push(SubscriptionProblem::UnknownField {
                            target: stage.id.clone(),
                            source: key.component.clone(),
                            stream: key.stream.clone(),
                            field: field.clone(),
                        });
                    }
                }
            }
        }
    }
    problems.extend(
        unreachable_stages(stages)
            .into_iter()
            .map(|target| SubscriptionProblem::Unreachable { target }),
    );
    problems
}

/// Transforms that receive nothing because no source reaches them
fn unreachable_stages(stages: &BTreeMap<String, Stage>) -> Vec<String> {
    let graph = subscription_graph(stages);
    let is_source = |id: &String| {
        stages
            .get(id)
            .map_or(false, |stage| stage.kind == StageKind::Source)
    };
    let mut fed = HashSet::new();
    for start in graph.node_indices().filter(|&n| is_source(&graph[n])) {
        let mut dfs = Dfs::new(&graph, start);
        while let Some(node) = dfs.next(&graph) {
            fed.insert(node);
        }
    }
    graph
        .node_indices()
        .filter(|n| !fed.contains(n))
        .map(|n| graph[n].clone())
        .collect()
}

/// Apply `policy` to the problems found among `stages`
pub fn check_subscriptions(stages: &BTreeMap<String, Stage>, policy: FieldCheck) -> Result<()> {
    if policy == FieldCheck::Off {
        return Ok(());
    }
    for problem in find_problems(stages) {
        match policy {
            FieldCheck::Strict => {
                return Err(SquallError::configuration_in(
                    problem.describe(),
                    problem.target(),
                ))
            }
            _ => warn!("Subscription check: {}", problem.describe()),
        }
    }
    Ok(())
}
