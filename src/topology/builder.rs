use crate::core::errors::{Result, SquallError};
use crate::topology::model::{
    Grouping, Stage, StageKind, StageSpec, StreamKey, StreamSchema, Topology, DEFAULT_STREAM,
};
use crate::topology::validate::{self, FieldCheck};
use std::collections::BTreeMap;
use tracing::debug;

/// Parallelism values that replace registration-time hints, keyed by stage id.
///
/// Entries are consumed as they are applied; whatever is left when
/// [`finish`](Self::finish) is called names no stage and is an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParallelismOverrides {
    pending: BTreeMap<String, u32>,
}

impl ParallelismOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stage_id: impl Into<String>, parallelism: u32) {
        self.pending.insert(stage_id.into(), parallelism);
    }

    /// Remove and return the override for a stage
    pub fn take(&mut self, stage_id: &str) -> Option<u32> {
        self.pending.remove(stage_id)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Fail with every key that was never taken
    pub fn finish(self) -> Result<()> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(SquallError::UnmatchedOverrides {
                keys: self.pending.into_keys().collect(),
            })
        }
    }
}

impl<S: Into<String>> FromIterator<(S, u32)> for ParallelismOverrides {
    fn from_iter<I: IntoIterator<Item = (S, u32)>>(iter: I) -> Self {
        Self {
            pending: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Collects stages and subscriptions into a [`Topology`].
///
/// The builder is handed to a topology definition, which registers stages on
/// it; the package assembler then rewrites commands and parallelism before
/// calling [`build`](Self::build).
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    stages: BTreeMap<String, Stage>,
    field_check: FieldCheck,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how subscriptions are checked against upstream schemas
    pub fn field_check(mut self, policy: FieldCheck) -> Self {
        self.field_check = policy;
        self
    }

    pub fn set_field_check(&mut self, policy: FieldCheck) {
        self.field_check = policy;
    }

    /// Define a source stage.
    ///
    /// Fails if `id` is already used by a source or a transform.
    pub fn register_source(
        &mut self,
        id: impl Into<String>,
        spec: StageSpec,
        parallelism: Option<u32>,
    ) -> Result<()> {
        self.register(id.into(), StageKind::Source, spec, parallelism)?;
        Ok(())
    }

    /// Define a transform stage and return a handle for declaring its inputs.
    ///
    /// Fails if `id` is already used by a source or a transform.
    pub fn register_transform(
        &mut self,
        id: impl Into<String>,
        spec: StageSpec,
        parallelism: Option<u32>,
    ) -> Result<Subscriptions<'_>> {
        let id = self.register(id.into(), StageKind::Transform, spec, parallelism)?;
        Ok(Subscriptions {
            builder: self,
            target: id,
        })
    }

    fn register(
        &mut self,
        id: String,
        kind: StageKind,
        spec: StageSpec,
        parallelism: Option<u32>,
    ) -> Result<String> {
        if id.is_empty() {
            return Err(SquallError::configuration("Stage id cannot be empty"));
        }
        if let Some(existing) = self.stages.get(&id) {
            return Err(SquallError::DuplicateId {
                id,
                existing: existing.kind,
            });
        }
        if let Some(p) = parallelism {
            check_parallelism(&id, p)?;
        }

        let mut streams = BTreeMap::new();
        if !spec.output_fields.is_empty() {
            streams.insert(
                DEFAULT_STREAM.to_string(),
                StreamSchema::new(spec.output_fields),
            );
        }

        debug!("Registered {} stage: {}", kind, id);
        self.stages.insert(
            id.clone(),
            Stage {
                id: id.clone(),
                kind,
                command: spec.command,
                streams,
                inputs: BTreeMap::new(),
                parallelism,
                config: spec.config,
            },
        );
        Ok(id)
    }

    /// Subscribe `target` to the default stream of `source`
    pub fn subscribe(
        &mut self,
        target: &str,
        source: impl Into<String>,
        grouping: Grouping,
    ) -> Result<Subscriptions<'_>> {
        self.subscribe_on(target, source, DEFAULT_STREAM, grouping)
    }

    /// Subscribe `target` to a named stream of `source`.
    ///
    /// An existing subscription to the same (source, stream) is replaced.
    pub fn subscribe_on(
        &mut self,
        target: &str,
        source: impl Into<String>,
        stream: impl Into<String>,
        grouping: Grouping,
    ) -> Result<Subscriptions<'_>> {
        match self.stages.get(target) {
            None => {
                return Err(SquallError::configuration_in(
                    format!("Cannot subscribe unknown stage '{}'", target),
                    target,
                ))
            }
            Some(stage) if stage.kind != StageKind::Transform => {
                return Err(SquallError::configuration_in(
                    format!("Source stage '{}' cannot subscribe to streams", target),
                    target,
                ))
            }
            Some(_) => {}
        }
        Ok(Subscriptions {
            builder: self,
            target: target.to_string(),
        }
        .grouping_on(source, stream, grouping))
    }

    /// Add or replace an output stream of a stage
    pub fn declare_stream<I, S>(
        &mut self,
        id: &str,
        name: impl Into<String>,
        fields: I,
        direct: bool,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let stage = self.stages.get_mut(id).ok_or_else(|| {
            SquallError::configuration_in(
                format!("Cannot declare stream on unknown stage '{}'", id),
                id,
            )
        })?;
        stage
            .streams
            .insert(name.into(), StreamSchema::new(fields).direct(direct));
        Ok(())
    }

    /// Apply every override, then fail naming those that matched no stage
    pub fn apply_parallelism_overrides(&mut self, mut overrides: ParallelismOverrides) -> Result<()> {
        let ids: Vec<String> = self.stages.keys().cloned().collect();
        for id in ids {
            if let Some(p) = overrides.take(&id) {
                self.set_parallelism(&id, p)?;
            }
        }
        overrides.finish()
    }

    pub(crate) fn set_parallelism(&mut self, id: &str, parallelism: u32) -> Result<()> {
        check_parallelism(id, parallelism)?;
        if let Some(stage) = self.stages.get_mut(id) {
            debug!(
                "Parallelism of {} set to {} (was {:?})",
                id, parallelism, stage.parallelism
            );
            stage.parallelism = Some(parallelism);
        }
        Ok(())
    }

    pub(crate) fn stage_mut(&mut self, id: &str) -> Option<&mut Stage> {
        self.stages.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.stages.contains_key(id)
    }

    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.get(id)
    }

    /// Stage ids, sources first, each group in id order
    pub fn stage_ids(&self) -> Vec<String> {
        let mut ids: Vec<(StageKind, &String)> =
            self.stages.values().map(|s| (s.kind, &s.id)).collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Finalize default streams, check subscriptions, and produce the topology
    pub fn build(mut self) -> Result<Topology> {
        for stage in self.stages.values_mut() {
            if stage.streams.is_empty() {
                stage
                    .streams
                    .insert(DEFAULT_STREAM.to_string(), StreamSchema::default());
            }
        }
        validate::check_subscriptions(&self.stages, self.field_check)?;
        Ok(Topology {
            stages: self.stages,
        })
    }
}

fn check_parallelism(id: &str, parallelism: u32) -> Result<()> {
    if parallelism == 0 {
        return Err(SquallError::configuration_in(
            format!("Parallelism of stage '{}' must be positive", id),
            id,
        ));
    }
    Ok(())
}

/// Chainable handle for declaring the inputs of one transform
#[derive(Debug)]
pub struct Subscriptions<'a> {
    builder: &'a mut TopologyBuilder,
    target: String,
}

impl<'a> Subscriptions<'a> {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn grouping_on(
        self,
        source: impl Into<String>,
        stream: impl Into<String>,
        grouping: Grouping,
    ) -> Self {
        if let Some(stage) = self.builder.stages.get_mut(&self.target) {
            stage
                .inputs
                .insert(StreamKey::new(source, stream), grouping);
        }
        self
    }

    pub fn grouping(self, source: impl Into<String>, grouping: Grouping) -> Self {
        self.grouping_on(source, DEFAULT_STREAM, grouping)
    }

    pub fn shuffle_grouping(self, source: impl Into<String>) -> Self {
        self.grouping(source, Grouping::Shuffle)
    }

    pub fn fields_grouping<I, S>(self, source: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.grouping(source, Grouping::fields(fields))
    }

    pub fn global_grouping(self, source: impl Into<String>) -> Self {
        self.grouping(source, Grouping::global())
    }

    pub fn all_grouping(self, source: impl Into<String>) -> Self {
        self.grouping(source, Grouping::All)
    }

    pub fn none_grouping(self, source: impl Into<String>) -> Self {
        self.grouping(source, Grouping::None)
    }

    pub fn direct_grouping(self, source: impl Into<String>) -> Self {
        self.grouping(source, Grouping::Direct)
    }

    pub fn local_or_shuffle_grouping(self, source: impl Into<String>) -> Self {
        self.grouping(source, Grouping::LocalOrShuffle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn word_count() -> TopologyBuilder {
        let mut builder = TopologyBuilder::new();
        builder
            .register_source(
                "spout",
                StageSpec::new("randomsentence.py").output_fields(["sentence"]),
                Some(5),
            )
            .unwrap();
        builder
            .register_transform(
                "split",
                StageSpec::new("splitsentence.py").output_fields(["word"]),
                Some(8),
            )
            .unwrap()
            .shuffle_grouping("spout");
        builder
            .register_transform(
                "count",
                StageSpec::new("wordcount.py").output_fields(["word", "count"]),
                Some(12),
            )
            .unwrap()
            .fields_grouping("split", ["word"]);
        builder
    }

    #[test]
    fn test_builder_word_count() {
        let topology = word_count().build().unwrap();

        assert_eq!(topology.len(), 3);
        assert_eq!(topology.sources().count(), 1);
        assert_eq!(topology.transforms().count(), 2);

        let count = topology.stage("count").unwrap();
        assert_eq!(count.parallelism, Some(12));
        assert_eq!(
            count.inputs.get(&StreamKey::new("split", "default")),
            Some(&Grouping::fields(["word"]))
        );
        assert_eq!(
            count.stream("default").unwrap().fields,
            vec!["word".to_string(), "count".to_string()]
        );
    }

    #[test]
    fn test_duplicate_id_either_role() {
        let mut builder = word_count();
        let err = builder
            .register_source("split", StageSpec::new("x.py"), None)
            .unwrap_err();
        assert!(matches!(
            err,
            SquallError::DuplicateId { ref id, existing: StageKind::Transform } if id == "split"
        ));

        let err = builder
            .register_transform("spout", StageSpec::new("x.py"), None)
            .unwrap_err();
        assert!(matches!(
            err,
            SquallError::DuplicateId { existing: StageKind::Source, .. }
        ));
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let mut builder = TopologyBuilder::new();
        let err = builder
            .register_source("spout", StageSpec::new("s.py"), Some(0))
            .unwrap_err();
        assert_eq!(err.category(), "configuration");
        assert!(!builder.contains("spout"));
    }

    #[test]
    fn test_subscription_overwrites_same_key() {
        let mut builder = word_count();
        builder
            .subscribe("count", "split", Grouping::All)
            .unwrap()
            .grouping_on("split", "errors", Grouping::Shuffle);
        let count = builder.stage("count").unwrap();
        assert_eq!(count.inputs.len(), 2);
        assert_eq!(
            count.inputs.get(&StreamKey::new("split", "default")),
            Some(&Grouping::All)
        );
    }

    #[test]
    fn test_source_cannot_subscribe() {
        let mut builder = word_count();
        assert!(builder.subscribe("spout", "split", Grouping::Shuffle).is_err());
        assert!(builder.subscribe("missing", "split", Grouping::Shuffle).is_err());
    }

    #[test]
    fn test_default_stream_rules() {
        let mut builder = TopologyBuilder::new();
        builder
            .register_source("silent", StageSpec::new("a.py"), None)
            .unwrap();
        builder
            .register_source("multi", StageSpec::new("b.py"), None)
            .unwrap();
        builder
            .declare_stream("multi", "errors", ["reason"], true)
            .unwrap();

        let topology = builder.build().unwrap();
        let silent = topology.stage("silent").unwrap();
        assert_eq!(silent.streams.keys().collect::<Vec<_>>(), vec!["default"]);
        let multi = topology.stage("multi").unwrap();
        assert_eq!(multi.streams.keys().collect::<Vec<_>>(), vec!["errors"]);
        assert!(multi.stream("errors").unwrap().direct);
    }

    #[test]
    fn test_overrides_win_and_unmatched_named() {
        let mut builder = word_count();
        let overrides: ParallelismOverrides =
            vec![("split", 3), ("nope", 2), ("also_nope", 1)].into_iter().collect();
        let err = builder.apply_parallelism_overrides(overrides).unwrap_err();
        match err {
            SquallError::UnmatchedOverrides { keys } => {
                assert_eq!(keys, vec!["also_nope".to_string(), "nope".to_string()])
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(builder.stage("split").unwrap().parallelism, Some(3));
    }

    #[test]
    fn test_stage_ids_sources_first() {
        let builder = word_count();
        assert_eq!(builder.stage_ids(), vec!["spout", "count", "split"]);
    }
}
