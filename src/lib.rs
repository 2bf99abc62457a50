// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
}

pub mod bootstrap; // Worker-side environment setup and stage handoff
pub mod package;   // Deployable archive assembly
pub mod topology;  // Stage graph model and builder
pub mod wire;      // Thrift binary encoding of topologies

// Re-exports for convenience
pub use crate::core::config::{
    BootstrapSettings, EnvironmentChoice, PackageOptions, Submitter, TopologyConfig,
    CONFIG_NAMESPACE,
};
pub use crate::core::errors::{BuildStep, Result, SquallError};
pub use package::{PackageAssembler, PackageReport};
pub use topology::{
    FieldCheck, Grouping, StageKind, StageSpec, Topology, TopologyBuilder, TopologyDefinition,
    YamlDefinition,
};

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn word_count(builder: &mut TopologyBuilder) -> Result<()> {
        builder.register_source(
            "randomsentence",
            StageSpec::new("randomsentence.py").output_fields(["sentence"]),
            Some(1),
        )?;
        builder
            .register_transform(
                "splitsentence",
                StageSpec::new("splitsentence.py").output_fields(["word"]),
                Some(1),
            )?
            .shuffle_grouping("randomsentence");
        builder
            .register_transform(
                "wordcount",
                StageSpec::new("wordcount.py").output_fields(["word", "count"]),
                Some(1),
            )?
            .fields_grouping("splitsentence", ["word"]);
        Ok(())
    }

    #[test]
    fn test_definition_builds_and_round_trips() {
        let mut builder = TopologyBuilder::new();
        word_count.define(&mut builder).unwrap();
        let topology = builder.build().unwrap();

        assert_eq!(topology.sources().count(), 1);
        assert_eq!(topology.transforms().count(), 2);
        let bytes = wire::encode(&topology).unwrap();
        assert_eq!(wire::decode(&bytes).unwrap(), topology);

        let graph = topology.to_graph();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);
        assert!(!petgraph::algo::is_cyclic_directed(&graph));
    }

    #[test]
    fn test_duplicate_id_across_kinds() {
        let mut builder = TopologyBuilder::new();
        builder
            .register_source("x", StageSpec::new("x.py"), None)
            .unwrap();
        let err = builder
            .register_transform("x", StageSpec::new("x.py"), None)
            .unwrap_err();
        assert_eq!(err.category(), "configuration");
        assert!(matches!(err, SquallError::DuplicateId { existing: StageKind::Source, .. }));
    }
}
