use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;
use squall::{wire, Grouping, SquallError, StageSpec, Topology, TopologyBuilder};

const GROUPINGS: usize = 7;

/// How one stage is wired: upstream seed, grouping, parallelism, an extra
/// `side` stream (its `direct` flag), and a config value
type Link = (usize, usize, Option<u32>, Option<bool>, Option<u16>);

fn build(ids: &[String], sources: usize, links: &[Link]) -> Topology {
    let sources = sources.clamp(1, ids.len());
    let mut builder = TopologyBuilder::new();
    for (index, id) in ids.iter().enumerate() {
        let (seed, grouping, parallelism, side, config) = links[index];
        let mut spec = StageSpec::new(format!("{}.py", id)).output_fields(["f0", "f1"]);
        if let Some(limit) = config {
            spec = spec.config(json!({"topology.max.spout.pending": limit, "stage": id}));
        }
        if index < sources {
            builder.register_source(id.as_str(), spec, parallelism).unwrap();
        } else {
            let upstream = ids[seed % index].clone();
            let subscriptions = builder
                .register_transform(id.as_str(), spec, parallelism)
                .unwrap();
            match grouping % GROUPINGS {
                0 => subscriptions.shuffle_grouping(upstream),
                1 => subscriptions.fields_grouping(upstream, ["f0"]),
                2 => subscriptions.global_grouping(upstream),
                3 => subscriptions.all_grouping(upstream),
                4 => subscriptions.none_grouping(upstream),
                5 => subscriptions.grouping_on(upstream, "side", Grouping::Direct),
                _ => subscriptions.local_or_shuffle_grouping(upstream),
            };
        }
        if let Some(direct) = side {
            builder.declare_stream(id, "side", ["s0"], direct).unwrap();
        }
    }
    builder.build().unwrap()
}

fn topologies() -> impl Strategy<Value = Topology> {
    (
        prop::collection::btree_set("[a-z][a-z0-9_]{0,8}", 1..8),
        1usize..4,
        prop::collection::vec(
            (
                0usize..100,
                0usize..GROUPINGS,
                prop::option::of(1u32..64),
                prop::option::of(any::<bool>()),
                prop::option::of(any::<u16>()),
            ),
            8,
        ),
    )
        .prop_map(|(ids, sources, links)| {
            let ids: Vec<String> = ids.into_iter().collect();
            build(&ids, sources, &links)
        })
}

proptest! {
    #[test]
    fn test_encode_decode_reproduces_topology(topology in topologies()) {
        let bytes = wire::encode(&topology).unwrap();
        prop_assert_eq!(wire::decode(&bytes).unwrap(), topology.clone());
        prop_assert_eq!(wire::encode(&topology).unwrap(), bytes);
    }

    #[test]
    fn test_second_registration_of_an_id_fails(
        id in "[a-z][a-z0-9_]{0,12}",
        first_source in any::<bool>(),
        second_source in any::<bool>(),
    ) {
        let mut builder = TopologyBuilder::new();
        let spec = StageSpec::new("stage.py");
        if first_source {
            builder.register_source(id.as_str(), spec.clone(), None).unwrap();
        } else {
            builder.register_transform(id.as_str(), spec.clone(), None).unwrap();
        }
        let result = if second_source {
            builder.register_source(id.as_str(), spec, Some(2)).map(|_| ())
        } else {
            builder.register_transform(id.as_str(), spec, Some(2)).map(|_| ())
        };
        prop_assert!(
            matches!(result, Err(SquallError::DuplicateId { .. })),
            "expected duplicate id error, got {:?}",
            result
        );
        prop_assert_eq!(builder.len(), 1);
        prop_assert_eq!(builder.stage(&id).unwrap().parallelism, None);
    }
}

#[test]
fn test_truncated_encoding_never_decodes() {
    let ids: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    let topology = build(
        &ids,
        1,
        &[
            (0, 0, Some(2), Some(true), Some(7)),
            (0, 1, None, None, None),
            (1, 5, Some(3), Some(false), None),
        ],
    );
    let bytes = wire::encode(&topology).unwrap();
    for len in 0..bytes.len() {
        assert!(wire::decode(&bytes[..len]).is_err(), "prefix of {len} bytes decoded");
    }
    assert_eq!(wire::decode(&bytes).unwrap(), topology);
}

#[test]
fn test_direct_subscription_and_streams_survive_encoding() {
    let ids: Vec<String> = ["emit", "route"].iter().map(|s| s.to_string()).collect();
    let topology = build(
        &ids,
        1,
        &[(0, 0, None, Some(true), Some(1)), (0, 5, Some(4), None, None)],
    );
    let decoded = wire::decode(&wire::encode(&topology).unwrap()).unwrap();

    let emit = decoded.stage("emit").unwrap();
    assert!(emit.stream("side").unwrap().direct);
    assert_eq!(emit.stream("side").unwrap().fields, vec!["s0"]);
    assert_eq!(emit.config, Some(json!({"topology.max.spout.pending": 1, "stage": "emit"})));
    let route = decoded.stage("route").unwrap();
    assert_eq!(
        route.inputs.values().collect::<Vec<_>>(),
        vec![&Grouping::Direct]
    );
    assert_eq!(decoded, topology);
}
