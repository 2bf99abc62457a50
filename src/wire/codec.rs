use crate::core::errors::{Result, SquallError};
use crate::topology::{
    Grouping, ShellCommand, Stage, StageKind, StreamKey, StreamSchema, Topology,
};
use crate::wire::schema::{
    self, ComponentCommon, ComponentObject, ComponentSpec, GlobalStreamId, ShellComponent,
    StormTopology, StreamInfo,
};
use crate::wire::input::SliceInput;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use thrift::protocol::{TBinaryOutputProtocol, TOutputProtocol};
use tracing::debug;

/// Encode a topology with the Thrift binary protocol
pub fn encode(topology: &Topology) -> Result<Vec<u8>> {
    let wire = to_wire(topology)?;
    let mut buf = Vec::new();
    {
        let mut o = TBinaryOutputProtocol::new(&mut buf, true);
        wire.write_to_out_protocol(&mut o)?;
        o.flush()?;
    }
    debug!("Encoded topology: {} stages, {} bytes", topology.len(), buf.len());
    Ok(buf)
}

/// Decode a topology, rejecting trailing bytes
pub fn decode(bytes: &[u8]) -> Result<Topology> {
    let mut i = SliceInput::new(bytes);
    let wire = StormTopology::read_from_in_protocol(&mut i)?;
    if i.remaining() != 0 {
        return Err(SquallError::serialization_msg(
            "thrift",
            format!("{} trailing bytes after topology", i.remaining()),
        ));
    }
    from_wire(wire)
}

/// Encode into a writer
pub fn write_to<W: Write>(topology: &Topology, mut writer: W) -> Result<()> {
    let bytes = encode(topology)?;
    writer
        .write_all(&bytes)
        .map_err(|e| SquallError::io("write encoded topology", e))
}

/// Decode everything a reader yields
pub fn read_from<R: Read>(mut reader: R) -> Result<Topology> {
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .map_err(|e| SquallError::io("read encoded topology", e))?;
    decode(&bytes)
}

/// Convert the graph model to the engine's schema
pub fn to_wire(topology: &Topology) -> Result<StormTopology> {
    let mut wire = StormTopology::default();
    for stage in topology.stages() {
        let spec = ComponentSpec {
            object: ComponentObject::Shell(ShellComponent {
                execution_command: Some(stage.command.execution_command.clone()),
                script: Some(stage.command.script.clone()),
            }),
            common: common_to_wire(stage)?,
        };
        match stage.kind {
            StageKind::Source => wire.spouts.insert(stage.id.clone(), spec),
            StageKind::Transform => wire.bolts.insert(stage.id.clone(), spec),
        };
    }
    Ok(wire)
}

fn common_to_wire(stage: &Stage) -> Result<ComponentCommon> {
    let inputs = stage
        .inputs
        .iter()
        .map(|(key, grouping)| {
            (
                GlobalStreamId {
                    component_id: key.component.clone(),
                    stream_id: key.stream.clone(),
                },
                grouping_to_wire(grouping),
            )
        })
        .collect();
    let streams = stage
        .streams
        .iter()
        .map(|(name, schema)| {
            (
                name.clone(),
                StreamInfo {
                    output_fields: schema.fields.clone(),
                    direct: schema.direct,
                },
            )
        })
        .collect();
    let parallelism_hint = stage
        .parallelism
        .map(|p| {
            i32::try_from(p).map_err(|_| {
                SquallError::serialization_msg(
                    "thrift",
                    format!("parallelism {} of '{}' exceeds i32", p, stage.id),
                )
            })
        })
        .transpose()?;
    let json_conf = stage
        .config
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    Ok(ComponentCommon {
        inputs,
        streams,
        parallelism_hint,
        json_conf,
    })
}

fn grouping_to_wire(grouping: &Grouping) -> schema::Grouping {
    match grouping {
        Grouping::Fields(fields) => schema::Grouping::Fields(fields.clone()),
        Grouping::Shuffle => schema::Grouping::Shuffle,
        Grouping::All => schema::Grouping::All,
        Grouping::None => schema::Grouping::None,
        Grouping::Direct => schema::Grouping::Direct,
        Grouping::LocalOrShuffle => schema::Grouping::LocalOrShuffle,
    }
}

fn grouping_from_wire(grouping: schema::Grouping) -> Grouping {
    match grouping {
        schema::Grouping::Fields(fields) => Grouping::Fields(fields),
        schema::Grouping::Shuffle => Grouping::Shuffle,
        schema::Grouping::All => Grouping::All,
        schema::Grouping::None => Grouping::None,
        schema::Grouping::Direct => Grouping::Direct,
        schema::Grouping::LocalOrShuffle => Grouping::LocalOrShuffle,
    }
}

/// Convert the engine's schema back to the graph model
pub fn from_wire(wire: StormTopology) -> Result<Topology> {
    if !wire.state_spouts.is_empty() {
        return Err(SquallError::serialization_msg(
            "thrift",
            "state spouts are not supported",
        ));
    }
    let mut stages = BTreeMap::new();
    let components = wire
        .spouts
        .into_iter()
        .map(|(id, spec)| (id, StageKind::Source, spec))
        .chain(
            wire.bolts
                .into_iter()
                .map(|(id, spec)| (id, StageKind::Transform, spec)),
        );
    for (id, kind, spec) in components {
        if stages.contains_key(&id) {
            return Err(SquallError::serialization_msg(
                "thrift",
                format!("component id '{}' is both a spout and a bolt", id),
            ));
        }
        let stage = stage_from_wire(id.clone(), kind, spec)?;
        stages.insert(id, stage);
    }
    Ok(Topology { stages })
}

fn stage_from_wire(id: String, kind: StageKind, spec: ComponentSpec) -> Result<Stage> {
    let ComponentObject::Shell(shell) = spec.object;
    let common = spec.common;

    let parallelism = match common.parallelism_hint {
        None => None,
        Some(p) if p > 0 => Some(p as u32),
        Some(p) => {
            return Err(SquallError::serialization_msg(
                "thrift",
                format!("component '{}' has parallelism hint {}", id, p),
            ))
        }
    };
    let config = common
        .json_conf
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    Ok(Stage {
        kind,
        command: ShellCommand {
            execution_command: shell.execution_command.unwrap_or_default(),
            script: shell.script.unwrap_or_default(),
        },
        streams: common
            .streams
            .into_iter()
            .map(|(name, info)| {
                (
                    name,
                    StreamSchema {
                        fields: info.output_fields,
                        direct: info.direct,
                    },
                )
            })
            .collect(),
        inputs: common
            .inputs
            .into_iter()
            .map(|(key, grouping)| {
                (
                    StreamKey::new(key.component_id, key.stream_id),
                    grouping_from_wire(grouping),
                )
            })
            .collect(),
        parallelism,
        config,
        id,
    })
}
