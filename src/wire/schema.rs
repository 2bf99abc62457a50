//! Thrift structs of the engine's topology schema (`thrift/storm.thrift`).
//!
//! Each type reads and writes itself with the same field ids and types as the
//! engine's generated classes, so bytes produced here load with the engine's
//! own deserializer.

use std::collections::BTreeMap;
use thrift::protocol::{
    verify_required_field_exists, TFieldIdentifier, TInputProtocol, TListIdentifier,
    TMapIdentifier, TOutputProtocol, TStructIdentifier, TType,
};
use thrift::{ProtocolError, ProtocolErrorKind};

fn field(name: &str, field_type: TType, id: i16) -> TFieldIdentifier {
    TFieldIdentifier::new(name, field_type, id)
}

fn invalid_data(message: String) -> thrift::Error {
    thrift::Error::Protocol(ProtocolError::new(ProtocolErrorKind::InvalidData, message))
}

fn read_string_list(i: &mut dyn TInputProtocol) -> thrift::Result<Vec<String>> {
    let list_ident = i.read_list_begin()?;
    let mut values = Vec::new();
    for _ in 0..list_ident.size {
        values.push(i.read_string()?);
    }
    i.read_list_end()?;
    Ok(values)
}

fn write_string_list(o: &mut dyn TOutputProtocol, values: &[String]) -> thrift::Result<()> {
    o.write_list_begin(&TListIdentifier::new(TType::String, values.len() as i32))?;
    for value in values {
        o.write_string(value)?;
    }
    o.write_list_end()
}

/// Read a union, returning the single set member
fn read_union<T>(
    i: &mut dyn TInputProtocol,
    name: &str,
    mut member: impl FnMut(&mut dyn TInputProtocol, i16, TType) -> thrift::Result<Option<T>>,
) -> thrift::Result<T> {
    i.read_struct_begin()?;
    let mut value = None;
    let mut received = 0;
    loop {
        let field_ident = i.read_field_begin()?;
        if field_ident.field_type == TType::Stop {
            break;
        }
        match field_ident.id {
            Some(id) => match member(i, id, field_ident.field_type)? {
                Some(v) => {
                    value = Some(v);
                    received += 1;
                }
                None => i.skip(field_ident.field_type)?,
            },
            None => i.skip(field_ident.field_type)?,
        }
        i.read_field_end()?;
    }
    i.read_struct_end()?;
    match (value, received) {
        (Some(v), 1) => Ok(v),
        (None, _) => Err(invalid_data(format!("received empty union from remote {}", name))),
        _ => Err(invalid_data(format!(
            "received multiple fields for union from remote {}",
            name
        ))),
    }
}

/// Skip to the end of a struct whose members carry no data
fn read_empty_struct(i: &mut dyn TInputProtocol) -> thrift::Result<()> {
    i.read_struct_begin()?;
    loop {
        let field_ident = i.read_field_begin()?;
        if field_ident.field_type == TType::Stop {
            break;
        }
        i.skip(field_ident.field_type)?;
        i.read_field_end()?;
    }
    i.read_struct_end()
}

fn write_null_struct(o: &mut dyn TOutputProtocol) -> thrift::Result<()> {
    o.write_struct_begin(&TStructIdentifier::new("NullStruct"))?;
    o.write_field_stop()?;
    o.write_struct_end()
}

//
// GlobalStreamId
//

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalStreamId {
    pub component_id: String,
    pub stream_id: String,
}

impl GlobalStreamId {
    pub fn read_from_in_protocol(i: &mut dyn TInputProtocol) -> thrift::Result<Self> {
        i.read_struct_begin()?;
        let mut component_id = None;
        let mut stream_id = None;
        loop {
            let field_ident = i.read_field_begin()?;
            if field_ident.field_type == TType::Stop {
                break;
            }
            match field_ident.id {
                Some(1) => component_id = Some(i.read_string()?),
                Some(2) => stream_id = Some(i.read_string()?),
                _ => i.skip(field_ident.field_type)?,
            }
            i.read_field_end()?;
        }
        i.read_struct_end()?;
        verify_required_field_exists("GlobalStreamId.componentId", &component_id)?;
        verify_required_field_exists("GlobalStreamId.streamId", &stream_id)?;
        Ok(Self {
            component_id: component_id.unwrap_or_default(),
            stream_id: stream_id.unwrap_or_default(),
        })
    }

    pub fn write_to_out_protocol(&self, o: &mut dyn TOutputProtocol) -> thrift::Result<()> {
        o.write_struct_begin(&TStructIdentifier::new("GlobalStreamId"))?;
        o.write_field_begin(&field("componentId", TType::String, 1))?;
        o.write_string(&self.component_id)?;
        o.write_field_end()?;
        o.write_field_begin(&field("streamId", TType::String, 2))?;
        o.write_string(&self.stream_id)?;
        o.write_field_end()?;
        o.write_field_stop()?;
        o.write_struct_end()
    }
}

//
// Grouping
//

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grouping {
    Fields(Vec<String>),
    Shuffle,
    All,
    None,
    Direct,
    LocalOrShuffle,
}

impl Grouping {
    pub fn read_from_in_protocol(i: &mut dyn TInputProtocol) -> thrift::Result<Self> {
        read_union(i, "Grouping", |i, id, _| {
            let grouping = match id {
                1 => Grouping::Fields(read_string_list(i)?),
                2 | 3 | 4 | 5 | 8 => {
                    read_empty_struct(i)?;
                    match id {
                        2 => Grouping::Shuffle,
                        3 => Grouping::All,
                        4 => Grouping::None,
                        5 => Grouping::Direct,
                        _ => Grouping::LocalOrShuffle,
                    }
                }
                6 | 7 => {
                    return Err(invalid_data(
                        "custom groupings are not supported".to_string(),
                    ))
                }
                _ => return Ok(None),
            };
            Ok(Some(grouping))
        })
    }

    pub fn write_to_out_protocol(&self, o: &mut dyn TOutputProtocol) -> thrift::Result<()> {
        o.write_struct_begin(&TStructIdentifier::new("Grouping"))?;
        match self {
            Grouping::Fields(fields) => {
                o.write_field_begin(&field("fields", TType::List, 1))?;
                write_string_list(o, fields)?;
                o.write_field_end()?;
            }
            other => {
                let (name, id) = match other {
                    Grouping::Shuffle => ("shuffle", 2),
                    Grouping::All => ("all", 3),
                    Grouping::None => ("none", 4),
                    Grouping::Direct => ("direct", 5),
                    _ => ("local_or_shuffle", 8),
                };
                o.write_field_begin(&field(name, TType::Struct, id))?;
                write_null_struct(o)?;
                o.write_field_end()?;
            }
        }
        o.write_field_stop()?;
        o.write_struct_end()
    }
}

//
// StreamInfo
//

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub output_fields: Vec<String>,
    pub direct: bool,
}

impl StreamInfo {
    pub fn read_from_in_protocol(i: &mut dyn TInputProtocol) -> thrift::Result<Self> {
        i.read_struct_begin()?;
        let mut output_fields = None;
        let mut direct = None;
        loop {
            let field_ident = i.read_field_begin()?;
            if field_ident.field_type == TType::Stop {
                break;
            }
            match field_ident.id {
                Some(1) => output_fields = Some(read_string_list(i)?),
                Some(2) => direct = Some(i.read_bool()?),
                _ => i.skip(field_ident.field_type)?,
            }
            i.read_field_end()?;
        }
        i.read_struct_end()?;
        verify_required_field_exists("StreamInfo.output_fields", &output_fields)?;
        verify_required_field_exists("StreamInfo.direct", &direct)?;
        Ok(Self {
            output_fields: output_fields.unwrap_or_default(),
            direct: direct.unwrap_or_default(),
        })
    }

    pub fn write_to_out_protocol(&self, o: &mut dyn TOutputProtocol) -> thrift::Result<()> {
        o.write_struct_begin(&TStructIdentifier::new("StreamInfo"))?;
        o.write_field_begin(&field("output_fields", TType::List, 1))?;
        write_string_list(o, &self.output_fields)?;
        o.write_field_end()?;
        o.write_field_begin(&field("direct", TType::Bool, 2))?;
        o.write_bool(self.direct)?;
        o.write_field_end()?;
        o.write_field_stop()?;
        o.write_struct_end()
    }
}

//
// ShellComponent
//

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShellComponent {
    pub execution_command: Option<String>,
    pub script: Option<String>,
}

impl ShellComponent {
    pub fn read_from_in_protocol(i: &mut dyn TInputProtocol) -> thrift::Result<Self> {
        i.read_struct_begin()?;
        let mut shell = ShellComponent::default();
        loop {
            let field_ident = i.read_field_begin()?;
            if field_ident.field_type == TType::Stop {
                break;
            }
            match field_ident.id {
                Some(1) => shell.execution_command = Some(i.read_string()?),
                Some(2) => shell.script = Some(i.read_string()?),
                _ => i.skip(field_ident.field_type)?,
            }
            i.read_field_end()?;
        }
        i.read_struct_end()?;
        Ok(shell)
    }

    pub fn write_to_out_protocol(&self, o: &mut dyn TOutputProtocol) -> thrift::Result<()> {
        o.write_struct_begin(&TStructIdentifier::new("ShellComponent"))?;
        if let Some(ref command) = self.execution_command {
            o.write_field_begin(&field("execution_command", TType::String, 1))?;
            o.write_string(command)?;
            o.write_field_end()?;
        }
        if let Some(ref script) = self.script {
            o.write_field_begin(&field("script", TType::String, 2))?;
            o.write_string(script)?;
            o.write_field_end()?;
        }
        o.write_field_stop()?;
        o.write_struct_end()
    }
}

//
// ComponentObject
//

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentObject {
    Shell(ShellComponent),
}

impl ComponentObject {
    pub fn read_from_in_protocol(i: &mut dyn TInputProtocol) -> thrift::Result<Self> {
        read_union(i, "ComponentObject", |i, id, _| match id {
            2 => Ok(Some(ComponentObject::Shell(
                ShellComponent::read_from_in_protocol(i)?,
            ))),
            1 | 3 => Err(invalid_data(
                "only shell components are supported".to_string(),
            )),
            _ => Ok(None),
        })
    }

    pub fn write_to_out_protocol(&self, o: &mut dyn TOutputProtocol) -> thrift::Result<()> {
        o.write_struct_begin(&TStructIdentifier::new("ComponentObject"))?;
        match self {
            ComponentObject::Shell(shell) => {
                o.write_field_begin(&field("shell", TType::Struct, 2))?;
                shell.write_to_out_protocol(o)?;
                o.write_field_end()?;
            }
        }
        o.write_field_stop()?;
        o.write_struct_end()
    }
}

//
// ComponentCommon
//

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ComponentCommon {
    pub inputs: BTreeMap<GlobalStreamId, Grouping>,
    pub streams: BTreeMap<String, StreamInfo>,
    pub parallelism_hint: Option<i32>,
    pub json_conf: Option<String>,
}

impl ComponentCommon {
    pub fn read_from_in_protocol(i: &mut dyn TInputProtocol) -> thrift::Result<Self> {
        i.read_struct_begin()?;
        let mut inputs = None;
        let mut streams = None;
        let mut parallelism_hint = None;
        let mut json_conf = None;
        loop {
            let field_ident = i.read_field_begin()?;
            if field_ident.field_type == TType::Stop {
                break;
            }
            match field_ident.id {
                Some(1) => {
                    let map_ident = i.read_map_begin()?;
                    let mut map = BTreeMap::new();
                    for _ in 0..map_ident.size {
                        let key = GlobalStreamId::read_from_in_protocol(i)?;
                        let value = Grouping::read_from_in_protocol(i)?;
                        map.insert(key, value);
                    }
                    i.read_map_end()?;
                    inputs = Some(map);
                }
                Some(2) => {
                    let map_ident = i.read_map_begin()?;
                    let mut map = BTreeMap::new();
                    for _ in 0..map_ident.size {
                        let key = i.read_string()?;
                        let value = StreamInfo::read_from_in_protocol(i)?;
                        map.insert(key, value);
                    }
                    i.read_map_end()?;
                    streams = Some(map);
                }
                Some(3) => parallelism_hint = Some(i.read_i32()?),
                Some(4) => json_conf = Some(i.read_string()?),
                _ => i.skip(field_ident.field_type)?,
            }
            i.read_field_end()?;
        }
        i.read_struct_end()?;
        verify_required_field_exists("ComponentCommon.inputs", &inputs)?;
        verify_required_field_exists("ComponentCommon.streams", &streams)?;
        Ok(Self {
            inputs: inputs.unwrap_or_default(),
            streams: streams.unwrap_or_default(),
            parallelism_hint,
            json_conf,
        })
    }

    pub fn write_to_out_protocol(&self, o: &mut dyn TOutputProtocol) -> thrift::Result<()> {
        o.write_struct_begin(&TStructIdentifier::new("ComponentCommon"))?;
        o.write_field_begin(&field("inputs", TType::Map, 1))?;
        o.write_map_begin(&TMapIdentifier::new(
            TType::Struct,
            TType::Struct,
            self.inputs.len() as i32,
        ))?;
        for (key, grouping) in &self.inputs {
            key.write_to_out_protocol(o)?;
            grouping.write_to_out_protocol(o)?;
        }
        o.write_map_end()?;
        o.write_field_end()?;

        o.write_field_begin(&field("streams", TType::Map, 2))?;
        o.write_map_begin(&TMapIdentifier::new(
            TType::String,
            TType::Struct,
            self.streams.len() as i32,
        ))?;
        for (name, info) in &self.streams {
            o.write_string(name)?;
            info.write_to_out_protocol(o)?;
        }
        o.write_map_end()?;
        o.write_field_end()?;

        if let Some(hint) = self.parallelism_hint {
            o.write_field_begin(&field("parallelism_hint", TType::I32, 3))?;
            o.write_i32(hint)?;
            o.write_field_end()?;
        }
        if let Some(ref conf) = self.json_conf {
            o.write_field_begin(&field("json_conf", TType::String, 4))?;
            o.write_string(conf)?;
            o.write_field_end()?;
        }
        o.write_field_stop()?;
        o.write_struct_end()
    }
}

//
// SpoutSpec, Bolt, StateSpoutSpec
//

/// A component object paired with its common settings.
///
/// `SpoutSpec`, `Bolt` and `StateSpoutSpec` share this layout and differ only
/// in the name of field 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSpec {
    pub object: ComponentObject,
    pub common: ComponentCommon,
}

pub type SpoutSpec = ComponentSpec;
pub type Bolt = ComponentSpec;
pub type StateSpoutSpec = ComponentSpec;

impl ComponentSpec {
    fn read_from_in_protocol(i: &mut dyn TInputProtocol, struct_name: &str) -> thrift::Result<Self> {
        i.read_struct_begin()?;
        let mut object = None;
        let mut common = None;
        loop {
            let field_ident = i.read_field_begin()?;
            if field_ident.field_type == TType::Stop {
                break;
            }
            match field_ident.id {
                Some(1) => object = Some(ComponentObject::read_from_in_protocol(i)?),
                Some(2) => common = Some(ComponentCommon::read_from_in_protocol(i)?),
                _ => i.skip(field_ident.field_type)?,
            }
            i.read_field_end()?;
        }
        i.read_struct_end()?;
        match (object, common) {
            (Some(object), Some(common)) => Ok(Self { object, common }),
            (None, _) => Err(invalid_data(format!("{} missing component object", struct_name))),
            (_, None) => Err(invalid_data(format!("{}.common missing", struct_name))),
        }
    }

    fn write_to_out_protocol(
        &self,
        o: &mut dyn TOutputProtocol,
        struct_name: &str,
        object_field: &str,
    ) -> thrift::Result<()> {
        o.write_struct_begin(&TStructIdentifier::new(struct_name))?;
        o.write_field_begin(&field(object_field, TType::Struct, 1))?;
        self.object.write_to_out_protocol(o)?;
        o.write_field_end()?;
        o.write_field_begin(&field("common", TType::Struct, 2))?;
        self.common.write_to_out_protocol(o)?;
        o.write_field_end()?;
        o.write_field_stop()?;
        o.write_struct_end()
    }
}

//
// StormTopology
//

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StormTopology {
    pub spouts: BTreeMap<String, SpoutSpec>,
    pub bolts: BTreeMap<String, Bolt>,
    pub state_spouts: BTreeMap<String, StateSpoutSpec>,
}

const COMPONENT_MAPS: [(&str, &str, &str, i16); 3] = [
    ("spouts", "SpoutSpec", "spout_object", 1),
    ("bolts", "Bolt", "bolt_object", 2),
    ("state_spouts", "StateSpoutSpec", "state_spout_object", 3),
];

impl StormTopology {
    pub fn read_from_in_protocol(i: &mut dyn TInputProtocol) -> thrift::Result<Self> {
        i.read_struct_begin()?;
        let mut maps: [Option<BTreeMap<String, ComponentSpec>>; 3] = [None, None, None];
        loop {
            let field_ident = i.read_field_begin()?;
            if field_ident.field_type == TType::Stop {
                break;
            }
            match field_ident.id {
                Some(id @ 1..=3) => {
                    let (_, struct_name, _, _) = COMPONENT_MAPS[(id - 1) as usize];
                    let map_ident = i.read_map_begin()?;
                    let mut map = BTreeMap::new();
                    for _ in 0..map_ident.size {
                        let key = i.read_string()?;
                        let value = ComponentSpec::read_from_in_protocol(i, struct_name)?;
                        map.insert(key, value);
                    }
                    i.read_map_end()?;
                    maps[(id - 1) as usize] = Some(map);
                }
                _ => i.skip(field_ident.field_type)?,
            }
            i.read_field_end()?;
        }
        i.read_struct_end()?;
        for (map, (name, _, _, _)) in maps.iter().zip(COMPONENT_MAPS.iter()) {
            verify_required_field_exists(&format!("StormTopology.{}", name), map)?;
        }
        let [spouts, bolts, state_spouts] = maps;
        Ok(Self {
            spouts: spouts.unwrap_or_default(),
            bolts: bolts.unwrap_or_default(),
            state_spouts: state_spouts.unwrap_or_default(),
        })
    }

    pub fn write_to_out_protocol(&self, o: &mut dyn TOutputProtocol) -> thrift::Result<()> {
        o.write_struct_begin(&TStructIdentifier::new("StormTopology"))?;
        let maps = [&self.spouts, &self.bolts, &self.state_spouts];
        for (map, (name, struct_name, object_field, id)) in maps.iter().zip(COMPONENT_MAPS.iter()) {
            o.write_field_begin(&field(name, TType::Map, *id))?;
            o.write_map_begin(&TMapIdentifier::new(
                TType::String,
                TType::Struct,
                map.len() as i32,
            ))?;
            for (component_id, spec) in map.iter() {
                o.write_string(component_id)?;
                spec.write_to_out_protocol(o, struct_name, object_field)?;
            }
            o.write_map_end()?;
            o.write_field_end()?;
        }
        o.write_field_stop()?;
        o.write_struct_end()
    }
}
