//! Binary serialization of topologies in the engine's Thrift schema.

pub mod codec;
pub mod input;
pub mod schema;

pub use codec::{decode, encode, from_wire, read_from, to_wire, write_to};
pub use input::SliceInput;
pub use schema::StormTopology;
