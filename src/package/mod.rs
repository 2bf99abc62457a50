//! Package assembly: base archive + topology resources + serialized topology.

pub mod archive;
pub mod assembler;
pub mod manifest;

pub use archive::{ArchiveWriter, RESOURCE_DIR};
pub use assembler::{PackageAssembler, PackageReport, CONFIG_ENTRY, SUBMITTER_ENTRY, TOPOLOGY_ENTRY};
pub use manifest::{Manifest, ManifestEntry, ResolvedFile};
