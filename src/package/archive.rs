use crate::core::errors::{Result, SquallError};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Directory inside the archive that holds everything squall adds
pub const RESOURCE_DIR: &str = "resources";

/// Appends topology resources to a copy of the base archive.
///
/// Every name is placed under `resources/`. Adding a name twice is allowed
/// when the content is identical (the second add is skipped) and rejected
/// otherwise. Dropping the writer without [`ArchiveWriter::finish`] still
/// writes the central directory.
pub struct ArchiveWriter {
    zip: ZipWriter<File>,
    path: PathBuf,
    digests: BTreeMap<String, [u8; 32]>,
    added: Vec<String>,
}

impl std::fmt::Debug for ArchiveWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveWriter")
            .field("path", &self.path)
            .field("added", &self.added)
            .finish()
    }
}

impl ArchiveWriter {
    /// Copy `base` to `destination` and open the copy for appending
    pub fn create_from(base: &Path, destination: &Path) -> Result<Self> {
        if same_file(base, destination)? {
            return Err(SquallError::configuration_in(
                "Destination and base archive are the same file",
                destination.display().to_string(),
            ));
        }
        fs::copy(base, destination).map_err(|e| {
            SquallError::io(
                format!("copy {} to {}", base.display(), destination.display()),
                e,
            )
        })?;

        let digests = existing_resources(destination)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(destination)
            .map_err(|e| SquallError::io(format!("open {}", destination.display()), e))?;
        let zip = ZipWriter::new_append(file)
            .map_err(|e| SquallError::archive(format!("append to {}", destination.display()), e))?;

        info!(
            "Copied {} to {} ({} existing resources)",
            base.display(),
            destination.display(),
            digests.len()
        );
        Ok(Self {
            zip,
            path: destination.to_path_buf(),
            digests,
            added: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Names added so far, relative to `resources/`, in order
    pub fn added(&self) -> &[String] {
        &self.added
    }

    pub fn contains(&self, name: &str) -> bool {
        self.digests.contains_key(&entry_path(name))
    }

    /// Add `data` as `resources/<name>`; returns false if an identical entry exists
    pub fn add_resource(&mut self, name: &str, data: &[u8]) -> Result<bool> {
        self.add(name, data, 0o644)
    }

    /// Same as [`ArchiveWriter::add_resource`] with an executable mode
    pub fn add_executable(&mut self, name: &str, data: &[u8]) -> Result<bool> {
        self.add(name, data, 0o755)
    }

    /// Add the contents of a file on disk
    pub fn add_file(&mut self, name: &str, path: &Path) -> Result<bool> {
        let data =
            fs::read(path).map_err(|e| SquallError::io(format!("read {}", path.display()), e))?;
        self.add(name, &data, 0o644)
    }

    fn add(&mut self, name: &str, data: &[u8], mode: u32) -> Result<bool> {
        let path = entry_path(name);
        let digest: [u8; 32] = Sha256::digest(data).into();
        if let Some(existing) = self.digests.get(&path) {
            if *existing == digest {
                debug!("Skipping duplicate {}", path);
                return Ok(false);
            }
            return Err(SquallError::configuration_in(
                "Archive entry added twice with different content",
                path,
            ));
        }

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(mode);
        self.zip
            .start_file(path.clone(), options)
            .map_err(|e| SquallError::archive(format!("start {}", path), e))?;
        self.zip
            .write_all(data)
            .map_err(|e| SquallError::io(format!("write {}", path), e))?;

        info!("Adding {}", path);
        self.digests.insert(path, digest);
        self.added.push(name.to_string());
        Ok(true)
    }

    /// Write the central directory and close the archive
    pub fn finish(self) -> Result<PathBuf> {
        self.zip
            .finish()
            .map_err(|e| SquallError::archive(format!("finish {}", self.path.display()), e))?;
        Ok(self.path)
    }
}

fn entry_path(name: &str) -> String {
    format!("{}/{}", RESOURCE_DIR, name.trim_start_matches('/'))
}

/// Resolve a path that may not exist yet through its parent directory
fn resolve(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return path
            .canonicalize()
            .map_err(|e| SquallError::io(format!("resolve {}", path.display()), e));
    }
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let parent = parent
        .canonicalize()
        .map_err(|e| SquallError::io(format!("resolve {}", parent.display()), e))?;
    Ok(match path.file_name() {
        Some(name) => parent.join(name),
        None => parent,
    })
}

fn same_file(a: &Path, b: &Path) -> Result<bool> {
    Ok(resolve(a)? == resolve(b)?)
}

/// Digests of `resources/` entries already present in the base archive
fn existing_resources(path: &Path) -> Result<BTreeMap<String, [u8; 32]>> {
    let file = File::open(path).map_err(|e| SquallError::io(format!("open {}", path.display()), e))?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| SquallError::archive(format!("read {}", path.display()), e))?;
    let prefix = format!("{}/", RESOURCE_DIR);
    let mut digests = BTreeMap::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| SquallError::archive(format!("read entry {} of {}", index, path.display()), e))?;
        if entry.is_dir() || !entry.name().starts_with(&prefix) {
            continue;
        }
        let name = entry.name().to_string();
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| SquallError::io(format!("read {}", name), e))?;
        digests.insert(name, Sha256::digest(&data).into());
    }
    Ok(digests)
}
