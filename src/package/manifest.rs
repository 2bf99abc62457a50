use crate::core::errors::{Result, SquallError};
use glob::{MatchOptions, Pattern};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// One non-blank, non-comment manifest line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// 1-based line number in the manifest
    pub line: usize,
    /// The line as written, trimmed
    pub raw: String,
    /// The line after environment variable expansion
    pub pattern: String,
}

/// A file resolved from the manifest, with its name inside `resources/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    pub name: String,
    pub path: PathBuf,
}

/// List of extra files shipped with a topology.
///
/// Each line is a path or a wildcard pattern relative to the topology
/// directory. `$VAR` and `${VAR}` are expanded from the environment; unknown
/// variables are left untouched. Matched files are added under their base
/// name, matched directories recursively under their path relative to the
/// topology directory.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    origin: String,
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn parse(text: &str, origin: impl Into<String>) -> Self {
        let entries = text
            .lines()
            .enumerate()
            .filter_map(|(index, line)| {
                let raw = line.trim();
                if raw.is_empty() || raw.starts_with('#') {
                    return None;
                }
                let pattern =
                    shellexpand::env_with_context_no_errors(raw, |var| std::env::var(var).ok())
                        .into_owned();
                Some(ManifestEntry {
                    line: index + 1,
                    raw: raw.to_string(),
                    pattern,
                })
            })
            .collect();
        Self {
            origin: origin.into(),
            entries,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SquallError::io(format!("read manifest {}", path.display()), e))?;
        Ok(Self::parse(&text, path.display().to_string()))
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn location(&self, entry: &ManifestEntry) -> String {
        format!("{} line {}", self.origin, entry.line)
    }

    /// Resolve every entry against `base`, in manifest order
    pub fn resolve(&self, base: &Path) -> Result<Vec<ResolvedFile>> {
        let mut files = Vec::new();
        for entry in &self.entries {
            files.extend(self.resolve_entry(entry, base)?);
        }
        Ok(files)
    }

    fn resolve_entry(&self, entry: &ManifestEntry, base: &Path) -> Result<Vec<ResolvedFile>> {
        let matches = glob_in(base, &entry.pattern)
            .map_err(|message| SquallError::configuration_in(message, self.location(entry)))?;
        if matches.is_empty() {
            return Err(SquallError::ResourceNotFound {
                pattern: entry.pattern.clone(),
                context: Some(self.location(entry)),
            });
        }

        let mut files = Vec::new();
        for path in matches {
            if path.is_dir() {
                files.extend(walk_dir(base, &path)?);
            } else if path.is_file() {
                files.push(ResolvedFile {
                    name: file_name(&path),
                    path,
                });
            } else {
                return Err(SquallError::ResourceNotFound {
                    pattern: path.display().to_string(),
                    context: Some(self.location(entry)),
                });
            }
        }
        debug!(
            "Manifest entry '{}' resolved to {} files",
            entry.raw,
            files.len()
        );
        Ok(files)
    }
}

/// Expand a wildcard relative to `base`; the error is the pattern problem
pub(crate) fn glob_in(base: &Path, pattern: &str) -> std::result::Result<Vec<PathBuf>, String> {
    let full = if Path::new(pattern).is_absolute() {
        pattern.to_string()
    } else {
        format!(
            "{}/{}",
            Pattern::escape(&base.to_string_lossy()).trim_end_matches('/'),
            pattern
        )
    };
    let options = MatchOptions {
        require_literal_leading_dot: true,
        ..MatchOptions::new()
    };
    let paths = glob::glob_with(&full, options)
        .map_err(|e| format!("Malformed pattern '{}': {}", pattern, e))?;
    // Unreadable directories are skipped, the same as a shell glob would
    Ok(paths.filter_map(|p| p.ok()).collect())
}

fn walk_dir(base: &Path, dir: &Path) -> Result<Vec<ResolvedFile>> {
    let anchor = if dir.starts_with(base) {
        base.to_path_buf()
    } else {
        dir.parent().map(Path::to_path_buf).unwrap_or_default()
    };
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let operation = format!("walk {}", dir.display());
            match e.into_io_error() {
                Some(io) => SquallError::io(operation, io),
                None => SquallError::io(operation, std::io::Error::other("filesystem loop")),
            }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(&anchor).unwrap_or(entry.path());
        files.push(ResolvedFile {
            name: archive_name(relative),
            path: entry.path().to_path_buf(),
        });
    }
    Ok(files)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Archive names always use `/` separators
fn archive_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
