use crate::core::errors::{Result, SquallError};
use crate::package::RESOURCE_DIR;
use std::path::{Path, PathBuf};

/// Prefix of per-instance work directories and lock files
pub const WORK_DIR_PREFIX: &str = "squall-";

/// Name of the environment directory inside the work directory
pub const ENV_DIR_NAME: &str = "venv";

/// Written inside the work directory once the environment is complete
pub const READY_MARKER: &str = "venv.ready";

/// Where one topology instance keeps its shared state on a worker.
///
/// The engine unpacks each submitted package into
/// `<somewhere>/<topology-id>/resources` and starts stage processes there;
/// every process of the same instance derives the same paths from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLayout {
    topology_id: String,
    work_root: PathBuf,
}

fn valid_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '-')
}

impl InstanceLayout {
    pub fn new(topology_id: impl Into<String>, work_root: impl Into<PathBuf>) -> Result<Self> {
        let topology_id = topology_id.into();
        if topology_id.is_empty() || !topology_id.chars().all(valid_id_char) {
            return Err(SquallError::configuration_in(
                "Topology id may only contain letters, digits, '+', '_' and '-'",
                topology_id,
            ));
        }
        Ok(Self {
            topology_id,
            work_root: work_root.into(),
        })
    }

    /// Derive the layout from the directory a stage process starts in
    pub fn from_resource_dir(dir: &Path, work_root: impl Into<PathBuf>) -> Result<Self> {
        let not_a_resource_dir = || {
            SquallError::configuration_in(
                format!("Expected a path ending in <topology-id>/{}", RESOURCE_DIR),
                dir.display().to_string(),
            )
        };
        if dir.file_name().and_then(|n| n.to_str()) != Some(RESOURCE_DIR) {
            return Err(not_a_resource_dir());
        }
        let id = dir
            .parent()
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
            .ok_or_else(not_a_resource_dir)?;
        Self::new(id, work_root)
    }

    pub fn topology_id(&self) -> &str {
        &self.topology_id
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_root
            .join(format!("{}{}", WORK_DIR_PREFIX, self.topology_id))
    }

    pub fn env_dir(&self) -> PathBuf {
        self.work_dir().join(ENV_DIR_NAME)
    }

    /// Lives beside the work directory so it survives environment rebuilds
    pub fn lock_file(&self) -> PathBuf {
        self.work_root
            .join(format!("{}{}.lock", WORK_DIR_PREFIX, self.topology_id))
    }

    pub fn ready_marker(&self) -> PathBuf {
        self.work_dir().join(READY_MARKER)
    }

    pub fn is_ready(&self) -> bool {
        self.ready_marker().is_file()
    }

    /// Per-process stage log, `squall<pid>_<script>.log`
    pub fn log_file(log_root: &Path, script: &str, pid: u32) -> PathBuf {
        log_root.join(format!("squall{}_{}.log", pid, script))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_id_recovered_from_resource_dir() {
        let layout = InstanceLayout::from_resource_dir(
            Path::new("/var/storm/supervisor/stormdist/wordcount-7-1700000000/resources"),
            "/tmp",
        )
        .unwrap();
        assert_eq!(layout.topology_id(), "wordcount-7-1700000000");
        assert_eq!(
            layout.work_dir(),
            PathBuf::from("/tmp/squall-wordcount-7-1700000000")
        );
        assert_eq!(
            layout.lock_file(),
            PathBuf::from("/tmp/squall-wordcount-7-1700000000.lock")
        );
        assert_eq!(
            layout.env_dir(),
            PathBuf::from("/tmp/squall-wordcount-7-1700000000/venv")
        );
    }

    #[test]
    fn test_paths_not_ending_in_resources_rejected() {
        for dir in ["/stormdist/wordcount-1/bin", "/", "resources", "/x/word.count/resources"] {
            assert!(
                InstanceLayout::from_resource_dir(Path::new(dir), "/tmp").is_err(),
                "{dir} accepted"
            );
        }
    }

    #[test]
    fn test_log_file_name() {
        assert_eq!(
            InstanceLayout::log_file(Path::new("/var/log/squall"), "splitsentence", 4242),
            PathBuf::from("/var/log/squall/squall4242_splitsentence.log")
        );
    }

    #[test]
    fn test_instances_do_not_share_locks() {
        let a = InstanceLayout::new("wc-1", "/tmp").unwrap();
        let b = InstanceLayout::new("wc-2", "/tmp").unwrap();
        assert_ne!(a.lock_file(), b.lock_file());
        assert_ne!(a.work_dir(), b.work_dir());
    }
}
