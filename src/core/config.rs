use crate::core::errors::{Result, SquallError};
use crate::topology::{FieldCheck, ParallelismOverrides};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Prefix of every key squall reads from the topology configuration
pub const CONFIG_NAMESPACE: &str = "squall";

/// Default name of the manifest inside the topology directory
pub const DEFAULT_MANIFEST: &str = "manifest.txt";

/// The flat topology configuration document.
///
/// The raw text is shipped verbatim inside the package; squall itself only
/// reads keys under [`CONFIG_NAMESPACE`].
#[derive(Debug, Clone, Default)]
pub struct TopologyConfig {
    text: String,
    values: BTreeMap<String, Value>,
}

impl TopologyConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let values = match serde_yaml::from_str::<Value>(text)? {
            Value::Null => BTreeMap::new(),
            Value::Mapping(mapping) => {
                let mut values = BTreeMap::new();
                for (key, value) in mapping {
                    match key {
                        Value::String(key) => {
                            values.insert(key, value);
                        }
                        other => {
                            return Err(SquallError::configuration_in(
                                "Configuration keys must be strings",
                                format!("{:?}", other),
                            ))
                        }
                    }
                }
                values
            }
            _ => {
                return Err(SquallError::configuration(
                    "Configuration document must be a mapping",
                ))
            }
        };
        Ok(Self {
            text: text.to_string(),
            values,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SquallError::io(format!("read configuration {}", path.display()), e))?;
        Self::from_yaml(&text)
    }

    /// The document exactly as it was read
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Stage parallelism from `squall.parallelism.<stage id>` keys
    pub fn parallelism_overrides(&self) -> Result<ParallelismOverrides> {
        let prefix = format!("{}.parallelism.", CONFIG_NAMESPACE);
        let mut overrides = ParallelismOverrides::new();
        for (key, value) in &self.values {
            let Some(stage_id) = key.strip_prefix(&prefix) else {
                continue;
            };
            let parallelism = match value {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().parse::<u64>().ok(),
                _ => None,
            }
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                SquallError::configuration_in(
                    format!("Parallelism must be a positive integer, got {:?}", value),
                    key.as_str(),
                )
            })?;
            overrides.insert(stage_id, parallelism);
        }
        Ok(overrides)
    }

    /// Extra arguments for `pip install`, passed through verbatim
    pub fn pip_options(&self) -> Result<String> {
        let key = format!("{}.pip_options", CONFIG_NAMESPACE);
        match self.values.get(&key) {
            None | Some(Value::Null) => Ok(String::new()),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(SquallError::configuration_in(
                format!("Expected a string, got {:?}", other),
                key,
            )),
        }
    }

    /// Build-time subscription check policy
    pub fn field_check(&self) -> Result<FieldCheck> {
        let key = format!("{}.fields_check", CONFIG_NAMESPACE);
        match self.values.get(&key) {
            None | Some(Value::Null) => Ok(FieldCheck::default()),
            Some(Value::String(s)) => s.parse().map_err(|e: SquallError| {
                SquallError::configuration_in(e.to_string(), key.as_str())
            }),
            Some(other) => Err(SquallError::configuration_in(
                format!("Expected off, warn or strict, got {:?}", other),
                key,
            )),
        }
    }
}

/// Where worker processes find their Python environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentChoice {
    /// One environment per topology instance, created on first start
    Managed,
    /// An environment that already exists on every worker
    External(PathBuf),
}

impl Default for EnvironmentChoice {
    fn default() -> Self {
        Self::Managed
    }
}

/// Settings baked into each generated bootstrap script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapSettings {
    /// Interpreter version, used as `python<version>`
    pub python_version: String,
    /// Directory holding per-instance work dirs and lock files
    pub work_root: PathBuf,
    /// Packages installed into a fresh environment
    pub pinned_dependencies: Vec<String>,
    /// Python package providing the stage runner (`python -m <package>.run`)
    pub runtime_package: String,
    pub runtime_version: String,
    /// Verbatim `pip install` options
    pub pip_options: String,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            python_version: "3".to_string(),
            work_root: PathBuf::from("/tmp"),
            pinned_dependencies: vec!["thrift==0.16.0".to_string(), "PyYAML==6.0.1".to_string()],
            runtime_package: CONFIG_NAMESPACE.to_string(),
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
            pip_options: String::new(),
        }
    }
}

impl BootstrapSettings {
    pub fn validate(&self) -> Result<()> {
        if self.python_version.is_empty()
            || !self
                .python_version
                .chars()
                .all(|c| c.is_ascii_digit() || c == '.')
        {
            return Err(SquallError::configuration_in(
                format!("Invalid python version '{}'", self.python_version),
                "python_version",
            ));
        }
        if self.runtime_package.is_empty() {
            return Err(SquallError::configuration_in(
                "Runtime package cannot be empty",
                "runtime_package",
            ));
        }
        if !self.work_root.is_absolute() {
            return Err(SquallError::configuration_in(
                format!("Work root {} must be absolute", self.work_root.display()),
                "work_root",
            ));
        }
        Ok(())
    }
}

/// Who built the package, recorded in the package metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submitter {
    pub user: String,
    pub host: String,
}

impl Submitter {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
        }
    }

    /// The current user on this host
    pub fn current() -> Self {
        let host = whoami::fallible::hostname().unwrap_or_else(|e| {
            warn!("Could not determine host name: {}", e);
            "unknown".to_string()
        });
        Self {
            user: whoami::username(),
            host,
        }
    }
}

/// Inputs of one package build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageOptions {
    /// Generic archive containing the engine's launcher
    pub base_archive: PathBuf,
    pub destination: PathBuf,
    /// Directory the manifest and stage scripts are resolved against
    pub topology_dir: PathBuf,
    /// Manifest file name inside `topology_dir`
    pub manifest: String,
    pub config_path: PathBuf,
    pub environment: EnvironmentChoice,
    /// Log directory on workers; the stage's working directory when unset
    pub log_dir: Option<String>,
    pub bootstrap: BootstrapSettings,
    /// Defaults to [`Submitter::current`]
    pub submitter: Option<Submitter>,
}

impl PackageOptions {
    pub fn new(
        base_archive: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            base_archive: base_archive.into(),
            destination: destination.into(),
            topology_dir: PathBuf::from("."),
            manifest: DEFAULT_MANIFEST.to_string(),
            config_path: config_path.into(),
            environment: EnvironmentChoice::default(),
            log_dir: None,
            bootstrap: BootstrapSettings::default(),
            submitter: None,
        }
    }

    pub fn with_topology_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.topology_dir = dir.into();
        self
    }

    pub fn with_manifest(mut self, name: impl Into<String>) -> Self {
        self.manifest = name.into();
        self
    }

    pub fn with_environment(mut self, environment: EnvironmentChoice) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<String>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_bootstrap(mut self, settings: BootstrapSettings) -> Self {
        self.bootstrap = settings;
        self
    }

    pub fn with_submitter(mut self, submitter: Submitter) -> Self {
        self.submitter = Some(submitter);
        self
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.topology_dir.join(&self.manifest)
    }

    /// Validates option values
    pub fn validate(&self) -> Result<()> {
        if self.manifest.is_empty() {
            return Err(SquallError::configuration("Manifest name cannot be empty"));
        }
        if let EnvironmentChoice::External(path) = &self.environment {
            if !path.is_absolute() {
                return Err(SquallError::configuration_in(
                    format!("External environment {} must be absolute", path.display()),
                    path.display().to_string(),
                ));
            }
        }
        self.bootstrap.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallelism_overrides_parsed() {
        let config = TopologyConfig::from_yaml(
            "squall.parallelism.split: 4\nsquall.parallelism.count: '6'\ntopology.workers: 2\n",
        )
        .unwrap();
        let mut overrides = config.parallelism_overrides().unwrap();
        assert_eq!(overrides.len(), 2);
        assert_eq!(overrides.take("split"), Some(4));
        assert_eq!(overrides.take("count"), Some(6));
    }

    #[test]
    fn test_stage_ids_with_dots_kept_whole() {
        let config = TopologyConfig::from_yaml("squall.parallelism.etl.clean: 3\n").unwrap();
        let mut overrides = config.parallelism_overrides().unwrap();
        assert_eq!(overrides.take("etl.clean"), Some(3));
    }

    #[test]
    fn test_non_positive_parallelism_rejected() {
        for bad in ["0", "-2", "many", "[1]"] {
            let config =
                TopologyConfig::from_yaml(&format!("squall.parallelism.split: {}\n", bad)).unwrap();
            let err = config.parallelism_overrides().unwrap_err();
            match err {
                SquallError::Configuration { artifact, .. } => {
                    assert_eq!(artifact.as_deref(), Some("squall.parallelism.split"))
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn test_pip_options_and_text_kept() {
        let text = "# cluster settings\nsquall.pip_options: --index-url http://mirror/simple\n";
        let config = TopologyConfig::from_yaml(text).unwrap();
        assert_eq!(config.pip_options().unwrap(), "--index-url http://mirror/simple");
        assert_eq!(config.text(), text);
    }

    #[test]
    fn test_empty_document() {
        let config = TopologyConfig::from_yaml("").unwrap();
        assert!(config.parallelism_overrides().unwrap().is_empty());
        assert_eq!(config.pip_options().unwrap(), "");
        assert_eq!(config.field_check().unwrap(), FieldCheck::Warn);
    }

    #[test]
    fn test_non_mapping_rejected() {
        assert!(TopologyConfig::from_yaml("- a\n- b\n").is_err());
    }

    #[test]
    fn test_field_check_key() {
        let config = TopologyConfig::from_yaml("squall.fields_check: strict\n").unwrap();
        assert_eq!(config.field_check().unwrap(), FieldCheck::Strict);
        let config = TopologyConfig::from_yaml("squall.fields_check: maybe\n").unwrap();
        assert!(config.field_check().is_err());
    }

    #[test]
    fn test_options_validation() {
        let options = PackageOptions::new("base.jar", "out.jar", "topology.yaml");
        assert!(options.validate().is_ok());
        assert_eq!(options.manifest_path(), PathBuf::from("./manifest.txt"));

        let options = options.with_environment(EnvironmentChoice::External("venv".into()));
        assert!(options.validate().is_err());

        let mut settings = BootstrapSettings::default();
        settings.python_version = "3; rm -rf /".into();
        assert!(settings.validate().is_err());
    }
}
