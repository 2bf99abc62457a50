use crate::bootstrap::script::{self, ScriptParams, SETUP_INTERPRETER};
use crate::core::config::{PackageOptions, Submitter, TopologyConfig};
use crate::core::errors::{BuildStep, Result, SquallError};
use crate::package::archive::ArchiveWriter;
use crate::package::manifest::{glob_in, Manifest};
use crate::topology::{ParallelismOverrides, ShellCommand, Topology, TopologyBuilder, TopologyDefinition};
use crate::wire;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub const SUBMITTER_ENTRY: &str = "__submitter__.yaml";
pub const CONFIG_ENTRY: &str = "__topology__.yaml";
pub const TOPOLOGY_ENTRY: &str = "topology.ser";

#[derive(Serialize)]
struct SubmitterMetadata<'a> {
    #[serde(rename = "squall.user")]
    user: &'a str,
    #[serde(rename = "squall.host")]
    host: &'a str,
    #[serde(rename = "squall.built_at")]
    built_at: String,
}

/// Result of a successful package build
#[derive(Debug, Clone)]
pub struct PackageReport {
    pub destination: PathBuf,
    /// Names added under `resources/`, in the order they were written
    pub entries: Vec<String>,
    /// The topology as serialized into the package
    pub topology: Topology,
}

/// Turns a topology definition into a deployable package.
///
/// The package is a copy of the base archive with the topology's scripts,
/// manifest files, metadata, one setup script per stage script and the
/// serialized topology appended under `resources/`.
#[derive(Debug)]
pub struct PackageAssembler {
    options: PackageOptions,
    config: TopologyConfig,
}

impl PackageAssembler {
    /// Validate the options and read the configuration document
    pub fn new(options: PackageOptions) -> Result<Self> {
        let config = TopologyConfig::load(&options.config_path)?;
        Self::with_config(options, config)
    }

    pub fn with_config(mut options: PackageOptions, config: TopologyConfig) -> Result<Self> {
        let pip_options = config.pip_options()?;
        if !pip_options.is_empty() {
            options.bootstrap.pip_options = pip_options;
        }
        options.validate()?;
        Ok(Self { options, config })
    }

    pub fn options(&self) -> &PackageOptions {
        &self.options
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub fn build<D>(&self, definition: &D) -> Result<PackageReport>
    where
        D: TopologyDefinition + ?Sized,
    {
        let options = &self.options;
        info!(
            "Building package {} from {}",
            options.destination.display(),
            options.base_archive.display()
        );

        let mut archive = ArchiveWriter::create_from(&options.base_archive, &options.destination)
            .map_err(|e| e.in_step(BuildStep::CopyBaseArchive))?;

        let topology = match self.populate(&mut archive, definition) {
            Ok(topology) => topology,
            Err(e) => {
                discard(archive);
                return Err(e);
            }
        };

        let entries = archive.added().to_vec();
        let destination = archive
            .finish()
            .map_err(|e| e.in_step(BuildStep::Finish))?;
        info!(
            "Package {} ready: {} stages, {} resources",
            destination.display(),
            topology.len(),
            entries.len()
        );
        Ok(PackageReport {
            destination,
            entries,
            topology,
        })
    }

    /// Everything between copying the base archive and closing it
    fn populate<D>(&self, archive: &mut ArchiveWriter, definition: &D) -> Result<Topology>
    where
        D: TopologyDefinition + ?Sized,
    {
        self.add_manifest(archive)
            .map_err(|e| e.in_step(BuildStep::Manifest))?;
        self.add_metadata(archive)
            .map_err(|e| e.in_step(BuildStep::Metadata))?;

        let mut builder = self
            .define(definition)
            .map_err(|e| e.in_step(BuildStep::Definition))?;

        let overrides = self
            .config
            .parallelism_overrides()
            .map_err(|e| e.in_step(BuildStep::ParallelismOverrides))?;
        let overrides = self
            .add_stage_resources(archive, &mut builder, overrides)
            .map_err(|e| e.in_step(BuildStep::StageResources))?;
        overrides
            .finish()
            .map_err(|e| e.in_step(BuildStep::ParallelismOverrides))?;

        // Encoded only now: stage commands were rewritten above
        let topology = builder
            .build()
            .map_err(|e| e.in_step(BuildStep::Definition))?;
        let bytes = wire::encode(&topology).map_err(|e| e.in_step(BuildStep::Serialize))?;
        archive
            .add_resource(TOPOLOGY_ENTRY, &bytes)
            .map_err(|e| e.in_step(BuildStep::Serialize))?;
        Ok(topology)
    }

    fn add_manifest(&self, archive: &mut ArchiveWriter) -> Result<()> {
        let manifest = Manifest::load(self.options.manifest_path())?;
        let files = manifest.resolve(&self.options.topology_dir)?;
        debug!(
            "Manifest lists {} entries resolving to {} files",
            manifest.entries().len(),
            files.len()
        );
        for file in files {
            archive.add_file(&file.name, &file.path)?;
        }
        Ok(())
    }

    fn add_metadata(&self, archive: &mut ArchiveWriter) -> Result<()> {
        let submitter = self
            .options
            .submitter
            .clone()
            .unwrap_or_else(Submitter::current);
        let metadata = SubmitterMetadata {
            user: &submitter.user,
            host: &submitter.host,
            built_at: chrono::Utc::now().to_rfc3339(),
        };
        archive.add_resource(SUBMITTER_ENTRY, serde_yaml::to_string(&metadata)?.as_bytes())?;
        archive.add_resource(CONFIG_ENTRY, self.config.text().as_bytes())?;
        Ok(())
    }

    fn define<D>(&self, definition: &D) -> Result<TopologyBuilder>
    where
        D: TopologyDefinition + ?Sized,
    {
        let mut builder = TopologyBuilder::new().field_check(self.config.field_check()?);
        definition.define(&mut builder)?;
        if builder.is_empty() {
            return Err(SquallError::Definition {
                message: "definition registered no stages".to_string(),
                source: None,
            });
        }
        info!("Definition registered {} stages", builder.len());
        Ok(builder)
    }

    /// Add scripts and setup scripts and rewrite stage commands.
    ///
    /// Returns the overrides that matched no stage.
    fn add_stage_resources(
        &self,
        archive: &mut ArchiveWriter,
        builder: &mut TopologyBuilder,
        mut overrides: ParallelismOverrides,
    ) -> Result<ParallelismOverrides> {
        let options = &self.options;
        for id in builder.stage_ids() {
            let Some(stage) = builder.stage(&id) else {
                continue;
            };
            let script = stage.command.script.clone();

            let matches = glob_in(&options.topology_dir, &script)
                .map_err(|message| SquallError::configuration_in(message, id.as_str()))?;
            if matches.is_empty() {
                return Err(SquallError::ResourceNotFound {
                    pattern: options.topology_dir.join(&script).display().to_string(),
                    context: Some(format!("script of stage '{}'", id)),
                });
            }
            for path in &matches {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| script.clone());
                archive.add_file(&name, path)?;
            }

            if let Some(parallelism) = overrides.take(&id) {
                info!("Parallelism of {} overridden to {}", id, parallelism);
                builder.set_parallelism(&id, parallelism)?;
            }

            let params = ScriptParams::new(
                &script,
                &options.environment,
                options.log_dir.as_deref(),
                &options.bootstrap,
            );
            let setup_name = params.file_name();
            archive.add_executable(&setup_name, script::render(&params).as_bytes())?;

            if let Some(stage) = builder.stage_mut(&id) {
                stage.command = ShellCommand::new(SETUP_INTERPRETER, setup_name);
            }
        }
        Ok(overrides)
    }
}

/// Close and delete an archive whose build failed
fn discard(archive: ArchiveWriter) {
    let path = archive.path().to_path_buf();
    drop(archive);
    match std::fs::remove_file(&path) {
        Ok(()) => info!("Removed incomplete package {}", path.display()),
        Err(e) => warn!("Could not remove incomplete package {}: {}", path.display(), e),
    }
}
