//! squall command line: build packages, bootstrap stages on workers

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use squall::bootstrap::script::script_stem;
use squall::bootstrap::{self, CommandInstaller, InstanceLayout, Provisioner};
use squall::package::CONFIG_ENTRY;
use squall::{
    BootstrapSettings, EnvironmentChoice, PackageAssembler, PackageOptions, TopologyConfig,
    YamlDefinition,
};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Package stream-processing topologies and start their stages
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a deployable package from a topology directory
    Package(PackageArgs),
    /// Provision the instance environment and launch a stage (runs on workers)
    Bootstrap(BootstrapArgs),
}

#[derive(Args, Debug)]
struct EnvironmentArgs {
    /// Use an existing environment instead of creating one; `self` means
    /// the environment squall is running in
    #[arg(long)]
    venv: Option<String>,

    /// Interpreter version used as python<VERSION>
    #[arg(long)]
    python_version: Option<String>,

    /// Directory for per-instance environments and lock files
    #[arg(long)]
    work_root: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct PackageArgs {
    /// Generic archive the package starts from
    #[arg(long)]
    base_archive: PathBuf,

    #[arg(long)]
    destination: PathBuf,

    /// Topology configuration YAML
    #[arg(long)]
    config: PathBuf,

    /// Topology definition YAML, relative to the topology directory
    #[arg(long, default_value = "topology.yaml")]
    definition: PathBuf,

    #[arg(long, default_value = ".")]
    topology_dir: PathBuf,

    #[arg(long, default_value = squall::core::config::DEFAULT_MANIFEST)]
    manifest: String,

    /// Log directory on workers
    #[arg(long)]
    logdir: Option<String>,

    #[command(flatten)]
    env: EnvironmentArgs,
}

#[derive(Args, Debug)]
struct BootstrapArgs {
    /// Stage script the command runs
    #[arg(long)]
    script: String,

    #[arg(long)]
    logdir: Option<PathBuf>,

    #[command(flatten)]
    env: EnvironmentArgs,

    /// Stage command; defaults to the runtime's runner for SCRIPT
    #[arg(last = true)]
    command: Vec<String>,
}

impl EnvironmentArgs {
    fn settings(&self) -> BootstrapSettings {
        let mut settings = BootstrapSettings::default();
        if let Some(version) = &self.python_version {
            settings.python_version = version.clone();
        }
        if let Some(root) = &self.work_root {
            settings.work_root = root.clone();
        }
        settings
    }

    fn environment(&self) -> Result<EnvironmentChoice> {
        match self.venv.as_deref() {
            None => Ok(EnvironmentChoice::Managed),
            Some("self") => {
                let current = std::env::var_os("VIRTUAL_ENV")
                    .context("--venv self requires an activated environment (VIRTUAL_ENV)")?;
                Ok(EnvironmentChoice::External(PathBuf::from(current)))
            }
            Some(path) => Ok(EnvironmentChoice::External(absolute(Path::new(path))?)),
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Package(args) => {
            init_stderr_logging(&cli.log_level);
            run_package(args)
        }
        Commands::Bootstrap(args) => run_bootstrap(args, &cli.log_level),
    }
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn init_stderr_logging(level: &str) {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run_package(args: PackageArgs) -> Result<()> {
    let definition_path = args.topology_dir.join(&args.definition);
    let definition = YamlDefinition::load(&definition_path)
        .with_context(|| format!("loading {}", definition_path.display()))?;

    let mut options = PackageOptions::new(args.base_archive, args.destination, args.config)
        .with_topology_dir(args.topology_dir)
        .with_manifest(args.manifest)
        .with_environment(args.env.environment()?)
        .with_bootstrap(args.env.settings());
    if let Some(dir) = args.logdir {
        options = options.with_log_dir(dir);
    }

    let report = PackageAssembler::new(options)?.build(&definition)?;
    info!(
        "Wrote {} ({} resources)",
        report.destination.display(),
        report.entries.len()
    );
    Ok(())
}

fn run_bootstrap(args: BootstrapArgs, level: &str) -> Result<()> {
    let resource_dir = std::env::current_dir()?;
    let stem = script_stem(&args.script).to_string();
    let log_root = match &args.logdir {
        Some(dir) => dir.clone(),
        None => resource_dir.clone(),
    };
    let log_path = InstanceLayout::log_file(&log_root, &stem, std::process::id());
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening log {}", log_path.display()))?;
    tracing_subscriber::registry()
        .with(filter(level))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(log_file)),
        )
        .init();
    info!("Beginning task setup for {}", stem);

    let mut settings = args.env.settings();
    let shipped_config = resource_dir.join(CONFIG_ENTRY);
    if shipped_config.is_file() {
        settings.pip_options = TopologyConfig::load(&shipped_config)?.pip_options()?;
    }
    let layout = InstanceLayout::from_resource_dir(&resource_dir, &settings.work_root)?;
    let runtime = settings.runtime_package.clone();
    let provisioner = Provisioner::new(
        layout,
        args.env.environment()?,
        CommandInstaller::new(settings, &resource_dir),
    );
    let outcome = match provisioner.provision() {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Task setup failed: {}", e);
            return Err(e.into());
        }
    };
    info!("Environment: {:?}", outcome);

    let argv = if args.command.is_empty() {
        vec![
            "python".to_string(),
            "-m".to_string(),
            format!("{}.run", runtime),
            stem,
            log_path.display().to_string(),
        ]
    } else {
        args.command
    };
    let command = bootstrap::stage_command(&argv, Some(outcome.env_dir()))?;
    match bootstrap::exec_stage(command)? {}
}
