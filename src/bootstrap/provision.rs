use crate::bootstrap::instance::InstanceLayout;
use crate::core::config::{BootstrapSettings, EnvironmentChoice};
use crate::core::errors::{Result, SquallError};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Populates a fresh environment directory
pub trait EnvironmentInstaller {
    fn install(&self, env_dir: &Path) -> Result<()>;
}

impl<F> EnvironmentInstaller for F
where
    F: Fn(&Path) -> Result<()>,
{
    fn install(&self, env_dir: &Path) -> Result<()> {
        self(env_dir)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// This process built the environment
    Created(PathBuf),
    /// Another process built it, or it was already complete
    Reused(PathBuf),
    /// A pre-existing environment was configured; nothing was built
    External(PathBuf),
}

impl ProvisionOutcome {
    pub fn env_dir(&self) -> &Path {
        match self {
            Self::Created(p) | Self::Reused(p) | Self::External(p) => p,
        }
    }
}

/// Creates at most one environment per topology instance on a worker.
///
/// The first process to take the instance's exclusive lock builds the
/// environment and writes the ready marker last. Processes that lose the
/// race block on a shared lock until the builder is done, then reuse its
/// work. When the filesystem cannot lock, every process that finds no
/// marker builds on its own.
pub struct Provisioner<I> {
    layout: InstanceLayout,
    environment: EnvironmentChoice,
    installer: I,
}

impl<I: EnvironmentInstaller> Provisioner<I> {
    pub fn new(layout: InstanceLayout, environment: EnvironmentChoice, installer: I) -> Self {
        Self {
            layout,
            environment,
            installer,
        }
    }

    pub fn layout(&self) -> &InstanceLayout {
        &self.layout
    }

    pub fn provision(&self) -> Result<ProvisionOutcome> {
        if let EnvironmentChoice::External(path) = &self.environment {
            if !path.is_dir() {
                warn!("External environment {} does not exist", path.display());
            }
            info!("Using external environment {}", path.display());
            return Ok(ProvisionOutcome::External(path.clone()));
        }

        let env_dir = self.layout.env_dir();
        if self.layout.is_ready() {
            info!("Using existing environment {}", env_dir.display());
            return Ok(ProvisionOutcome::Reused(env_dir));
        }

        fs::create_dir_all(self.layout.work_root()).map_err(|e| {
            SquallError::io(format!("create {}", self.layout.work_root().display()), e)
        })?;
        let lock_path = self.layout.lock_file();
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| SquallError::io(format!("open {}", lock_path.display()), e))?;

        match lock.try_lock_exclusive() {
            Ok(()) => {
                let outcome = if self.layout.is_ready() {
                    debug!("Environment completed while acquiring the lock");
                    Ok(ProvisionOutcome::Reused(env_dir.clone()))
                } else {
                    self.build().map(|_| ProvisionOutcome::Created(env_dir.clone()))
                };
                release(&lock, &lock_path);
                outcome
            }
            Err(e) if is_contended(&e) => self.wait_for_builder(&lock, &lock_path),
            Err(e) => {
                let degraded = SquallError::DegradedLock {
                    lock_file: lock_path.display().to_string(),
                    source: e,
                };
                warn!("{} ({})", degraded, degraded.category());
                if self.layout.is_ready() {
                    return Ok(ProvisionOutcome::Reused(env_dir));
                }
                self.build()?;
                Ok(ProvisionOutcome::Created(env_dir))
            }
        }
    }

    fn wait_for_builder(&self, lock: &File, lock_path: &Path) -> Result<ProvisionOutcome> {
        info!("Waiting for environment {}", self.layout.env_dir().display());
        FileExt::lock_shared(lock)
            .map_err(|e| SquallError::io(format!("lock {}", lock_path.display()), e))?;
        release(lock, lock_path);
        if !self.layout.is_ready() {
            return Err(SquallError::provisioning(
                "wait",
                format!(
                    "environment {} was left incomplete by its builder",
                    self.layout.env_dir().display()
                ),
            ));
        }
        info!("Using existing environment {}", self.layout.env_dir().display());
        Ok(ProvisionOutcome::Reused(self.layout.env_dir()))
    }

    fn build(&self) -> Result<()> {
        let env_dir = self.layout.env_dir();
        let marker = self.layout.ready_marker();
        info!("Creating environment {}", env_dir.display());
        if env_dir.exists() {
            fs::remove_dir_all(&env_dir)
                .map_err(|e| SquallError::io(format!("remove stale {}", env_dir.display()), e))?;
        }
        fs::create_dir_all(self.layout.work_dir()).map_err(|e| {
            SquallError::io(format!("create {}", self.layout.work_dir().display()), e)
        })?;

        let started = std::time::Instant::now();
        self.installer.install(&env_dir)?;
        fs::write(&marker, chrono::Utc::now().to_rfc3339())
            .map_err(|e| SquallError::io(format!("write {}", marker.display()), e))?;
        info!(
            "Environment {} ready after {:?}",
            env_dir.display(),
            started.elapsed()
        );
        Ok(())
    }
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn release(lock: &File, lock_path: &Path) {
    if let Err(e) = FileExt::unlock(lock) {
        // closing the file releases it anyway
        debug!("Unlock of {} failed: {}", lock_path.display(), e);
    }
}

/// Builds environments with `virtualenv` and `pip`
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    settings: BootstrapSettings,
    resource_dir: PathBuf,
}

impl CommandInstaller {
    pub fn new(settings: BootstrapSettings, resource_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            resource_dir: resource_dir.into(),
        }
    }

    fn pip(&self, env_dir: &Path, target: &str) -> Command {
        let mut command = Command::new(env_dir.join("bin").join("pip"));
        command
            .arg("install")
            .args(self.settings.pip_options.split_whitespace())
            .arg(target)
            .current_dir(&self.resource_dir);
        command
    }

    /// A runtime wheel shipped inside the package, if any
    fn bundled_runtime(&self) -> Option<PathBuf> {
        let pattern = format!(
            "{}/{}-*.whl",
            glob::Pattern::escape(&self.resource_dir.to_string_lossy()),
            self.settings.runtime_package
        );
        glob::glob(&pattern).ok()?.filter_map(|p| p.ok()).next()
    }
}

impl EnvironmentInstaller for CommandInstaller {
    fn install(&self, env_dir: &Path) -> Result<()> {
        let python = format!("python{}", self.settings.python_version);
        let mut create = Command::new("virtualenv");
        create
            .args(["--system-site-packages", "--python", &python])
            .arg(env_dir);
        run("create environment", &mut create)?;

        for dep in &self.settings.pinned_dependencies {
            info!("Installing {}", dep);
            run("install dependencies", &mut self.pip(env_dir, dep))?;
        }

        let runtime = match self.bundled_runtime() {
            Some(wheel) => {
                info!("Installing runtime from local file {}", wheel.display());
                wheel.to_string_lossy().into_owned()
            }
            None => format!(
                "{}=={}",
                self.settings.runtime_package, self.settings.runtime_version
            ),
        };
        run("install runtime", &mut self.pip(env_dir, &runtime))?;

        let hook = self.resource_dir.join("setup.sh");
        if hook.is_file() {
            info!("Running {}", hook.display());
            let mut command = Command::new("/bin/bash");
            command
                .arg("./setup.sh")
                .arg("1")
                .current_dir(&self.resource_dir)
                .env("VIRTUAL_ENV", env_dir);
            run("setup hook", &mut command)?;
        }
        Ok(())
    }
}

fn run(step: &str, command: &mut Command) -> Result<()> {
    let program = command.get_program().to_string_lossy().into_owned();
    debug!("Running {:?}", command);
    let output = command.output().map_err(|e| SquallError::Provisioning {
        step: step.to_string(),
        message: format!("could not start {}", program),
        source: Some(e),
    })?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
    Err(SquallError::provisioning(
        step,
        format!(
            "{} exited with {}: {}",
            program,
            output.status,
            tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn layout(root: &Path) -> InstanceLayout {
        InstanceLayout::new("wordcount-1-17", root).unwrap()
    }

    #[test]
    fn test_first_call_creates_second_reuses() {
        let root = TempDir::new().unwrap();
        let calls = AtomicUsize::new(0);
        let installer = |env: &Path| {
            calls.fetch_add(1, Ordering::SeqCst);
            fs::create_dir_all(env.join("bin")).map_err(|e| SquallError::io("mkdir", e))
        };
        let provisioner = Provisioner::new(layout(root.path()), EnvironmentChoice::Managed, installer);

        let first = provisioner.provision().unwrap();
        assert!(matches!(first, ProvisionOutcome::Created(_)));
        assert!(provisioner.layout().is_ready());
        assert!(first.env_dir().join("bin").is_dir());

        let second = provisioner.provision().unwrap();
        assert_eq!(second, ProvisionOutcome::Reused(first.env_dir().to_path_buf()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_install_leaves_no_marker() {
        let root = TempDir::new().unwrap();
        let installer = |_: &Path| -> Result<()> {
            Err(SquallError::provisioning("install dependencies", "pip exited with 1"))
        };
        let provisioner = Provisioner::new(layout(root.path()), EnvironmentChoice::Managed, installer);
        let err = provisioner.provision().unwrap_err();
        assert_eq!(err.category(), "provisioning");
        assert!(!provisioner.layout().is_ready());
    }

    #[test]
    fn test_stale_environment_rebuilt() {
        let root = TempDir::new().unwrap();
        let layout = layout(root.path());
        fs::create_dir_all(layout.env_dir().join("junk")).unwrap();
        let installer = |env: &Path| -> Result<()> {
            assert!(!env.join("junk").exists());
            Ok(())
        };
        let provisioner = Provisioner::new(layout, EnvironmentChoice::Managed, installer);
        assert!(matches!(provisioner.provision().unwrap(), ProvisionOutcome::Created(_)));
    }

    #[test]
    fn test_external_environment_never_installs() {
        let root = TempDir::new().unwrap();
        let installer = |_: &Path| -> Result<()> { panic!("installer must not run") };
        let provisioner = Provisioner::new(
            layout(root.path()),
            EnvironmentChoice::External(root.path().to_path_buf()),
            installer,
        );
        assert_eq!(
            provisioner.provision().unwrap(),
            ProvisionOutcome::External(root.path().to_path_buf())
        );
        assert!(!provisioner.layout().lock_file().exists());
    }

    #[test]
    fn test_waiter_without_marker_fails() {
        let root = TempDir::new().unwrap();
        let layout = layout(root.path());
        let lock_path = layout.lock_file();
        let holder = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .unwrap();
        holder.try_lock_exclusive().unwrap();

        let installer = |_: &Path| -> Result<()> { Ok(()) };
        let provisioner = Provisioner::new(layout, EnvironmentChoice::Managed, installer);
        let waiter = std::thread::spawn(move || provisioner.provision());
        std::thread::sleep(std::time::Duration::from_millis(250));
        FileExt::unlock(&holder).unwrap();

        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.category(), "provisioning");
    }

    #[test]
    fn test_command_failure_reports_step() {
        let err = run("create environment", &mut Command::new("/nonexistent/virtualenv")).unwrap_err();
        match err {
            SquallError::Provisioning { step, source, .. } => {
                assert_eq!(step, "create environment");
                assert!(source.is_some());
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
