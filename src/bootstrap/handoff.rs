use crate::core::errors::{Result, SquallError};
use std::convert::Infallible;
use std::ffi::OsString;
use std::path::Path;
use std::process::Command;
use tracing::info;

/// Build the stage command, running inside `env_dir` when given.
///
/// The environment's `bin` directory goes first on `PATH` and
/// `VIRTUAL_ENV` is set, which is what sourcing `bin/activate` does.
pub fn stage_command(argv: &[String], env_dir: Option<&Path>) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| SquallError::configuration("No stage command given"))?;
    let mut command = Command::new(program);
    command.args(args);

    if let Some(env_dir) = env_dir {
        let bin = env_dir.join("bin");
        let mut paths = vec![bin];
        if let Some(existing) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&existing));
        }
        let path: OsString = std::env::join_paths(paths).map_err(|e| {
            SquallError::configuration_in(
                format!("Cannot add environment to PATH: {}", e),
                env_dir.display().to_string(),
            )
        })?;
        command.env("PATH", path).env("VIRTUAL_ENV", env_dir);
        command.env_remove("PYTHONHOME");
    }
    Ok(command)
}

/// Replace the current process with the stage command.
///
/// Only returns on failure. The engine supervises the process it started,
/// so the stage must take over this process id.
#[cfg(unix)]
pub fn exec_stage(mut command: Command) -> Result<Infallible> {
    use std::os::unix::process::CommandExt;

    let program = command.get_program().to_string_lossy().into_owned();
    info!("Launching: {:?}", command);
    let error = command.exec();
    Err(SquallError::io(format!("exec {}", program), error))
}

/// Without `exec`, run the stage as a child and exit with its status
#[cfg(not(unix))]
pub fn exec_stage(mut command: Command) -> Result<Infallible> {
    let program = command.get_program().to_string_lossy().into_owned();
    info!("Launching: {:?}", command);
    let status = command
        .status()
        .map_err(|e| SquallError::io(format!("spawn {}", program), e))?;
    std::process::exit(status.code().unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::ffi::OsStr;

    fn env_of<'a>(command: &'a Command, key: &str) -> Option<&'a OsStr> {
        command
            .get_envs()
            .find(|(k, _)| *k == OsStr::new(key))
            .and_then(|(_, v)| v)
    }

    #[test]
    fn test_command_inside_environment() {
        let argv = vec!["python".to_string(), "-m".into(), "squall.run".into(), "split".into()];
        let command = stage_command(&argv, Some(Path::new("/tmp/squall-wc-1/venv"))).unwrap();
        assert_eq!(command.get_program(), "python");
        assert_eq!(command.get_args().collect::<Vec<_>>(), vec!["-m", "squall.run", "split"]);
        assert_eq!(
            env_of(&command, "VIRTUAL_ENV"),
            Some(OsStr::new("/tmp/squall-wc-1/venv"))
        );
        let path = env_of(&command, "PATH").unwrap();
        let first = std::env::split_paths(path).next().unwrap();
        assert_eq!(first, Path::new("/tmp/squall-wc-1/venv/bin"));
    }

    #[test]
    fn test_command_without_environment_inherits() {
        let command = stage_command(&["true".to_string()], None).unwrap();
        assert_eq!(command.get_envs().count(), 0);
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(stage_command(&[], None).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_exec_failure_returned() {
        let command = Command::new("/nonexistent/squall-stage");
        let err = exec_stage(command).unwrap_err();
        assert_eq!(err.category(), "io");
    }
}
