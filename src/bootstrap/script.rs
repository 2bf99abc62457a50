use crate::bootstrap::instance::{ENV_DIR_NAME, READY_MARKER, WORK_DIR_PREFIX};
use crate::core::config::{BootstrapSettings, EnvironmentChoice};
use std::path::Path;

/// Interpreter the rewritten stage command runs
pub const SETUP_INTERPRETER: &str = "/bin/bash";

/// Everything one generated setup script depends on
#[derive(Debug, Clone)]
pub struct ScriptParams<'a> {
    /// Stage script stem, e.g. `splitsentence` for `splitsentence.py`
    pub script: String,
    pub environment: &'a EnvironmentChoice,
    /// Log directory on the worker; the stage's working directory when unset
    pub log_dir: Option<&'a str>,
    pub settings: &'a BootstrapSettings,
}

impl<'a> ScriptParams<'a> {
    pub fn new(
        script: &str,
        environment: &'a EnvironmentChoice,
        log_dir: Option<&'a str>,
        settings: &'a BootstrapSettings,
    ) -> Self {
        Self {
            script: script_stem(script).to_string(),
            environment,
            log_dir,
            settings,
        }
    }

    /// Archive name of the generated script, `setup_<stem>.sh`
    pub fn file_name(&self) -> String {
        setup_script_name(&self.script)
    }
}

/// `splitsentence.py` -> `splitsentence`
pub fn script_stem(script: &str) -> &str {
    Path::new(script)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(script)
}

pub fn setup_script_name(script: &str) -> String {
    format!("setup_{}.sh", script_stem(script))
}

/// Single-quote `value` unless it is made of shell-safe characters only
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=+:@%,".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

const TEMPLATE: &str = r#"#!/bin/bash
set -e
SCRIPT=@SCRIPT@
LOGDIR=@LOGDIR@
LOG="$LOGDIR/squall$$_$SCRIPT.log"
ENV_LOG="$LOGDIR/squall$$_environment.log"
START=$SECONDS
log() { echo "[$(date '+%Y-%m-%d %H:%M:%S') +$((SECONDS - START))s] $*" >>"$LOG" 2>&1; }
log "Beginning task setup for $SCRIPT"

# The engine unpacks the package into <topology-id>/resources
PYVER=@PYVER@
CWDIR="$( cd "$( dirname "${BASH_SOURCE[0]}" )" && pwd )"
TOPOLOGY_ID_REGEX='([+A-Za-z0-9_-]+)/resources$'
if [[ $CWDIR =~ $TOPOLOGY_ID_REGEX ]]; then
    TOPOLOGY_ID="${BASH_REMATCH[1]}"
else
    log "Cannot derive a topology id from $CWDIR"
    exit 1
fi
WORK_ROOT=@WORK_ROOT@
WRKDIR="$WORK_ROOT/@PREFIX@$TOPOLOGY_ID"
LOCKFILE="$WORK_ROOT/@PREFIX@$TOPOLOGY_ID.lock"
READY="$WRKDIR/@READY@"
VENV=@VENV@
CREATE_VENV=@CREATE_VENV@
mkdir -p "$WRKDIR" >>"$LOG" 2>&1

if ! python$PYVER -c "pass" >/dev/null 2>&1; then
    log "python$PYVER not found, sourcing ~/.bashrc"
    source ~/.bashrc >>"$LOG" 2>&1 || true
fi
python$PYVER -c "pass" >>"$LOG" 2>&1

provision() {
    log "Creating environment $VENV"
    rm -rf "$VENV" "$READY"
    virtualenv --system-site-packages --python python$PYVER "$VENV" >>"$ENV_LOG" 2>&1
    source "$VENV/bin/activate" >>"$ENV_LOG" 2>&1
    for dep in @PINNED@; do
        log "Installing $dep"
        pip install @PIP_OPTIONS@ "$dep" >>"$ENV_LOG" 2>&1
    done
    RUNTIME_WHEEL=
    for f in @RUNTIME@-*.whl; do
        if [ -e "$f" ]; then
            RUNTIME_WHEEL="$f"
            break
        fi
    done
    if [ -n "$RUNTIME_WHEEL" ]; then
        log "Installing @RUNTIME@ from local file $RUNTIME_WHEEL"
        pip install @PIP_OPTIONS@ "$RUNTIME_WHEEL" >>"$ENV_LOG" 2>&1
    else
        log "Installing @RUNTIME@==@RUNTIME_VERSION@"
        pip install @PIP_OPTIONS@ "@RUNTIME@==@RUNTIME_VERSION@" >>"$ENV_LOG" 2>&1
    fi
    if [ -f ./setup.sh ]; then
        log "Running setup.sh"
        /bin/bash ./setup.sh $CREATE_VENV >>"$ENV_LOG" 2>&1
    fi
    touch "$READY"
    log "Environment ready"
}

if [ "$CREATE_VENV" -ne 0 ]; then
    if command -v flock >/dev/null 2>&1; then
        exec 99>"$LOCKFILE"
        if [ -f "$READY" ]; then
            log "Using existing environment $VENV"
        elif flock -xn 99; then
            # another process may have finished between the check and the lock
            if [ -f "$READY" ]; then
                log "Using existing environment $VENV"
            else
                provision
            fi
            flock -u 99
        else
            log "Waiting for environment $VENV"
            flock -s 99
            flock -u 99
            if [ ! -f "$READY" ]; then
                log "Environment $VENV was left incomplete by its builder"
                exit 1
            fi
            log "Using existing environment $VENV"
        fi
        exec 99>&-
    else
        log "flock not available, provisioning without synchronization"
        if [ ! -f "$READY" ]; then
            provision
        fi
    fi
else
    log "Using external environment $VENV"
fi
source "$VENV/bin/activate" >>"$LOG" 2>&1

log "Task setup took $((SECONDS - START)) seconds"
log "Launching: python -m @RUNTIME@.run $SCRIPT $LOG"
exec python -m @RUNTIME@.run "$SCRIPT" "$LOG"
"#;

/// Render the bash setup script for one stage script
pub fn render(params: &ScriptParams<'_>) -> String {
    let settings = params.settings;
    let (venv, create) = match params.environment {
        EnvironmentChoice::Managed => (format!("\"$WRKDIR/{}\"", ENV_DIR_NAME), "1"),
        EnvironmentChoice::External(path) => (shell_quote(&path.to_string_lossy()), "0"),
    };
    let log_dir = params
        .log_dir
        .map(shell_quote)
        .unwrap_or_else(|| "\"$PWD\"".to_string());
    let pinned = settings
        .pinned_dependencies
        .iter()
        .map(|d| shell_quote(d))
        .collect::<Vec<_>>()
        .join(" ");

    let values = [
        ("SCRIPT", shell_quote(&params.script)),
        ("LOGDIR", log_dir),
        ("PYVER", settings.python_version.clone()),
        ("WORK_ROOT", shell_quote(&settings.work_root.to_string_lossy())),
        ("PREFIX", WORK_DIR_PREFIX.to_string()),
        ("READY", READY_MARKER.to_string()),
        ("VENV", venv),
        ("CREATE_VENV", create.to_string()),
        ("PINNED", pinned),
        ("PIP_OPTIONS", settings.pip_options.clone()),
        ("RUNTIME", settings.runtime_package.clone()),
        ("RUNTIME_VERSION", settings.runtime_version.clone()),
    ];
    substitute(TEMPLATE, &values)
}

/// Replace each `@NAME@` of `template` in one pass.
///
/// Inserted values are never scanned again; an `@` that does not open a
/// known placeholder is copied through.
fn substitute(template: &str, values: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('@') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let placeholder = after.find('@').and_then(|end| {
            values
                .iter()
                .find(|(name, _)| *name == &after[..end])
                .map(|(_, value)| (value, end))
        });
        match placeholder {
            Some((value, end)) => {
                out.push_str(value);
                rest = &after[end + 1..];
            }
            None => {
                out.push('@');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rendered(environment: &EnvironmentChoice, log_dir: Option<&str>) -> String {
        let mut settings = BootstrapSettings::default();
        settings.pip_options = "--index-url http://mirror/simple".to_string();
        settings.runtime_version = "0.1.0".to_string();
        render(&ScriptParams::new(
            "splitsentence.py",
            environment,
            log_dir,
            &settings,
        ))
    }

    #[test]
    fn test_names() {
        assert_eq!(script_stem("splitsentence.py"), "splitsentence");
        assert_eq!(setup_script_name("bolts/count.py"), "setup_count.sh");
        assert_eq!(setup_script_name("run"), "setup_run.sh");
    }

    #[test]
    fn test_all_placeholders_substituted() {
        let script = rendered(&EnvironmentChoice::Managed, None);
        assert!(!script.contains('@'), "{script}");
        assert!(script.starts_with("#!/bin/bash\nset -e\n"));
    }

    #[test]
    fn test_managed_script_locks_degrades_and_execs() {
        let script = rendered(&EnvironmentChoice::Managed, None);
        assert!(script.contains("SCRIPT=splitsentence\n"));
        assert!(script.contains("LOGDIR=\"$PWD\"\n"));
        assert!(script.contains("WRKDIR=\"$WORK_ROOT/squall-$TOPOLOGY_ID\""));
        assert!(script.contains("LOCKFILE=\"$WORK_ROOT/squall-$TOPOLOGY_ID.lock\""));
        assert!(script.contains("CREATE_VENV=1\n"));
        assert!(script.contains("flock -xn 99"));
        assert!(script.contains("flock -s 99"));
        assert!(script.contains("flock not available, provisioning without synchronization"));
        assert!(script.contains("for dep in thrift==0.16.0 PyYAML==6.0.1; do"));
        assert!(script.contains("pip install --index-url http://mirror/simple \"$dep\""));
        assert!(script.contains("for f in squall-*.whl; do"));
        assert!(script.contains("\"squall==0.1.0\""));
        assert!(script.contains("/bin/bash ./setup.sh $CREATE_VENV"));
        assert!(script.trim_end().ends_with("exec python -m squall.run \"$SCRIPT\" \"$LOG\""));
    }

    #[test]
    fn test_ready_marker_written_last_in_provision() {
        let script = rendered(&EnvironmentChoice::Managed, None);
        let touch = script.find("touch \"$READY\"").unwrap();
        let setup = script.find("/bin/bash ./setup.sh").unwrap();
        let install = script.find("pip install").unwrap();
        assert!(install < setup && setup < touch);
    }

    #[test]
    fn test_external_environment_skips_creation() {
        let script = rendered(
            &EnvironmentChoice::External("/opt/envs/word count".into()),
            Some("/var/log/squall"),
        );
        assert!(script.contains("VENV='/opt/envs/word count'\n"));
        assert!(script.contains("CREATE_VENV=0\n"));
        assert!(script.contains("LOGDIR=/var/log/squall\n"));
    }

    #[test]
    fn test_values_are_not_rescanned() {
        let mut settings = BootstrapSettings::default();
        settings.pip_options = "--trusted-host @RUNTIME@ --index-url http://a@b/simple".to_string();
        settings.runtime_version = "0.1.0".to_string();
        let script = render(&ScriptParams::new(
            "count.py",
            &EnvironmentChoice::Managed,
            None,
            &settings,
        ));
        assert!(script.contains(
            "pip install --trusted-host @RUNTIME@ --index-url http://a@b/simple \"$dep\""
        ));
        assert!(script.contains("\"squall==0.1.0\""));
    }

    #[test]
    fn test_substitute_passes_unknown_markers_through() {
        let values = [("A", "1".to_string()), ("AB", "2".to_string())];
        assert_eq!(substitute("@A@ @AB@ user@host @ @A", &values), "1 2 user@host @ @A");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain-name_1.py"), "plain-name_1.py");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
