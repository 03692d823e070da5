//! Runs the external simulator inside a sandbox and waits for it.

use crate::error::ModelExecutionError;
use crate::sandbox::Sandbox;
use simcal_core::normalize_path;
use std::fs;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const STDOUT_LOG: &str = "simulator.stdout.log";
pub const STDERR_LOG: &str = "simulator.stderr.log";

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const STDERR_TAIL_LINES: usize = 5;

/// Shared stop flag. Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SimulatorCommand {
    pub command: Vec<String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    pub stderr_tail: String,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub fn run(
    sandbox: &Sandbox,
    command: &SimulatorCommand,
    cancel: &CancelToken,
) -> Result<RunOutcome, ModelExecutionError> {
    run_in(sandbox.path(), command, cancel)
}

/// Blocks until the simulator exits, the timeout elapses or `cancel` fires;
/// in the latter two cases the child is killed and reaped before returning.
pub(crate) fn run_in(
    workdir: &Path,
    command: &SimulatorCommand,
    cancel: &CancelToken,
) -> Result<RunOutcome, ModelExecutionError> {
    if command.command.is_empty() {
        return Err(ModelExecutionError::EmptyCommand);
    }
    let resolved = resolve_command_local(&command.command, workdir);
    let program = resolved[0].clone();
    let spawn_err = |source| ModelExecutionError::Spawn {
        program: program.clone(),
        source,
    };
    let stdout = fs::File::create(workdir.join(STDOUT_LOG)).map_err(spawn_err)?;
    let stderr = fs::File::create(workdir.join(STDERR_LOG)).map_err(spawn_err)?;

    let mut cmd = Command::new(&resolved[0]);
    cmd.args(&resolved[1..]);
    cmd.current_dir(workdir);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::from(stdout));
    cmd.stderr(Stdio::from(stderr));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own group: `terminate` signals everything the simulator spawned.
        cmd.process_group(0);
    }

    if cancel.is_cancelled() {
        return Err(ModelExecutionError::Cancelled);
    }
    let started = Instant::now();
    let mut child = cmd.spawn().map_err(spawn_err)?;
    debug!(program = %program, pid = child.id(), "simulator started");
    let deadline = command.timeout.map(|t| started + t);

    let status = loop {
        if let Some(status) = child.try_wait().map_err(ModelExecutionError::Wait)? {
            break status;
        }
        if cancel.is_cancelled() {
            terminate(&mut child);
            warn!(program = %program, "simulator terminated on cancellation");
            return Err(ModelExecutionError::Cancelled);
        }
        if let (Some(deadline), Some(timeout)) = (deadline, command.timeout) {
            if Instant::now() >= deadline {
                terminate(&mut child);
                warn!(program = %program, timeout_s = timeout.as_secs_f64(), "simulator timed out");
                return Err(ModelExecutionError::TimedOut { timeout });
            }
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(RunOutcome {
        exit_code: status.code(),
        elapsed: started.elapsed(),
        stderr_tail: stderr_tail(&workdir.join(STDERR_LOG)),
    })
}

fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        // The group id is the child's pid (see `process_group(0)` at spawn).
        let pgid = child.id() as libc::pid_t;
        let result = unsafe { libc::killpg(pgid, libc::SIGKILL) };
        if result != 0 {
            debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn stderr_tail(path: &Path) -> String {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(_) => return String::new(),
    };
    let text = String::from_utf8_lossy(&data);
    let mut tail: Vec<&str> = text
        .lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .take(STDERR_TAIL_LINES)
        .collect();
    tail.reverse();
    tail.join("\n")
}

/// Resolves an explicitly relative program (`./model`, `../bin/model`)
/// against the sandbox. Arguments are passed through untouched.
fn resolve_command_local(command: &[String], workdir: &Path) -> Vec<String> {
    let mut resolved = command.to_vec();
    if let Some(program) = resolved.first_mut() {
        if program_is_sandbox_relative(program) {
            *program = normalize_path(&workdir.join(program.as_str()))
                .to_string_lossy()
                .to_string();
        }
    }
    resolved
}

fn program_is_sandbox_relative(program: &str) -> bool {
    program.starts_with("./") || program.starts_with("../")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use simcal_core::ensure_dir;
    use std::path::PathBuf;

    fn temp_workdir(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "simcal_invoke_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("workdir");
        root
    }

    fn sh(script: &str, timeout: Option<Duration>) -> SimulatorCommand {
        SimulatorCommand {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout,
        }
    }

    #[test]
    fn resolve_command_local_resolves_relative_program_only() {
        let root = PathBuf::from("/tmp/simcal_proj");
        let cmd = vec![
            "./model".to_string(),
            "input/model.cfg".to_string(),
            "--log=logs/run.log".to_string(),
            "prepare.sh".to_string(),
        ];
        let resolved = resolve_command_local(&cmd, &root);
        assert_eq!(resolved[0], root.join("model").to_string_lossy());
        assert_eq!(&resolved[1..], &cmd[1..]);

        let parent = vec!["../bin/model".to_string()];
        assert_eq!(
            resolve_command_local(&parent, &root)[0],
            "/tmp/bin/model".to_string()
        );
    }

    #[test]
    fn shell_script_bodies_are_not_rewritten() {
        let root = PathBuf::from("/tmp/simcal_proj");
        let cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            "mkdir -p out && echo ok > out/x.txt".to_string(),
        ];
        assert_eq!(resolve_command_local(&cmd, &root), cmd);
    }

    #[test]
    fn resolve_command_local_keeps_path_lookups() {
        let root = PathBuf::from("/tmp/simcal_proj");
        let cmd = vec!["DHSVM3.1.3".to_string(), "Input.global".to_string()];
        assert_eq!(resolve_command_local(&cmd, &root), cmd);
    }

    #[cfg(unix)]
    #[test]
    fn runs_in_working_directory() {
        let dir = temp_workdir("cwd");
        let out = run_in(&dir, &sh("echo hi > made_here.txt", None), &CancelToken::new())
            .expect("run");
        assert!(out.success());
        assert!(dir.join("made_here.txt").is_file());
        assert!(dir.join(STDOUT_LOG).is_file());
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn inline_script_with_paths_runs_in_workdir() {
        let dir = temp_workdir("inline");
        let out = run_in(
            &dir,
            &sh("mkdir -p out && echo ok > out/x.txt", None),
            &CancelToken::new(),
        )
        .expect("run");
        assert!(out.success(), "stderr: {}", out.stderr_tail);
        assert_eq!(fs::read_to_string(dir.join("out").join("x.txt")).unwrap(), "ok\n");
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_reported_with_stderr_tail() {
        let dir = temp_workdir("exit");
        let out = run_in(
            &dir,
            &sh("echo 'bad input' >&2; exit 3", None),
            &CancelToken::new(),
        )
        .expect("run");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
        assert_eq!(out.stderr_tail, "bad input");
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_simulator() {
        let dir = temp_workdir("timeout");
        let started = Instant::now();
        let err = run_in(
            &dir,
            &sh("sleep 10", Some(Duration::from_millis(200))),
            &CancelToken::new(),
        )
        .expect_err("timeout");
        assert!(matches!(err, ModelExecutionError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_background_children() {
        let dir = temp_workdir("group");
        let marker = dir.join("late_marker");
        let script = format!("(sleep 1; touch '{}') &\nwait", marker.display());
        let err = run_in(
            &dir,
            &sh(&script, Some(Duration::from_millis(200))),
            &CancelToken::new(),
        )
        .expect_err("timeout");
        assert!(matches!(err, ModelExecutionError::TimedOut { .. }));
        thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists(), "background child outlived the timeout");
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_kills_simulator() {
        let dir = temp_workdir("cancel");
        let token = CancelToken::new();
        let remote = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            remote.cancel();
        });
        let err = run_in(&dir, &sh("sleep 10", None), &token).expect_err("cancelled");
        canceller.join().unwrap();
        assert!(matches!(err, ModelExecutionError::Cancelled));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let dir = temp_workdir("spawn");
        let cmd = SimulatorCommand {
            command: vec!["simcal-no-such-simulator-binary".to_string()],
            timeout: None,
        };
        let err = run_in(&dir, &cmd, &CancelToken::new()).expect_err("spawn");
        assert!(matches!(err, ModelExecutionError::Spawn { .. }));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn empty_command_is_rejected() {
        let dir = temp_workdir("empty");
        let cmd = SimulatorCommand {
            command: Vec::new(),
            timeout: None,
        };
        let err = run_in(&dir, &cmd, &CancelToken::new()).expect_err("empty");
        assert!(matches!(err, ModelExecutionError::EmptyCommand));
        let _ = fs::remove_dir_all(dir);
    }
}
