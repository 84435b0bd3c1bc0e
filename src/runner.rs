//! External solver invocation.
//!
//! A solver run is a typed job: model input path, working directory,
//! expected output path and a time budget. `Solver` is the seam that lets
//! the objective run against a fake in tests.

use crate::error::{CalibrationError, Result};
use std::env;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const PIPE_GRACE: Duration = Duration::from_millis(100);
const STDERR_EXCERPT_LINES: usize = 20;

/// One solver invocation.
#[derive(Clone, Debug)]
pub struct SolverJob {
    pub input: PathBuf,
    pub workdir: PathBuf,
    pub output: PathBuf,
    pub timeout: Duration,
}

/// Outcome of a solver run that exited with status zero.
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Where the artifact is expected; existence is checked by the parser
    pub output_path: PathBuf,
    pub elapsed: Duration,
}

/// Session-level abort flag shared between the driver and running jobs.
#[derive(Clone, Debug, Default)]
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

pub trait Solver {
    /// Run the job to completion, failing on non-zero exit, timeout or
    /// cancellation.
    fn run(&self, job: &SolverJob, cancel: &CancelToken) -> Result<ExecutionResult>;

    /// Session-setup check that the solver can be started at all.
    fn verify(&self) -> Result<()> {
        Ok(())
    }
}

/// Solver binary launched as a subprocess rooted at the workspace.
#[derive(Clone, Debug)]
pub struct ExternalSolver {
    program: String,
    args: Vec<String>,
}

impl ExternalSolver {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn expand_args(&self, job: &SolverJob) -> Vec<String> {
        let input = job.input.display().to_string();
        let workdir = job.workdir.display().to_string();
        let output = job.output.display().to_string();
        self.args
            .iter()
            .map(|a| {
                a.replace("{input}", &input)
                    .replace("{workdir}", &workdir)
                    .replace("{output}", &output)
            })
            .collect()
    }
}

impl Solver for ExternalSolver {
    fn verify(&self) -> Result<()> {
        resolve_program(&self.program)
            .map(|_| ())
            .ok_or_else(|| CalibrationError::SolverMissing(self.program.clone()))
    }

    fn run(&self, job: &SolverJob, cancel: &CancelToken) -> Result<ExecutionResult> {
        let start = Instant::now();
        let deadline = start.checked_add(job.timeout).ok_or_else(|| {
            CalibrationError::Config(format!("solver timeout {:?} is out of range", job.timeout))
        })?;

        let mut command = Command::new(&self.program);
        command
            .args(self.expand_args(job))
            .current_dir(&job.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        own_process_group(&mut command);
        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                CalibrationError::SolverMissing(format!("{}: {}", self.program, e))
            }
            _ => CalibrationError::Io(e),
        })?;

        // Pipes are drained on their own threads so a chatty solver cannot
        // block on a full pipe while we poll for exit.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if cancel.is_cancelled() {
                terminate(&mut child);
                return Err(CalibrationError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                terminate(&mut child);
                return Err(CalibrationError::Timeout(job.timeout));
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        };

        // Anything the solver left running in the background dies with it
        // and releases the pipes.
        kill_group(&mut child);
        let (Some(stdout), Some(stderr)) = (collect(&stdout, deadline), collect(&stderr, deadline))
        else {
            return Err(CalibrationError::Timeout(job.timeout));
        };
        let elapsed = start.elapsed();

        // Killed by a signal reports no code.
        let exit_code = status.code().unwrap_or(-1);
        if !status.success() {
            return Err(CalibrationError::ExecutionFailure {
                exit_code,
                stderr_excerpt: tail_lines(&stderr, STDERR_EXCERPT_LINES),
            });
        }

        Ok(ExecutionResult {
            exit_code,
            stdout,
            stderr,
            output_path: job.output.clone(),
            elapsed,
        })
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
    });
    rx
}

/// Captured pipe text, or `None` if the pipe is still held open at the
/// deadline. A solver that exits right at the deadline gets `PIPE_GRACE`.
fn collect(rx: &Receiver<String>, deadline: Instant) -> Option<String> {
    let wait = deadline.saturating_duration_since(Instant::now()).max(PIPE_GRACE);
    rx.recv_timeout(wait).ok()
}

#[cfg(unix)]
fn own_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_command: &mut Command) {}

/// Kill the solver's process group and reap the solver. Reader threads are
/// left to finish on their own.
fn terminate(child: &mut Child) {
    kill_group(child);
    let _ = child.wait();
}

#[cfg(unix)]
fn kill_group(child: &mut Child) {
    // The solver leads its own group, so its pid is the group id.
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: killpg only sends a signal; it touches no memory of ours.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(error = %err, "failed to kill solver process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::warn!(error = %e, "failed to kill solver process");
    }
}

/// Last `n` lines of `text`.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let from = lines.len().saturating_sub(n);
    lines[from..].join("\n")
}

/// Locate the program as given or on PATH.
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    let direct = Path::new(program);
    if direct.components().count() > 1 || direct.is_absolute() {
        return direct.is_file().then(|| direct.to_path_buf());
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return Some(candidate);
        }
        let exe = candidate.with_extension(env::consts::EXE_EXTENSION);
        (!env::consts::EXE_EXTENSION.is_empty() && exe.is_file()).then_some(exe)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\nd", 2), "c\nd");
        assert_eq!(tail_lines("a", 5), "a");
        assert_eq!(tail_lines("", 3), "");
    }

    #[test]
    fn test_expand_args() {
        let solver = ExternalSolver::new(
            "febio4",
            vec!["-i".into(), "{input}".into(), "-o={output}".into(), "{workdir}".into()],
        );
        let job = SolverJob {
            input: PathBuf::from("/w/model.feb"),
            workdir: PathBuf::from("/w"),
            output: PathBuf::from("/w/rx.txt"),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(
            solver.expand_args(&job),
            vec!["-i", "/w/model.feb", "-o=/w/rx.txt", "/w"]
        );
    }

    #[test]
    fn test_missing_program() {
        let solver = ExternalSolver::new("definitely-not-a-solver-binary-42", vec![]);
        assert!(matches!(solver.verify(), Err(CalibrationError::SolverMissing(_))));
        assert!(resolve_program("/no/such/dir/febio4").is_none());
    }

    #[test]
    fn test_timeout_out_of_range() {
        let solver = ExternalSolver::new("sh", vec![]);
        let job = SolverJob {
            input: PathBuf::from("model.feb"),
            workdir: PathBuf::from("."),
            output: PathBuf::from("out.txt"),
            timeout: Duration::MAX,
        };
        let err = solver.run(&job, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, CalibrationError::Config(_)));
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use tempfile::TempDir;

        fn job(dir: &TempDir, timeout: Duration) -> SolverJob {
            SolverJob {
                input: dir.path().join("model.feb"),
                workdir: dir.path().to_path_buf(),
                output: dir.path().join("out.txt"),
                timeout,
            }
        }

        fn sh(script: &str) -> ExternalSolver {
            ExternalSolver::new(
                "sh",
                vec!["-c".into(), script.into(), "sh".into(), "{input}".into(), "{output}".into()],
            )
        }

        #[test]
        fn test_success_captures_output() {
            let dir = TempDir::new().unwrap();
            let solver = sh("echo running $1; printf '1 2\\n' > \"$2\"");
            let result = solver
                .run(&job(&dir, Duration::from_secs(10)), &CancelToken::new())
                .unwrap();
            assert_eq!(result.exit_code, 0);
            assert!(result.stdout.contains("model.feb"));
            assert!(result.output_path.is_file());
        }

        #[test]
        fn test_runs_in_workdir() {
            let dir = TempDir::new().unwrap();
            let solver = sh("echo here > local.txt");
            solver
                .run(&job(&dir, Duration::from_secs(10)), &CancelToken::new())
                .unwrap();
            assert!(dir.path().join("local.txt").is_file());
        }

        #[test]
        fn test_non_zero_exit() {
            let dir = TempDir::new().unwrap();
            let solver = sh("echo 'negative jacobian' >&2; exit 3");
            let err = solver
                .run(&job(&dir, Duration::from_secs(10)), &CancelToken::new())
                .unwrap_err();
            match err {
                CalibrationError::ExecutionFailure { exit_code, stderr_excerpt } => {
                    assert_eq!(exit_code, 3);
                    assert!(stderr_excerpt.contains("negative jacobian"));
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[test]
        fn test_timeout_kills() {
            let dir = TempDir::new().unwrap();
            let solver = sh("exec sleep 5");
            let start = Instant::now();
            let err = solver
                .run(&job(&dir, Duration::from_millis(200)), &CancelToken::new())
                .unwrap_err();
            assert!(matches!(err, CalibrationError::Timeout(_)));
            assert!(start.elapsed() < Duration::from_secs(4));
        }

        #[test]
        fn test_background_child_does_not_hold_the_run() {
            let dir = TempDir::new().unwrap();
            let solver = sh("(sleep 1; touch late) & echo done; exit 0");
            let start = Instant::now();
            let result = solver
                .run(&job(&dir, Duration::from_millis(300)), &CancelToken::new())
                .unwrap();
            assert!(start.elapsed() < Duration::from_millis(900), "{:?}", start.elapsed());
            assert!(result.stdout.contains("done"));

            thread::sleep(Duration::from_millis(1500));
            assert!(!dir.path().join("late").exists(), "background child outlived the run");
        }

        #[test]
        fn test_timeout_kills_wrapped_solver() {
            let dir = TempDir::new().unwrap();
            // the inner shell is not exec'd, so killing only the wrapper would
            // leave it running
            let solver = sh("sh -c 'sleep 1; touch alive'; true");
            let start = Instant::now();
            let err = solver
                .run(&job(&dir, Duration::from_millis(200)), &CancelToken::new())
                .unwrap_err();
            assert!(matches!(err, CalibrationError::Timeout(_)));
            assert!(start.elapsed() < Duration::from_millis(900), "{:?}", start.elapsed());

            thread::sleep(Duration::from_millis(1500));
            assert!(!dir.path().join("alive").exists(), "solver survived the timeout");
        }

        #[test]
        fn test_cancel_from_another_thread() {
            let dir = TempDir::new().unwrap();
            let token = CancelToken::new();
            let remote = token.clone();
            let canceller = thread::spawn(move || {
                thread::sleep(Duration::from_millis(200));
                remote.cancel();
            });
            let start = Instant::now();
            let err = sh("sleep 5; true")
                .run(&job(&dir, Duration::from_secs(10)), &token)
                .unwrap_err();
            canceller.join().unwrap();
            assert!(matches!(err, CalibrationError::Cancelled));
            assert!(start.elapsed() < Duration::from_secs(2));
        }

        #[test]
        fn test_cancelled_before_exit() {
            let dir = TempDir::new().unwrap();
            let token = CancelToken::new();
            token.cancel();
            let err = sh("exec sleep 5")
                .run(&job(&dir, Duration::from_secs(10)), &token)
                .unwrap_err();
            assert!(matches!(err, CalibrationError::Cancelled));
        }
    }
}
