use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::log_sanitize::{TailBuffer, for_each_line, sanitize_log_line};

pub const DIAG_TAIL_LINES: usize = 100;
const CANCEL_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TargetStarted {
        id: String,
    },
    TargetLog {
        id: String,
        line: String,
    },
    /// Tail of a failed tool's output, for diagnosis.
    Diagnostics {
        id: String,
        source: String,
        lines: Vec<String>,
    },
    TargetFinished {
        id: String,
        ok: bool,
        skipped: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    RunDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    targets_started: usize,
    targets_ok: usize,
    targets_skipped: usize,
    targets_failed: usize,
    log_lines: usize,
    failed_targets: Vec<String>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::TargetStarted { id } => {
                if let Ok(mut s) = self.state.lock() {
                    s.targets_started = s.targets_started.saturating_add(1);
                    s.started_at.get_or_insert_with(Instant::now);
                }
                println!("######## {id} ########");
            }
            ExecEvent::TargetLog { id, line } => {
                if let Ok(mut s) = self.state.lock() {
                    s.log_lines = s.log_lines.saturating_add(1);
                }
                println!("[{id}] {line}");
            }
            ExecEvent::Diagnostics { id, source, lines } => {
                println!("---- last {} lines of {source} ({id}) ----", lines.len());
                for l in lines {
                    println!("{}", sanitize_log_line(&l));
                }
                println!("---- end of {source} ----");
            }
            ExecEvent::TargetFinished {
                id,
                ok,
                skipped,
                error,
                elapsed_ms,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    if skipped {
                        s.targets_skipped = s.targets_skipped.saturating_add(1);
                    } else if ok {
                        s.targets_ok = s.targets_ok.saturating_add(1);
                    } else {
                        s.targets_failed = s.targets_failed.saturating_add(1);
                        s.failed_targets.push(id.clone());
                    }
                }
                if skipped {
                    println!("SKIP: {id}");
                } else if ok {
                    println!("DONE: {id} ({})", format_elapsed_hms((elapsed_ms / 1000) as u64));
                } else {
                    println!(
                        "FAIL: {id} ({}) {}",
                        format_elapsed_hms((elapsed_ms / 1000) as u64),
                        error.unwrap_or_default()
                    );
                }
            }
            ExecEvent::RunDone { ok, error } => {
                let Ok(mut s) = self.state.lock() else {
                    return;
                };
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                let mut summary = String::from("SUMMARY:\n");
                summary.push_str(&format!("  status: {}\n", if ok { "ok" } else { "failed" }));
                summary.push_str(&format!(
                    "  targets: started={} ok={} skipped={} failed={}\n",
                    s.targets_started, s.targets_ok, s.targets_skipped, s.targets_failed
                ));
                summary.push_str(&format!("  logs: {}\n", s.log_lines));
                summary.push_str(&format!("  elapsed: {}\n", format_elapsed_hms(wall.as_secs())));
                summary.push_str(&format!(
                    "  finished_at: {}\n",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
                ));
                if !s.failed_targets.is_empty() {
                    summary.push_str(&format!("  failed_targets: {}\n", s.failed_targets.join(", ")));
                }
                if let Some(e) = error.filter(|_| !ok) {
                    summary.push_str(&format!("  error: {e}\n"));
                }
                *s = StdoutSinkState::default();
                print!("{summary}");
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub cancel: Arc<AtomicBool>,
    pub sink: Arc<dyn ExecSink>,
    pub current_target: Option<String>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            cancel: Arc::new(AtomicBool::new(false)),
            sink,
            current_target: None,
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn set_target(&mut self, id: impl Into<String>) {
        self.current_target = Some(id.into());
    }

    fn target_id(&self) -> String {
        self.current_target
            .clone()
            .unwrap_or_else(|| "<none>".into())
    }

    pub fn log(&self, msg: &str) {
        self.sink.emit(ExecEvent::TargetLog {
            id: self.target_id(),
            line: msg.to_string(),
        });
    }

    pub fn diagnostics(&self, source: &str, lines: Vec<String>) {
        if lines.is_empty() {
            return;
        }
        self.sink.emit(ExecEvent::Diagnostics {
            id: self.target_id(),
            source: source.to_string(),
            lines,
        });
    }
}

/// One external command: program, args, explicit working directory and
/// environment overrides. `quiet` discards its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub envs: BTreeMap<String, String>,
    pub quiet: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: &Path) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.to_path_buf(),
            envs: BTreeMap::new(),
            quiet: false,
        }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.envs.insert(k.into(), v.into());
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.envs {
            write!(f, "{k}={v} ")?;
        }
        write!(f, "{}", self.program)?;
        for a in &self.args {
            write!(f, " {a}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    /// `None` when the process died from a signal.
    pub code: Option<i32>,
    pub tail: Vec<String>,
}

impl CommandOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            tail: Vec::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Narrow seam to opaque external commands (build tool, git, tar).
pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec, ctx: &ExecCtx) -> Result<CommandOutcome>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec, ctx: &ExecCtx) -> Result<CommandOutcome> {
        if ctx.cancelled() {
            return Err(Error::interrupted());
        }
        if ctx.dry_run {
            ctx.log(&format!("DRY-RUN: (cd {} && {spec})", spec.cwd.display()));
            return Ok(CommandOutcome::exited(0));
        }
        tracing::debug!(cwd = %spec.cwd.display(), command = %spec, "running command");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).current_dir(&spec.cwd).envs(&spec.envs);

        // Own process group, so cancellation can take down the whole subtree.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let (out, err) = if spec.quiet {
            (Stdio::null(), Stdio::null())
        } else {
            (Stdio::piped(), Stdio::piped())
        };
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(out)
            .stderr(err)
            .spawn()
            .map_err(|e| Error::tool(None, format!("failed to spawn '{}': {e}", spec.program)))?;
        let pgid = child.id();

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, tx.clone());
        }
        drop(tx);

        let mut tail = TailBuffer::new(DIAG_TAIL_LINES);
        loop {
            match rx.recv_timeout(CANCEL_POLL) {
                Ok(line) => {
                    let line = sanitize_log_line(&line);
                    if !line.is_empty() {
                        ctx.log(&line);
                        tail.push(line);
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
            if ctx.cancelled() {
                kill_pgroup(pgid, false);
                kill_pgroup(pgid, true);
                let _ = child.wait();
                return Err(Error::interrupted());
            }
        }

        let status = loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| Error::tool(None, format!("wait failed for '{}': {e}", spec.program)))?
            {
                break status;
            }
            if ctx.cancelled() {
                kill_pgroup(pgid, false);
                kill_pgroup(pgid, true);
                let _ = child.wait();
                return Err(Error::interrupted());
            }
            std::thread::sleep(CANCEL_POLL / 2);
        };

        Ok(CommandOutcome {
            code: status.code(),
            tail: tail.into_vec(),
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, tx: mpsc::Sender<String>) {
    std::thread::spawn(move || {
        for_each_line(reader, |line| {
            let _ = tx.send(line);
        })
    });
}

fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative PID targets the whole process group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

pub fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> (ExecCtx, mpsc::Receiver<ExecEvent>) {
        let (tx, rx) = mpsc::channel();
        let mut ctx = ExecCtx::new(false, Arc::new(ChannelSink::new(tx)));
        ctx.set_target("unit");
        (ctx, rx)
    }

    fn logged(rx: &mpsc::Receiver<ExecEvent>) -> Vec<String> {
        rx.try_iter()
            .filter_map(|ev| match ev {
                ExecEvent::TargetLog { line, .. } => Some(line),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn display_shows_env_then_command() {
        let spec = CommandSpec::new("make", Path::new("/br"))
            .env("BR2_DL_DIR", "/dl")
            .args(["-j4", "all"]);
        assert_eq!(spec.to_string(), "BR2_DL_DIR=/dl make -j4 all");
    }

    #[test]
    fn elapsed_is_formatted_as_hms() {
        assert_eq!(format_elapsed_hms(3725), "01:02:05");
    }

    #[test]
    fn dry_run_never_spawns() {
        let (mut ctx, rx) = ctx();
        ctx.dry_run = true;
        let spec = CommandSpec::new("definitely-not-a-real-binary", Path::new("/"));
        let out = SystemRunner.run(&spec, &ctx).expect("dry run");
        assert!(out.success());
        assert!(logged(&rx)[0].starts_with("DRY-RUN:"));
    }

    #[test]
    fn cancelled_context_refuses_to_run() {
        let (ctx, _rx) = ctx();
        ctx.request_cancel();
        let err = SystemRunner
            .run(&CommandSpec::new("true", Path::new("/")), &ctx)
            .unwrap_err();
        assert!(err.is_interrupted());
    }

    #[cfg(unix)]
    #[test]
    fn captures_lines_and_exit_code() {
        let (ctx, rx) = ctx();
        let tmp = tempfile::tempdir().expect("tempdir");
        let spec = CommandSpec::new("sh", tmp.path())
            .args(["-c", "echo \"$GREETING\"; pwd; exit 3"])
            .env("GREETING", "hello");
        let out = SystemRunner.run(&spec, &ctx).expect("run");
        assert_eq!(out.code, Some(3));
        let lines = logged(&rx);
        assert!(lines.contains(&"hello".to_string()), "{lines:?}");
        assert_eq!(out.tail.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn quiet_commands_log_nothing() {
        let (ctx, rx) = ctx();
        let spec = CommandSpec::new("sh", Path::new("/"))
            .args(["-c", "echo noisy"])
            .quiet();
        let out = SystemRunner.run(&spec, &ctx).expect("run");
        assert!(out.success());
        assert!(logged(&rx).is_empty());
    }

    #[test]
    fn missing_program_is_a_tool_error() {
        let (ctx, _rx) = ctx();
        let err = SystemRunner
            .run(
                &CommandSpec::new("retroroot-no-such-binary", Path::new("/")),
                &ctx,
            )
            .unwrap_err();
        assert!(matches!(err.kind(), crate::error::ErrorKind::Tool { code: None }));
    }
}
