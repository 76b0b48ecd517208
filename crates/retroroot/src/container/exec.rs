use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::watchdog::{KillSignal, StreamTiming, StreamWatchdog, WatchState, process_alive};
use super::{Captured, ContainerManager, ContainerRuntime, ExecSpec, Filters};
use crate::error::Result;
use crate::log_sanitize::{for_each_line, prefix_block, prefix_line, sanitize_log_line};

// Kill polls to wait for the exec client itself to report the exit.
const EXIT_SETTLE_POLLS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Fire and forget.
    Detach,
    /// Run to completion and capture output.
    Foreground,
    Stream { block: bool },
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub user: String,
    pub workdir: String,
    pub env: BTreeMap<String, String>,
    pub mode: ExecMode,
    /// Defaults to the container name.
    pub log_prefix: Option<String>,
    pub kill_signal: KillSignal,
    pub max_runtime: Option<Duration>,
    pub expected_exit_code: i32,
}

impl ExecRequest {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            user: "root".into(),
            workdir: "/".into(),
            env: BTreeMap::new(),
            mode: ExecMode::Detach,
            log_prefix: None,
            kill_signal: KillSignal::default(),
            max_runtime: None,
            expected_exit_code: 0,
        }
    }

    pub fn mode(mut self, mode: ExecMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = dir.into();
        self
    }

    pub fn env(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.env.insert(k.into(), v.into());
        self
    }

    pub fn log_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.log_prefix = Some(prefix.into());
        self
    }

    pub fn kill_signal(mut self, signal: KillSignal) -> Self {
        self.kill_signal = signal;
        self
    }

    pub fn max_runtime(mut self, d: Duration) -> Self {
        self.max_runtime = Some(d);
        self
    }

    pub fn expected_exit_code(mut self, code: i32) -> Self {
        self.expected_exit_code = code;
        self
    }

    fn spec(&self) -> ExecSpec {
        ExecSpec {
            command: self.command.clone(),
            user: self.user.clone(),
            workdir: self.workdir.clone(),
            env: self.env.clone(),
        }
    }
}

#[derive(Debug)]
pub enum ExecOutcome {
    NotFound,
    /// The runtime refused the exec; the message says why.
    Failed(String),
    Detached,
    /// Foreground result; both streams carry the log prefix.
    Completed(Captured),
    /// Blocking stream, finished or stopped.
    Finished(Arc<StreamWatchdog>),
    Running(StreamHandle),
}

impl ExecOutcome {
    /// Detached and completed-with-0 runs, and finished streams whose
    /// watchdog stayed ok.
    pub fn success(&self) -> bool {
        match self {
            ExecOutcome::NotFound | ExecOutcome::Failed(_) => false,
            ExecOutcome::Detached | ExecOutcome::Running(_) => true,
            ExecOutcome::Completed(c) => c.exit_code == 0,
            ExecOutcome::Finished(wd) => wd.is_ok(),
        }
    }
}

/// A non-blocking stream: the supervisor thread plus its watchdog.
#[derive(Debug)]
pub struct StreamHandle {
    supervisor: Option<JoinHandle<()>>,
    watchdog: Arc<StreamWatchdog>,
}

impl StreamHandle {
    pub fn watchdog(&self) -> &Arc<StreamWatchdog> {
        &self.watchdog
    }

    pub fn is_finished(&self) -> bool {
        self.supervisor.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Request a stop, wait for the supervisor and report whether the
    /// stream ended ok. Fine to call after the stream already finished.
    pub fn stop(mut self) -> bool {
        self.join(true);
        self.watchdog.is_ok()
    }

    /// Wait for the stream to end on its own.
    pub fn wait(mut self) -> Arc<StreamWatchdog> {
        self.join(false);
        self.watchdog
    }

    fn join(&mut self, stop: bool) {
        let Some(h) = self.supervisor.take() else {
            return;
        };
        if stop && !h.is_finished() {
            self.watchdog.request_stop();
        }
        if h.join().is_err() {
            tracing::error!(command = %self.watchdog.command(), "stream supervisor panicked");
            self.watchdog.fail();
        }
    }
}

impl ContainerManager {
    /// Run a command in the named container. Never returns an error: a
    /// missing container or a runtime failure comes back as an outcome.
    pub fn exec_run(&self, container: &str, req: &ExecRequest) -> ExecOutcome {
        let found = match self.search(container, &Filters::new()) {
            Ok(found) => found,
            Err(e) => return ExecOutcome::Failed(e.to_string()),
        };
        let Some(info) = found else {
            tracing::error!(container, "container not found");
            return ExecOutcome::NotFound;
        };
        let prefix = req
            .log_prefix
            .clone()
            .unwrap_or_else(|| info.name.clone());
        tracing::info!(container, command = ?req.command, "running command");
        let spec = req.spec();

        match req.mode {
            ExecMode::Detach => match self.runtime().exec_detached(&info.id, &spec) {
                Ok(()) => ExecOutcome::Detached,
                Err(e) => ExecOutcome::Failed(e.to_string()),
            },
            ExecMode::Foreground => match self.runtime().exec_capture(&info.id, &spec) {
                Ok(c) => ExecOutcome::Completed(Captured {
                    exit_code: c.exit_code,
                    stdout: prefix_block(&prefix, &c.stdout),
                    stderr: prefix_block(&prefix, &c.stderr),
                }),
                Err(e) => ExecOutcome::Failed(e.to_string()),
            },
            ExecMode::Stream { block } => {
                match self.start_stream(&info.id, &info.name, &prefix, req, &spec) {
                    Ok(handle) if block => ExecOutcome::Finished(self.wait_blocking(handle)),
                    Ok(handle) => ExecOutcome::Running(handle),
                    Err(e) => {
                        tracing::error!(container, command = ?req.command, error = %e, "failed to start stream");
                        ExecOutcome::Failed(e.to_string())
                    }
                }
            }
        }
    }

    pub fn stop_running_stream(&self, handle: StreamHandle) -> bool {
        handle.stop()
    }

    fn wait_blocking(&self, handle: StreamHandle) -> Arc<StreamWatchdog> {
        let poll = self.timing().block_poll;
        while handle.watchdog.state() == WatchState::Running && !handle.is_finished() {
            std::thread::sleep(poll);
        }
        handle.wait()
    }

    fn start_stream(
        &self,
        container_id: &str,
        container_name: &str,
        prefix: &str,
        req: &ExecRequest,
        spec: &ExecSpec,
    ) -> Result<StreamHandle> {
        let rt = self.runtime().clone();
        let exec_id = rt.exec_create(container_id, spec)?;
        tracing::info!(
            container = container_name,
            command = ?req.command,
            user = %req.user,
            workdir = %req.workdir,
            "executing command"
        );
        let output = match rt.exec_start_stream(&exec_id) {
            Ok(output) => output,
            Err(e) => {
                rt.exec_release(&exec_id);
                return Err(e);
            }
        };

        let watchdog = Arc::new(StreamWatchdog::new(
            container_name,
            &req.command.join(" "),
            req.kill_signal,
            req.max_runtime,
            req.expected_exit_code,
        ));
        let timing = self.timing();

        let supervisor = {
            let watchdog = watchdog.clone();
            let container_id = container_id.to_string();
            let prefix = prefix.to_string();
            std::thread::spawn(move || {
                supervise(
                    rt.as_ref(),
                    &container_id,
                    &exec_id,
                    output,
                    &prefix,
                    &watchdog,
                    timing,
                );
            })
        };
        {
            let watchdog = watchdog.clone();
            std::thread::spawn(move || watchdog.watch(timing.poll));
        }

        Ok(StreamHandle {
            supervisor: Some(supervisor),
            watchdog,
        })
    }
}

fn forward_output(output: Box<dyn Read + Send>, prefix: String) {
    std::thread::spawn(move || {
        for_each_line(output, |line| {
            let line = sanitize_log_line(&line);
            if !line.is_empty() {
                println!("{}", prefix_line(&prefix, &line));
            }
        });
    });
}

fn supervise(
    rt: &dyn ContainerRuntime,
    container_id: &str,
    exec_id: &str,
    output: Box<dyn Read + Send>,
    prefix: &str,
    wd: &StreamWatchdog,
    timing: StreamTiming,
) {
    std::thread::sleep(timing.startup_grace);
    match rt.exec_inspect(exec_id) {
        Ok(info) => wd.record_process(info.pid, &info.entrypoint),
        Err(e) => {
            tracing::error!(container = %wd.container(), error = %e, "failed to inspect exec session");
            wd.fail();
            wd.mark_exited();
            rt.exec_release(exec_id);
            return;
        }
    }
    forward_output(output, prefix.to_string());

    let record = wd.process();
    let alive = || -> bool {
        let Ok(info) = rt.exec_inspect(exec_id) else {
            return false;
        };
        if !info.running {
            return false;
        }
        match rt.top(container_id) {
            Ok(table) => process_alive(&info, &record, &table),
            Err(e) => {
                tracing::warn!(container = %wd.container(), error = %e, "failed to read process table");
                false
            }
        }
    };

    let mut running = alive();
    while running && !wd.stop_requested() {
        std::thread::sleep(timing.poll);
        running = alive();
    }

    if running {
        if let Some(pid) = record.pid {
            tracing::info!(
                container = %wd.container(),
                process = %record.entrypoint,
                pid,
                signal = %wd.kill_signal(),
                "stopping process"
            );
            match rt.signal(pid, wd.kill_signal()) {
                Ok(()) => {
                    while alive() {
                        std::thread::sleep(timing.kill_poll);
                    }
                }
                // The process may keep running; waiting for it would never end.
                Err(e) => {
                    tracing::error!(pid, error = %e, "failed to signal process");
                    wd.fail();
                }
            }
        } else {
            tracing::warn!(process = %record.entrypoint, "no pid recorded, cannot signal");
        }
    }

    let mut code = None;
    for _ in 0..=EXIT_SETTLE_POLLS {
        match rt.exec_inspect(exec_id) {
            Ok(info) if !info.running => {
                code = info.exit_code;
                break;
            }
            Ok(_) => std::thread::sleep(timing.kill_poll),
            Err(e) => {
                tracing::error!(error = %e, "failed to read exit code");
                break;
            }
        }
    }
    wd.settle(code);
    rt.exec_release(exec_id);
    wd.mark_exited();
    tracing::debug!(
        container = %wd.container(),
        process = %record.entrypoint,
        exit_code = ?code,
        "stream supervisor done"
    );
}
