use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use super::{ExecInspect, ProcessEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillSignal(i32);

const SIGNAL_NAMES: &[(&str, i32)] = &[
    ("HUP", libc::SIGHUP),
    ("INT", libc::SIGINT),
    ("QUIT", libc::SIGQUIT),
    ("KILL", libc::SIGKILL),
    ("USR1", libc::SIGUSR1),
    ("USR2", libc::SIGUSR2),
    ("TERM", libc::SIGTERM),
];

impl KillSignal {
    pub const INTERRUPT: KillSignal = KillSignal(libc::SIGINT);
    pub const KILL: KillSignal = KillSignal(libc::SIGKILL);

    pub fn number(self) -> i32 {
        self.0
    }
}

impl Default for KillSignal {
    fn default() -> Self {
        Self::INTERRUPT
    }
}

impl FromStr for KillSignal {
    type Err = String;

    /// `SIGINT`, `int` and `2` all name the same signal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<i32>() {
            return if n > 0 {
                Ok(KillSignal(n))
            } else {
                Err(format!("invalid signal number {n}"))
            };
        }
        let upper = s.to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        SIGNAL_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, num)| KillSignal(*num))
            .ok_or_else(|| format!("unknown signal '{s}'"))
    }
}

impl fmt::Display for KillSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match SIGNAL_NAMES.iter().find(|(_, n)| *n == self.0) {
            Some((name, _)) => write!(f, "SIG{name}"),
            None => write!(f, "{}", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTiming {
    /// Wait between starting the exec and reading its PID.
    pub startup_grace: Duration,
    pub poll: Duration,
    pub kill_poll: Duration,
    pub block_poll: Duration,
}

impl Default for StreamTiming {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(1),
            poll: Duration::from_millis(500),
            kill_poll: Duration::from_secs(1),
            block_poll: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WatchState {
    Running = 0,
    StopRequested = 1,
    Exited = 2,
}

impl WatchState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WatchState::Running,
            1 => WatchState::StopRequested,
            _ => WatchState::Exited,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEnd {
    /// The supervised command was reported not ok.
    Failed,
    Stopped,
    Exited,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: Option<u32>,
    pub entrypoint: String,
}

/// Shared state of one streamed exec. The supervisor thread moves it to
/// `Exited`; a stop request (explicit or deadline) moves it to
/// `StopRequested`. Both transitions are single atomic stores.
#[derive(Debug)]
pub struct StreamWatchdog {
    state: AtomicU8,
    ok: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    expected_exit_code: i32,
    kill_signal: KillSignal,
    deadline: Option<Instant>,
    process: Mutex<ProcessRecord>,
    container: String,
    command: String,
}

impl StreamWatchdog {
    pub fn new(
        container: &str,
        command: &str,
        kill_signal: KillSignal,
        max_runtime: Option<Duration>,
        expected_exit_code: i32,
    ) -> Self {
        Self {
            state: AtomicU8::new(WatchState::Running as u8),
            ok: AtomicBool::new(true),
            exit_code: Mutex::new(None),
            expected_exit_code,
            kill_signal,
            deadline: max_runtime.map(|d| Instant::now() + d),
            process: Mutex::new(ProcessRecord::default()),
            container: container.to_string(),
            command: command.to_string(),
        }
    }

    pub fn state(&self) -> WatchState {
        WatchState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Running -> StopRequested. False if the stream already left `Running`.
    pub fn request_stop(&self) -> bool {
        self.state
            .compare_exchange(
                WatchState::Running as u8,
                WatchState::StopRequested as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub fn stop_requested(&self) -> bool {
        self.state() == WatchState::StopRequested
    }

    pub(crate) fn mark_exited(&self) {
        self.state.store(WatchState::Exited as u8, Ordering::SeqCst);
    }

    pub fn is_ok(&self) -> bool {
        self.ok.load(Ordering::SeqCst)
    }

    pub(crate) fn fail(&self) {
        self.ok.store(false, Ordering::SeqCst);
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.lock().map(|c| *c).unwrap_or(None)
    }

    pub fn expected_exit_code(&self) -> i32 {
        self.expected_exit_code
    }

    pub fn kill_signal(&self) -> KillSignal {
        self.kill_signal
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn process(&self) -> ProcessRecord {
        self.process.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub(crate) fn record_process(&self, pid: Option<u32>, entrypoint: &str) {
        if let Ok(mut p) = self.process.lock() {
            p.pid = pid;
            p.entrypoint = entrypoint.to_string();
        }
    }

    pub fn deadline_passed(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Store the final exit code; a mismatch with the expected code marks
    /// the stream not ok.
    pub(crate) fn settle(&self, code: Option<i32>) {
        if let Ok(mut c) = self.exit_code.lock() {
            *c = code;
        }
        if code != Some(self.expected_exit_code) {
            tracing::error!(
                container = %self.container,
                command = %self.command,
                expected = self.expected_exit_code,
                exit_code = ?code,
                "exit code did not match the expected exit code"
            );
            self.fail();
        } else {
            tracing::debug!(
                container = %self.container,
                command = %self.command,
                exit_code = ?code,
                "process exited"
            );
        }
    }

    /// One pass of the watch loop, checked in order: not ok, stop requested,
    /// exited, deadline. A passed deadline requests a stop and keeps watching.
    pub fn check(&self, now: Instant) -> Option<WatchEnd> {
        if !self.is_ok() {
            return Some(WatchEnd::Failed);
        }
        match self.state() {
            WatchState::StopRequested => return Some(WatchEnd::Stopped),
            WatchState::Exited => return Some(WatchEnd::Exited),
            WatchState::Running => {}
        }
        if self.deadline_passed(now) && self.request_stop() {
            tracing::info!(
                container = %self.container,
                command = %self.command,
                "max runtime reached, stopping"
            );
        }
        None
    }

    pub fn watch(&self, poll: Duration) -> WatchEnd {
        loop {
            if let Some(end) = self.check(Instant::now()) {
                if end == WatchEnd::Failed {
                    self.request_stop();
                }
                return end;
            }
            std::thread::sleep(poll);
        }
    }
}

/// The session must be running and the container's process table must hold
/// the recorded PID with a command line containing the recorded entrypoint.
/// A matching PID alone is not enough: PIDs get reused.
pub fn process_alive(inspect: &ExecInspect, record: &ProcessRecord, table: &[ProcessEntry]) -> bool {
    if !inspect.running {
        return false;
    }
    let Some(pid) = record.pid else {
        return false;
    };
    table
        .iter()
        .any(|p| p.pid == pid && p.command.contains(record.entrypoint.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> ExecInspect {
        ExecInspect {
            running: true,
            pid: Some(42),
            entrypoint: "retroarch".into(),
            exit_code: None,
        }
    }

    fn record() -> ProcessRecord {
        ProcessRecord {
            pid: Some(42),
            entrypoint: "retroarch".into(),
        }
    }

    #[test]
    fn liveness_rejects_reused_pid() {
        let table = vec![ProcessEntry {
            pid: 42,
            command: "/usr/bin/sshd -D".into(),
        }];
        assert!(!process_alive(&running(), &record(), &table));
    }

    #[test]
    fn liveness_needs_running_session_and_matching_entry() {
        let table = vec![ProcessEntry {
            pid: 42,
            command: "retroarch --verbose".into(),
        }];
        assert!(process_alive(&running(), &record(), &table));

        let mut stopped = running();
        stopped.running = false;
        assert!(!process_alive(&stopped, &record(), &table));
        assert!(!process_alive(&running(), &ProcessRecord::default(), &table));
        assert!(!process_alive(&running(), &record(), &[]));
    }

    #[test]
    fn stop_is_a_single_transition() {
        let wd = StreamWatchdog::new("c", "sleep 60", KillSignal::default(), None, 0);
        assert!(wd.request_stop());
        assert!(!wd.request_stop());
        wd.mark_exited();
        assert!(!wd.request_stop());
        assert_eq!(wd.state(), WatchState::Exited);
    }

    #[test]
    fn deadline_requests_stop_then_reports_stopped() {
        let wd = StreamWatchdog::new(
            "c",
            "sleep 60",
            KillSignal::default(),
            Some(Duration::ZERO),
            0,
        );
        assert_eq!(wd.check(Instant::now()), None);
        assert_eq!(wd.state(), WatchState::StopRequested);
        assert_eq!(wd.check(Instant::now()), Some(WatchEnd::Stopped));
    }

    #[test]
    fn not_ok_wins_over_everything() {
        let wd = StreamWatchdog::new("c", "x", KillSignal::default(), None, 0);
        wd.mark_exited();
        wd.settle(Some(3));
        assert!(!wd.is_ok());
        assert_eq!(wd.exit_code(), Some(3));
        assert_eq!(wd.watch(Duration::from_millis(1)), WatchEnd::Failed);
    }

    #[test]
    fn matching_exit_code_keeps_ok() {
        let wd = StreamWatchdog::new("c", "x", KillSignal::default(), None, 130);
        wd.settle(Some(130));
        wd.mark_exited();
        assert!(wd.is_ok());
        assert_eq!(wd.watch(Duration::from_millis(1)), WatchEnd::Exited);
    }

    #[test]
    fn signals_parse_by_name_or_number() {
        assert_eq!("SIGINT".parse::<KillSignal>(), Ok(KillSignal::INTERRUPT));
        assert_eq!("kill".parse::<KillSignal>(), Ok(KillSignal::KILL));
        assert_eq!("15".parse::<KillSignal>().map(|s| s.number()), Ok(15));
        assert!("SIGBOGUS".parse::<KillSignal>().is_err());
        assert!("0".parse::<KillSignal>().is_err());
        assert_eq!(KillSignal::INTERRUPT.to_string(), "SIGINT");
    }
}
