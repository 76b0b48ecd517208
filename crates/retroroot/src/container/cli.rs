use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use regex::Regex;

use super::{
    Captured, ContainerInfo, ContainerRuntime, ExecInspect, ExecSpec, Filters, KillSignal,
    ProcessEntry, RunSpec,
};
use crate::error::{Error, Result};
use crate::log_sanitize::{for_each_line, sanitize_log_line};

const PS_FORMAT: &str = "{{.ID}}\t{{.Names}}\t{{.Image}}\t{{.State}}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Docker,
    Podman,
}

struct ExecSession {
    container: String,
    spec: ExecSpec,
    child: Option<Child>,
    // PIDs already in the container before the exec started.
    baseline: BTreeSet<u32>,
    pid: Option<u32>,
    exit_code: Option<i32>,
}

/// Container runtime over the `docker` or `podman` command-line client.
///
/// The CLI has no exec-session API, so sessions live here: the exec client
/// is a child process, and the PID is the new process-table entry running
/// the session's entrypoint.
pub struct CliRuntime {
    engine: String,
    flavor: Flavor,
    sessions: Mutex<BTreeMap<String, ExecSession>>,
    next_id: AtomicU64,
}

impl CliRuntime {
    pub fn new(engine: impl Into<String>) -> Self {
        let engine = engine.into();
        let flavor = if engine.contains("podman") {
            Flavor::Podman
        } else {
            Flavor::Docker
        };
        Self {
            engine,
            flavor,
            sessions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Use `preference` when given, else the first of docker/podman that
    /// answers `--version`.
    pub fn detect(preference: Option<&str>) -> Result<Self> {
        if let Some(pref) = preference {
            let pref = pref.trim();
            if pref.is_empty() {
                return Err(Error::config("container engine override is set but empty"));
            }
            if command_works(pref, &["--version"]) {
                return Ok(Self::new(pref));
            }
            return Err(Error::container(format!(
                "container engine '{pref}' is not available"
            )));
        }
        for candidate in ["docker", "podman"] {
            if command_works(candidate, &["--version"]) {
                return Ok(Self::new(candidate));
            }
        }
        Err(Error::container(
            "no container engine found (tried docker, podman); set RETROROOT_CONTAINER_ENGINE",
        ))
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.engine);
        cmd.stdin(Stdio::null());
        cmd
    }

    fn output(&self, args: &[String]) -> Result<String> {
        let out = self
            .command()
            .args(args)
            .output()
            .map_err(|e| Error::container(format!("failed to run {}: {e}", self.engine)))?;
        if !out.status.success() {
            return Err(Error::container(format!(
                "{} {} failed: {}",
                self.engine,
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn exec_args(&self, id: &str, spec: &ExecSpec, extra: &[&str]) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        args.extend(extra.iter().map(|s| s.to_string()));
        if !spec.user.is_empty() {
            args.push("-u".into());
            args.push(spec.user.clone());
        }
        if !spec.workdir.is_empty() {
            args.push("-w".into());
            args.push(spec.workdir.clone());
        }
        for (k, v) in &spec.env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        args.push(id.to_string());
        args.extend(spec.command.iter().cloned());
        args
    }

    fn top_args(&self, id: &str) -> Vec<String> {
        match self.flavor {
            Flavor::Docker => vec!["top".into(), id.into(), "-eo".into(), "pid,args".into()],
            // Host PIDs, same namespace docker reports and `signal` targets.
            Flavor::Podman => vec!["top".into(), id.into(), "hpid".into(), "args".into()],
        }
    }

    fn sessions(&self) -> Result<MutexGuard<'_, BTreeMap<String, ExecSession>>> {
        self.sessions
            .lock()
            .map_err(|_| Error::container("exec session table poisoned"))
    }

    // Lowest new PID running the entrypoint; called without the session lock.
    fn discover_pid(&self, container: &str, baseline: &BTreeSet<u32>, entrypoint: &str) -> Option<u32> {
        let table = self.top(container).ok()?;
        table
            .iter()
            .filter(|p| !baseline.contains(&p.pid))
            .filter(|p| p.command.contains(entrypoint))
            .map(|p| p.pid)
            .min()
    }
}

impl ContainerRuntime for CliRuntime {
    fn list(&self, filters: &Filters) -> Result<Vec<ContainerInfo>> {
        let mut args = vec![
            "ps".to_string(),
            "-a".into(),
            "--no-trunc".into(),
            "--format".into(),
            PS_FORMAT.into(),
        ];
        for (k, v) in filters {
            args.push("--filter".into());
            args.push(format!("{k}={v}"));
        }
        Ok(parse_ps(&self.output(&args)?))
    }

    fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self
            .command()
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false))
    }

    fn run(&self, spec: &RunSpec) -> Result<String> {
        let mut args = vec!["run".to_string()];
        if spec.detach {
            args.push("-d".into());
        }
        if spec.tty {
            args.push("-t".into());
        }
        if spec.init {
            args.push("--init".into());
        }
        if let Some(name) = &spec.name {
            args.push("--name".into());
            args.push(name.clone());
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        let out = self.output(&args)?;
        if spec.detach {
            return Ok(out.trim().to_string());
        }
        Ok(spec.name.clone().unwrap_or_default())
    }

    fn stop(&self, id: &str) -> Result<()> {
        self.output(&["stop".into(), id.into()]).map(|_| ())
    }

    fn kill(&self, id: &str) -> Result<()> {
        self.output(&["kill".into(), id.into()]).map(|_| ())
    }

    fn remove(&self, id: &str) -> Result<()> {
        self.output(&["rm".into(), id.into()]).map(|_| ())
    }

    fn exec_capture(&self, id: &str, spec: &ExecSpec) -> Result<Captured> {
        let args = self.exec_args(id, spec, &[]);
        let out = self
            .command()
            .args(&args)
            .output()
            .map_err(|e| Error::container(format!("failed to run {}: {e}", self.engine)))?;
        Ok(Captured {
            exit_code: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }

    fn exec_detached(&self, id: &str, spec: &ExecSpec) -> Result<()> {
        let args = self.exec_args(id, spec, &["-d"]);
        self.output(&args).map(|_| ())
    }

    fn exec_create(&self, id: &str, spec: &ExecSpec) -> Result<String> {
        if spec.command.is_empty() {
            return Err(Error::container("exec needs a command"));
        }
        let exec_id = format!("exec-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut sessions = self.sessions()?;
        sessions.insert(
            exec_id.clone(),
            ExecSession {
                container: id.to_string(),
                spec: spec.clone(),
                child: None,
                baseline: BTreeSet::new(),
                pid: None,
                exit_code: None,
            },
        );
        Ok(exec_id)
    }

    fn exec_start_stream(&self, exec_id: &str) -> Result<Box<dyn Read + Send>> {
        let (container, spec) = {
            let sessions = self.sessions()?;
            let s = sessions
                .get(exec_id)
                .ok_or_else(|| Error::container(format!("unknown exec session {exec_id}")))?;
            (s.container.clone(), s.spec.clone())
        };
        let baseline = self.top(&container)?.into_iter().map(|p| p.pid).collect();

        let args = self.exec_args(&container, &spec, &["-t"]);
        let mut child = self
            .command()
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::container(format!("failed to run {}: {e}", self.engine)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::container("exec stdout was not captured"))?;
        if let Some(stderr) = child.stderr.take() {
            let engine = self.engine.clone();
            std::thread::spawn(move || {
                for_each_line(stderr, |line| {
                    tracing::warn!(engine = %engine, "{}", sanitize_log_line(&line));
                })
            });
        }

        let mut sessions = self.sessions()?;
        if let Some(s) = sessions.get_mut(exec_id) {
            s.baseline = baseline;
            s.child = Some(child);
        }
        Ok(Box::new(stdout))
    }

    fn exec_inspect(&self, exec_id: &str) -> Result<ExecInspect> {
        let (mut info, lookup) = {
            let mut sessions = self.sessions()?;
            let s = sessions
                .get_mut(exec_id)
                .ok_or_else(|| Error::container(format!("unknown exec session {exec_id}")))?;

            let running = match s.child.as_mut() {
                Some(child) => match child
                    .try_wait()
                    .map_err(|e| Error::container(format!("exec {exec_id}: {e}")))?
                {
                    Some(status) => {
                        s.exit_code = status.code();
                        false
                    }
                    None => true,
                },
                None => false,
            };
            let info = ExecInspect {
                running,
                pid: s.pid,
                entrypoint: s.spec.entrypoint().to_string(),
                exit_code: s.exit_code,
            };
            let lookup = (running && s.pid.is_none())
                .then(|| (s.container.clone(), s.baseline.clone()));
            (info, lookup)
        };

        if let Some((container, baseline)) = lookup
            && let Some(pid) = self.discover_pid(&container, &baseline, &info.entrypoint)
        {
            if let Some(s) = self.sessions()?.get_mut(exec_id) {
                s.pid = Some(pid);
            }
            info.pid = Some(pid);
        }
        Ok(info)
    }

    fn exec_release(&self, exec_id: &str) {
        if let Ok(mut sessions) = self.sessions() {
            sessions.remove(exec_id);
        }
    }

    fn top(&self, id: &str) -> Result<Vec<ProcessEntry>> {
        Ok(parse_top(&self.output(&self.top_args(id))?))
    }

    // Host-side kill: only reaches the process when the container shares
    // the host PID namespace view that `top` reports.
    fn signal(&self, pid: u32, signal: KillSignal) -> Result<()> {
        let pid = i32::try_from(pid)
            .map_err(|_| Error::container(format!("pid {pid} out of range")))?;
        let rc = unsafe { libc::kill(pid, signal.number()) };
        if rc != 0 {
            return Err(Error::container(format!(
                "failed to send {signal} to pid {pid}: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

fn command_works(bin: &str, args: &[&str]) -> bool {
    Command::new(bin)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn parse_ps(out: &str) -> Vec<ContainerInfo> {
    out.lines()
        .filter_map(|line| {
            let mut parts = line.trim_end().split('\t');
            let id = parts.next()?.trim();
            let name = parts.next()?.trim();
            let image = parts.next()?.trim();
            let state = parts.next()?.trim();
            if id.is_empty() || name.is_empty() {
                return None;
            }
            Some(ContainerInfo {
                id: id.into(),
                // `docker ps` lists linked names comma separated.
                name: name.split(',').next().unwrap_or(name).into(),
                image: image.into(),
                state: state.into(),
            })
        })
        .collect()
}

/// Parse `top` output; the header line and anything without a leading PID
/// is dropped.
pub fn parse_top(out: &str) -> Vec<ProcessEntry> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = RE
        .get_or_init(|| Regex::new(r"^\s*(\d+)\s+(.*?)\s*$").ok())
        .as_ref()
    else {
        return Vec::new();
    };
    out.lines()
        .filter_map(|line| {
            let caps = re.captures(line)?;
            Some(ProcessEntry {
                pid: caps.get(1)?.as_str().parse().ok()?,
                command: caps.get(2)?.as_str().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_output_skips_the_header() {
        let out = "PID                 COMMAND\n4021                retroarch -v --menu\n  4090  /bin/sh -c sleep 5 \n";
        assert_eq!(
            parse_top(out),
            vec![
                ProcessEntry {
                    pid: 4021,
                    command: "retroarch -v --menu".into()
                },
                ProcessEntry {
                    pid: 4090,
                    command: "/bin/sh -c sleep 5".into()
                },
            ]
        );
    }

    #[test]
    fn ps_output_is_tab_separated() {
        let out = "abc123\tretroroot\tretroroot:latest\trunning\nbad line\n\ndef456\tother,link\talpine:3\texited\n";
        let cs = parse_ps(out);
        assert_eq!(cs.len(), 2);
        assert_eq!(cs[0].name, "retroroot");
        assert!(cs[0].is_running());
        assert_eq!(cs[1].name, "other");
        assert!(!cs[1].is_running());
    }

    #[test]
    fn exec_args_carry_user_workdir_and_env() {
        let rt = CliRuntime::new("docker");
        let spec = ExecSpec {
            command: vec!["make".into(), "-j4".into()],
            user: "br-user".into(),
            workdir: "/home/br-user/buildroot".into(),
            env: BTreeMap::from([("VERBOSE".to_string(), "1".to_string())]),
        };
        assert_eq!(
            rt.exec_args("cid", &spec, &["-t"]).join(" "),
            "exec -t -u br-user -w /home/br-user/buildroot -e VERBOSE=1 cid make -j4"
        );
    }

    #[test]
    fn podman_reports_host_pids() {
        assert_eq!(
            CliRuntime::new("podman").top_args("c").join(" "),
            "top c hpid args"
        );
        assert_eq!(
            CliRuntime::new("docker").top_args("c").join(" "),
            "top c -eo pid,args"
        );
    }

    #[test]
    fn unknown_session_is_a_container_error() {
        let rt = CliRuntime::new("docker");
        let err = rt.exec_inspect("exec-99").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Container);
    }

    #[test]
    fn session_without_a_started_client_is_not_running() {
        let rt = CliRuntime::new("docker");
        let spec = ExecSpec {
            command: vec!["true".into()],
            ..ExecSpec::default()
        };
        let id = rt.exec_create("cid", &spec).expect("create");
        let info = rt.exec_inspect(&id).expect("inspect");
        assert!(!info.running);
        assert_eq!(info.entrypoint, "true");
        assert_eq!(info.pid, None);
    }

    #[test]
    fn released_sessions_are_forgotten() {
        let rt = CliRuntime::new("docker");
        let spec = ExecSpec {
            command: vec!["true".into()],
            ..ExecSpec::default()
        };
        let id = rt.exec_create("cid", &spec).expect("create");
        rt.exec_release(&id);
        assert!(rt.sessions().expect("sessions").is_empty());
        assert!(rt.exec_inspect(&id).is_err());
    }
}
