use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use crate::error::{Error, Result};

pub mod cli;
pub mod exec;
pub mod watchdog;

pub use exec::{ExecMode, ExecOutcome, ExecRequest, StreamHandle};
pub use watchdog::{KillSignal, StreamTiming, StreamWatchdog};

pub type Filters = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSpec {
    /// `image:tag`
    pub image: String,
    pub name: Option<String>,
    pub command: Vec<String>,
    pub detach: bool,
    pub tty: bool,
    pub init: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSpec {
    pub command: Vec<String>,
    pub user: String,
    pub workdir: String,
    pub env: BTreeMap<String, String>,
}

impl ExecSpec {
    /// Program name of the command; what a live process line must contain.
    pub fn entrypoint(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecInspect {
    pub running: bool,
    pub pid: Option<u32>,
    pub entrypoint: String,
    /// Only meaningful once `running` is false.
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub command: String,
}

/// What the lifecycle manager needs from a container engine. Containers are
/// addressed by id; exec sessions by the id `exec_create` hands out.
pub trait ContainerRuntime: Send + Sync {
    /// Every container, running or stopped, narrowed by `filters`.
    fn list(&self, filters: &Filters) -> Result<Vec<ContainerInfo>>;
    fn image_exists(&self, image: &str) -> Result<bool>;
    /// Create and start a container; returns its id.
    fn run(&self, spec: &RunSpec) -> Result<String>;
    fn stop(&self, id: &str) -> Result<()>;
    fn kill(&self, id: &str) -> Result<()>;
    fn remove(&self, id: &str) -> Result<()>;

    fn exec_capture(&self, id: &str, spec: &ExecSpec) -> Result<Captured>;
    fn exec_detached(&self, id: &str, spec: &ExecSpec) -> Result<()>;
    fn exec_create(&self, id: &str, spec: &ExecSpec) -> Result<String>;
    fn exec_start_stream(&self, exec_id: &str) -> Result<Box<dyn Read + Send>>;
    fn exec_inspect(&self, exec_id: &str) -> Result<ExecInspect>;
    /// Forget a session once its supervisor is done with it.
    fn exec_release(&self, _exec_id: &str) {}

    /// Live process table of a container.
    fn top(&self, id: &str) -> Result<Vec<ProcessEntry>>;
    /// Deliver `signal` to `pid`. PIDs are the ones `top` reports.
    fn signal(&self, pid: u32, signal: KillSignal) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub container_name: Option<String>,
    pub command: Vec<String>,
    /// Replace a container already holding the name instead of failing.
    pub remove_if_in_use: bool,
    /// Kill rather than stop the container being replaced.
    pub kill: bool,
    pub tty: bool,
    pub init: bool,
    pub detach: bool,
}

/// Container lifecycle on top of a runtime. Handles are looked up by name on
/// every call and never cached.
#[derive(Clone)]
pub struct ContainerManager {
    rt: Arc<dyn ContainerRuntime>,
    timing: StreamTiming,
}

impl ContainerManager {
    pub fn new(rt: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            rt,
            timing: StreamTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: StreamTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.rt
    }

    pub fn timing(&self) -> StreamTiming {
        self.timing
    }

    pub fn search(&self, name: &str, filters: &Filters) -> Result<Option<ContainerInfo>> {
        Ok(self.rt.list(filters)?.into_iter().find(|c| c.name == name))
    }

    pub fn start(&self, image: &str, tag: &str, opts: &StartOptions) -> Result<String> {
        let image_ref = format!("{image}:{tag}");
        if !self.rt.image_exists(&image_ref)? {
            return Err(Error::container(format!("image {image_ref} not found")));
        }
        if let Some(name) = opts.container_name.as_deref()
            && self.search(name, &Filters::new())?.is_some()
        {
            if !opts.remove_if_in_use {
                return Err(Error::container(format!(
                    "container name {name} is already in use (image {image_ref}) and remove_if_in_use is not set"
                )));
            }
            self.search_and_remove(name, opts.kill)?;
        }
        let spec = RunSpec {
            image: image_ref.clone(),
            name: opts.container_name.clone(),
            command: opts.command.clone(),
            detach: opts.detach,
            tty: opts.tty,
            init: opts.init,
        };
        let id = self
            .rt
            .run(&spec)
            .map_err(|e| e.context(format!("failed to start {image_ref}")))?;
        tracing::info!(image = %image_ref, container = ?opts.container_name, id = %id, "container started");
        Ok(id)
    }

    /// Stop a container if it exists, optionally removing it. False when no
    /// container has that name.
    pub fn stop(&self, name: &str, remove: bool) -> Result<bool> {
        let Some(c) = self.search(name, &Filters::new())? else {
            return Ok(false);
        };
        self.rt.stop(&c.id)?;
        if remove {
            self.rt.remove(&c.id)?;
        }
        Ok(true)
    }

    pub fn search_and_remove(&self, name: &str, kill: bool) -> Result<bool> {
        let Some(c) = self.search(name, &Filters::new())? else {
            return Ok(false);
        };
        if kill {
            tracing::info!(container = %c.name, "killing and removing container");
            self.rt.kill(&c.id)?;
        } else {
            tracing::info!(container = %c.name, "stopping and removing container");
            self.rt.stop(&c.id)?;
        }
        self.rt.remove(&c.id)?;
        Ok(true)
    }

    /// `killall`, then `pkill`, inside the container. False when the
    /// container is missing or both fail.
    pub fn kill_process(&self, name: &str, process: &str, level: u32) -> Result<bool> {
        let Some(c) = self.search(name, &Filters::new())? else {
            return Ok(false);
        };
        for tool in ["killall", "pkill"] {
            let spec = ExecSpec {
                command: vec![tool.into(), format!("-{level}"), process.into()],
                user: "root".into(),
                workdir: "/".into(),
                env: BTreeMap::new(),
            };
            if self.rt.exec_capture(&c.id, &spec)?.exit_code == 0 {
                return Ok(true);
            }
        }
        tracing::warn!(container = %name, process, "failed to kill process");
        Ok(false)
    }

    /// Stop and remove every container matching `filters`; returns their names.
    pub fn safe_prune(&self, filters: &Filters) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for c in self.rt.list(filters)? {
            self.rt.stop(&c.id)?;
            self.rt.remove(&c.id)?;
            removed.push(c.name);
        }
        Ok(removed)
    }
}

pub fn parse_filters<I, S>(raw: I) -> Result<Filters>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = Filters::new();
    for item in raw {
        let item = item.as_ref();
        let Some((k, v)) = item.split_once('=') else {
            return Err(Error::config(format!("filter '{item}' must be key=value")));
        };
        out.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok(out)
}


#[cfg(test)]
mod tests {
    use super::fake::FakeRuntime;
    use super::*;

    fn manager(rt: FakeRuntime) -> (ContainerManager, Arc<FakeRuntime>) {
        let rt = Arc::new(rt);
        (ContainerManager::new(rt.clone()), rt)
    }

    #[test]
    fn search_matches_exact_names_only() {
        let rt = FakeRuntime::with_container("retroroot-build");
        rt.add_container("retroroot", "exited");
        let (mgr, _) = manager(rt);
        let found = mgr.search("retroroot", &Filters::new()).expect("search");
        assert_eq!(found.map(|c| c.id), Some("id-retroroot".to_string()));
        assert!(mgr.search("retro", &Filters::new()).expect("search").is_none());
    }

    #[test]
    fn start_requires_the_image() {
        let (mgr, _) = manager(FakeRuntime::default());
        let err = mgr
            .start("retroroot", "latest", &StartOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Container);
        assert!(err.to_string().contains("retroroot:latest"), "{err}");
    }

    #[test]
    fn start_refuses_a_name_in_use_unless_asked_to_replace() {
        let rt = FakeRuntime::with_container("builder");
        rt.images.lock().expect("lock").push("retroroot:latest".into());
        let (mgr, rt) = manager(rt);
        let mut opts = StartOptions {
            container_name: Some("builder".into()),
            ..StartOptions::default()
        };
        let err = mgr.start("retroroot", "latest", &opts).unwrap_err();
        assert!(err.to_string().contains("already in use"), "{err}");

        opts.remove_if_in_use = true;
        opts.kill = true;
        let id = mgr.start("retroroot", "latest", &opts).expect("start");
        assert_eq!(id, "id-builder");
        assert_eq!(
            rt.calls(),
            vec!["kill id-builder", "rm id-builder", "run retroroot:latest"]
        );
    }

    #[test]
    fn kill_process_falls_back_to_pkill() {
        let rt = FakeRuntime::with_container("c");
        rt.capture_codes.lock().expect("lock").insert("killall".into(), 1);
        let (mgr, rt) = manager(rt);
        assert!(mgr.kill_process("c", "emulationstation", 9).expect("kill"));
        assert_eq!(
            rt.calls(),
            vec![
                "exec id-c killall -9 emulationstation",
                "exec id-c pkill -9 emulationstation"
            ]
        );
        assert!(!mgr.kill_process("missing", "x", 9).expect("kill"));
    }

    #[test]
    fn safe_prune_reports_removed_names() {
        let rt = FakeRuntime::with_container("retro-a");
        rt.add_container("retro-b", "exited");
        rt.add_container("other", "running");
        let (mgr, _) = manager(rt);
        let filters = parse_filters(["name=retro"]).expect("filters");
        assert_eq!(
            mgr.safe_prune(&filters).expect("prune"),
            vec!["retro-a", "retro-b"]
        );
        assert!(mgr.search("other", &Filters::new()).expect("search").is_some());
    }

    #[test]
    fn filters_need_key_value_pairs() {
        assert!(parse_filters(["status"]).unwrap_err().is_config());
    }
}
