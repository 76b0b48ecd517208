use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use retroroot::container::cli::CliRuntime;
use retroroot::container::{
    ContainerManager, ExecMode, ExecOutcome, ExecRequest, KillSignal, StartOptions, parse_filters,
};
use retroroot::executor::{CommandRunner, CommandSpec, ExecCtx, StdoutSink, SystemRunner};
use retroroot::logging::LogFormat;
use retroroot::options::{RunOptions, parse_flag, split_manifest_list};
use retroroot::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about, args_conflicts_with_subcommands = true)]
struct Args {
    #[arg(long, global = true, value_enum, env = "RETROROOT_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    /// Use `make` instead of `brmake` and log at debug level
    #[arg(long, global = true, env = "VERBOSE", action = ArgAction::Set, value_parser = parse_flag, default_value = "false", num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    verbose: bool,
    #[command(flatten)]
    build: BuildArgs,
    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build every target of the manifests (the default)
    Build(BuildArgs),
    /// Load and resolve the manifests and print the steps a build would run
    Plan {
        #[command(flatten)]
        build: BuildArgs,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage the build containers
    Container {
        /// docker or podman; detected when unset
        #[arg(long, env = "RETROROOT_CONTAINER_ENGINE")]
        engine: Option<String>,
        #[command(subcommand)]
        cmd: ContainerCmd,
    },
    /// Build the build-environment image with compose
    ImageBuild {
        #[arg(long, default_value = "docker/docker-compose.yml")]
        compose_file: PathBuf,
        #[arg(long, default_value = "docker-compose")]
        compose: String,
    },
}

#[derive(Debug, Clone, ClapArgs)]
struct BuildArgs {
    /// Colon separated manifest paths
    #[arg(long, env = "CONFIGS", default_value = "env.json")]
    configs: String,
    /// Re-apply defconfigs even when the build dir exists
    #[arg(long, env = "APPLY_CONFIGS", action = ArgAction::Set, value_parser = parse_flag, default_value = "false", num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    apply_configs: bool,
    #[arg(long, env = "NO_BUILD", action = ArgAction::Set, value_parser = parse_flag, default_value = "false", num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    no_build: bool,
    #[arg(long, env = "CLEAN_AFTER_BUILD", action = ArgAction::Set, value_parser = parse_flag, default_value = "false", num_args = 0..=1, require_equals = true, default_missing_value = "true")]
    clean_after_build: bool,
    /// Build only this target (defconfig name, suffix optional)
    #[arg(long, env = "BUILD_TARGET")]
    target: Option<String>,
    /// Restrict a per-package build to one package
    #[arg(long, env = "BUILD_PACKAGE")]
    package: Option<String>,
    #[arg(long, env = "BUILDROOT_ROOT")]
    buildroot_root: Option<PathBuf>,
    #[arg(long, env = "RETROROOT_HOME_BASE", default_value = "/home")]
    home_base: PathBuf,
    /// Log commands instead of running them
    #[arg(long)]
    dry_run: bool,
}

impl BuildArgs {
    fn options(&self, verbose: bool) -> RunOptions {
        RunOptions {
            manifests: split_manifest_list(&self.configs),
            apply_configs: self.apply_configs,
            no_build: self.no_build,
            clean_after_build: self.clean_after_build,
            target: self.target.clone(),
            verbose,
            package: self.package.clone(),
            buildroot_root: self.buildroot_root.clone(),
            home_base: self.home_base.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum ContainerCmd {
    Start {
        image: String,
        #[arg(long, default_value = "latest")]
        tag: String,
        #[arg(long)]
        name: Option<String>,
        /// Replace a container already using the name
        #[arg(long)]
        replace: bool,
        /// Kill (rather than stop) the container being replaced
        #[arg(long)]
        kill: bool,
        #[arg(long)]
        tty: bool,
        #[arg(long)]
        init: bool,
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },
    Stop {
        name: String,
        #[arg(long)]
        remove: bool,
    },
    Remove {
        name: String,
        #[arg(long)]
        kill: bool,
    },
    Exec {
        name: String,
        #[arg(long, default_value = "root")]
        user: String,
        #[arg(long, default_value = "/")]
        workdir: String,
        /// KEY=VALUE, repeatable
        #[arg(long = "env")]
        env: Vec<String>,
        #[arg(long, conflicts_with = "stream")]
        detach: bool,
        /// Stream output and supervise the process
        #[arg(long)]
        stream: bool,
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long, default_value = "SIGINT")]
        signal: KillSignal,
        /// Seconds before the streamed process is stopped
        #[arg(long)]
        max_runtime: Option<u64>,
        #[arg(long, default_value_t = 0)]
        expect: i32,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    KillProcess {
        name: String,
        process: String,
        #[arg(long, default_value_t = 9)]
        level: u32,
    },
    /// Stop and remove every container matching the filters
    Prune {
        /// KEY=VALUE, repeatable
        #[arg(long = "filter")]
        filters: Vec<String>,
    },
}

fn main() -> ExitCode {
    let _ = dotenv::dotenv();
    let args = Args::parse();
    if let Err(e) = retroroot::logging::init(args.log_format, args.verbose) {
        eprintln!("{e}");
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_interrupted() => {
            eprintln!("Interrupted, exiting.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}

fn run(args: Args) -> Result<()> {
    let cancel = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, cancel.clone())
        .map_err(|e| Error::msg(format!("failed to install SIGINT handler: {e}")))?;

    match args.cmd {
        None => cmd_build(&args.build, args.verbose, cancel),
        Some(Command::Build(b)) => cmd_build(&b, args.verbose, cancel),
        Some(Command::Plan { build, json }) => cmd_plan(&build, args.verbose, json),
        Some(Command::Container { engine, cmd }) => {
            let rt = CliRuntime::detect(engine.as_deref())?;
            let mgr = ContainerManager::new(Arc::new(rt));
            cmd_container(&mgr, cmd, &cancel)
        }
        Some(Command::ImageBuild {
            compose_file,
            compose,
        }) => cmd_image_build(&compose, &compose_file, cancel),
    }
}

fn cmd_build(b: &BuildArgs, verbose: bool, cancel: Arc<AtomicBool>) -> Result<()> {
    let opts = b.options(verbose);
    let plan = retroroot::orchestrator::plan(&opts)?;

    let sink = Arc::new(StdoutSink::default());
    let mut ctx = ExecCtx::new(b.dry_run, sink);
    ctx.cancel = cancel;
    let report = retroroot::orchestrator::execute(&plan, &opts, &SystemRunner, &mut ctx)?;
    tracing::info!(
        built = report.built.len(),
        skipped = report.skipped.len(),
        "run finished"
    );

    if let Some(root) = report.shell_roots.first()
        && !b.dry_run
    {
        hand_off_shell(root)?;
    }
    Ok(())
}

fn cmd_plan(b: &BuildArgs, verbose: bool, json: bool) -> Result<()> {
    let opts = b.options(verbose);
    let plan = retroroot::orchestrator::plan(&opts)?;
    let outline = retroroot::orchestrator::outline(&plan, &opts);

    if json {
        println!("{}", serde_json::to_string_pretty(&outline)?);
        return Ok(());
    }

    let mut n = 0usize;
    for m in &outline {
        println!("{} ({})", m.manifest.display(), m.buildroot_root.display());
        if m.update {
            println!("    update {}", m.buildroot_root.display());
        }
        for t in &m.targets {
            n += 1;
            let steps = t
                .steps
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            println!("{n:>4}. {:<28} {steps}", t.id);
        }
    }
    Ok(())
}

fn hand_off_shell(root: &Path) -> Result<()> {
    let shell = std::env::var("SHELL")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "/bin/sh".into());
    println!("Entering {shell} in {}", root.display());
    let status = std::process::Command::new(&shell)
        .current_dir(root)
        .status()
        .map_err(|e| Error::tool(None, format!("failed to start {shell}: {e}")))?;
    if !status.success() {
        tracing::debug!(code = ?status.code(), "shell exited");
    }
    Ok(())
}

fn cmd_image_build(compose: &str, file: &Path, cancel: Arc<AtomicBool>) -> Result<()> {
    let sink = Arc::new(StdoutSink::default());
    let mut ctx = ExecCtx::new(false, sink);
    ctx.cancel = cancel;
    ctx.set_target("image-build");
    tracing::info!(compose_file = %file.display(), "building the build-environment image");
    let cwd = std::env::current_dir()?;
    let spec = CommandSpec::new(compose, &cwd).args([
        "-f".to_string(),
        file.display().to_string(),
        "build".to_string(),
    ]);
    let out = SystemRunner.run(&spec, &ctx)?;
    if !out.success() {
        return Err(Error::tool(out.code, format!("{spec} failed")));
    }
    Ok(())
}

fn cmd_container(mgr: &ContainerManager, cmd: ContainerCmd, cancel: &AtomicBool) -> Result<()> {
    match cmd {
        ContainerCmd::Start {
            image,
            tag,
            name,
            replace,
            kill,
            tty,
            init,
            command,
        } => {
            let opts = StartOptions {
                container_name: name,
                command,
                remove_if_in_use: replace,
                kill,
                tty,
                init,
                detach: true,
            };
            let id = mgr.start(&image, &tag, &opts)?;
            println!("{id}");
            Ok(())
        }
        ContainerCmd::Stop { name, remove } => {
            if !mgr.stop(&name, remove)? {
                return Err(Error::container(format!("container {name} not found")));
            }
            Ok(())
        }
        ContainerCmd::Remove { name, kill } => {
            if !mgr.search_and_remove(&name, kill)? {
                tracing::info!(container = %name, "nothing to remove");
            }
            Ok(())
        }
        ContainerCmd::KillProcess {
            name,
            process,
            level,
        } => {
            if !mgr.kill_process(&name, &process, level)? {
                return Err(Error::container(format!(
                    "failed to kill {process} in {name}"
                )));
            }
            Ok(())
        }
        ContainerCmd::Prune { filters } => {
            let filters = parse_filters(&filters)?;
            for name in mgr.safe_prune(&filters)? {
                println!("{name}");
            }
            Ok(())
        }
        ContainerCmd::Exec {
            name,
            user,
            workdir,
            env,
            detach,
            stream,
            prefix,
            signal,
            max_runtime,
            expect,
            command,
        } => {
            let mode = if stream {
                ExecMode::Stream { block: false }
            } else if detach {
                ExecMode::Detach
            } else {
                ExecMode::Foreground
            };
            let mut req = ExecRequest::new(command)
                .mode(mode)
                .user(user)
                .workdir(workdir)
                .kill_signal(signal)
                .expected_exit_code(expect);
            for (k, v) in parse_filters(&env)? {
                req = req.env(k, v);
            }
            if let Some(p) = prefix {
                req = req.log_prefix(p);
            }
            if let Some(secs) = max_runtime {
                req = req.max_runtime(Duration::from_secs(secs));
            }
            exec_outcome(mgr, &name, mgr.exec_run(&name, &req), cancel)
        }
    }
}

fn exec_outcome(
    mgr: &ContainerManager,
    name: &str,
    outcome: ExecOutcome,
    cancel: &AtomicBool,
) -> Result<()> {
    match outcome {
        ExecOutcome::NotFound => Err(Error::container(format!("container {name} not found"))),
        ExecOutcome::Failed(msg) => Err(Error::container(msg)),
        ExecOutcome::Detached => Ok(()),
        ExecOutcome::Completed(c) => {
            if !c.stdout.is_empty() {
                println!("{}", c.stdout);
            }
            if !c.stderr.is_empty() {
                eprintln!("{}", c.stderr);
            }
            if c.exit_code != 0 {
                return Err(Error::tool(
                    Some(c.exit_code),
                    format!("command exited with {}", c.exit_code),
                ));
            }
            Ok(())
        }
        ExecOutcome::Finished(wd) => stream_result(wd.is_ok(), wd.exit_code()),
        ExecOutcome::Running(handle) => {
            let poll = mgr.timing().block_poll;
            while !handle.is_finished() {
                if cancel.load(Ordering::Relaxed) {
                    let wd = handle.watchdog().clone();
                    let ok = mgr.stop_running_stream(handle);
                    return stream_result(ok, wd.exit_code());
                }
                std::thread::sleep(poll);
            }
            let wd = handle.wait();
            stream_result(wd.is_ok(), wd.exit_code())
        }
    }
}

fn stream_result(ok: bool, code: Option<i32>) -> Result<()> {
    if ok {
        return Ok(());
    }
    Err(Error::tool(
        code,
        format!(
            "streamed command ended with exit code {}",
            code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".into())
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn bare_switches_read_as_true() {
        let a = Args::try_parse_from([
            "retroroot",
            "build",
            "--no-build",
            "--apply-configs=false",
            "--target",
            "pi4",
            "--configs",
            "a.json:b.toml",
        ])
        .expect("parse");
        let Some(Command::Build(b)) = a.cmd else {
            panic!("expected the build subcommand");
        };
        assert!(b.no_build);
        assert!(!b.apply_configs);
        let opts = b.options(true);
        assert_eq!(opts.target(), Some("pi4"));
        assert_eq!(opts.manifests.len(), 2);
        assert!(opts.verbose);
    }

    #[test]
    fn plan_takes_the_build_flags() {
        let a = Args::try_parse_from(["retroroot", "plan", "--json", "--no-build"]).expect("parse");
        let Some(Command::Plan { build, json }) = a.cmd else {
            panic!("expected the plan subcommand");
        };
        assert!(json);
        assert!(build.no_build);
        assert_eq!(build.configs, "env.json");
    }

    #[test]
    fn exec_takes_a_trailing_command() {
        let a = Args::try_parse_from([
            "retroroot",
            "container",
            "--engine",
            "podman",
            "exec",
            "retro",
            "--stream",
            "--signal",
            "TERM",
            "retroarch",
            "-v",
        ])
        .expect("parse");
        let Some(Command::Container {
            cmd: ContainerCmd::Exec {
                command, signal, stream, ..
            },
            ..
        }) = a.cmd
        else {
            panic!("expected container exec");
        };
        assert!(stream);
        assert_eq!(signal.to_string(), "SIGTERM");
        assert_eq!(command, vec!["retroarch", "-v"]);
    }
}
