use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::defconfig;
use crate::error::{Error, Result};
use crate::executor::{CommandRunner, CommandSpec, DIAG_TAIL_LINES, ExecCtx};
use crate::log_sanitize::TailBuffer;
use crate::resolve::ResolvedConfig;

const PER_PACKAGE_KEY: &str = "BR2_PER_PACKAGE_DIRECTORIES";
const JLEVEL_KEY: &str = "BR2_JLEVEL";
const BRMAKE_LOG: &str = "br.log";
// Bundled sources are already in the download cache.
const LEGAL_INFO_SOURCE_DIRS: &[&str] = &["sources", "host-sources"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegalInfoOutcome {
    AlreadyPresent(PathBuf),
    Created(PathBuf),
}

/// Adapter over the build tool, git and tar. Every invocation carries its
/// working directory explicitly.
pub struct Buildroot<'a> {
    runner: &'a dyn CommandRunner,
    cpus: usize,
}

impl<'a> Buildroot<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            cpus: num_cpus::get().max(1),
        }
    }

    pub fn apply(&self, cfg: &ResolvedConfig, ctx: &ExecCtx) -> Result<()> {
        ensure_dl_dir(cfg, ctx)?;
        if !ctx.dry_run {
            fs::create_dir_all(&cfg.output_dir).map_err(|e| {
                Error::msg(format!(
                    "failed to create output dir {}: {e}",
                    cfg.output_dir.display()
                ))
            })?;
        }

        let spec = CommandSpec::new(cfg.tool.program(), &cfg.buildroot_root)
            .env("BR2_EXTERNAL", cfg.br2_external())
            .env("BR2_DL_DIR", cfg.dl_dir.display().to_string())
            .env("BR2_DEFCONFIG", cfg.defconfig_path.display().to_string())
            .arg(&cfg.defconfig)
            .arg(format!("O={}", cfg.build_path.display()));
        ctx.log(&format!("applying {}", cfg.defconfig_path.display()));
        let out = self.runner.run(&spec, ctx)?;
        if !out.success() {
            return Err(Error::tool(
                out.code,
                format!("failed to apply {}", cfg.defconfig_path.display()),
            ));
        }
        self.apply_fragments(cfg, ctx)
    }

    /// Append fragments verbatim to the generated `.config`, then let the
    /// build tool fill in options the fragments pulled in.
    pub fn apply_fragments(&self, cfg: &ResolvedConfig, ctx: &ExecCtx) -> Result<()> {
        if cfg.fragments.is_empty() {
            return Ok(());
        }
        if ctx.dry_run {
            for fragment in &cfg.fragments {
                ctx.log(&format!("DRY-RUN: append fragment {}", fragment.display()));
            }
        } else {
            let dot_config = cfg.dot_config();
            for fragment in &cfg.fragments {
                ctx.log(&format!("applying fragment {}", fragment.display()));
                append_fragment(&dot_config, fragment)?;
            }
        }
        self.olddefconfig(cfg, ctx)
    }

    pub fn olddefconfig(&self, cfg: &ResolvedConfig, ctx: &ExecCtx) -> Result<()> {
        let spec = CommandSpec::new(cfg.tool.program(), &cfg.build_path)
            .arg("olddefconfig")
            .quiet();
        let out = self.runner.run(&spec, ctx)?;
        if !out.success() {
            return Err(Error::tool(
                out.code,
                format!("olddefconfig failed in {}", cfg.build_path.display()),
            ));
        }
        Ok(())
    }

    pub fn clean(&self, cfg: &ResolvedConfig, ctx: &ExecCtx) -> Result<bool> {
        if !cfg.build_path.is_dir() {
            return Ok(false);
        }
        ctx.log(&format!("cleaning {}", cfg.defconfig));
        let spec = CommandSpec::new(cfg.tool.program(), &cfg.build_path).arg("clean");
        let out = self.runner.run(&spec, ctx)?;
        if !out.success() {
            return Err(Error::tool(
                out.code,
                format!("failed to clean {}", cfg.build_path.display()),
            ));
        }
        Ok(true)
    }

    pub fn remove(&self, cfg: &ResolvedConfig, ctx: &ExecCtx) -> Result<bool> {
        let path = &cfg.build_path;
        if fs::symlink_metadata(path).is_err() {
            return Ok(false);
        }
        ctx.log(&format!("removing directory {}", path.display()));
        if ctx.dry_run {
            return Ok(true);
        }
        remove_tree(path)?;
        Ok(true)
    }

    pub fn build(&self, cfg: &ResolvedConfig, package: Option<&str>, ctx: &ExecCtx) -> Result<()> {
        ensure_dl_dir(cfg, ctx)?;
        self.olddefconfig(cfg, ctx)?;

        let mut spec = CommandSpec::new(cfg.tool.program(), &cfg.build_path)
            .env("BR2_DL_DIR", cfg.dl_dir.display().to_string());

        let kcfg = if cfg.dot_config().is_file() {
            defconfig::parse_file(&cfg.dot_config(), &cfg.buildroot_root)?
        } else {
            Default::default()
        };
        if defconfig::is_enabled(&kcfg, PER_PACKAGE_KEY) {
            let jlevel = kcfg
                .get(JLEVEL_KEY)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            let jobs = per_package_jobs(self.cpus, jlevel);
            spec = spec.arg(format!("-j{jobs}"));
            if let Some(pkg) = package {
                spec = spec.arg(pkg);
            }
            ctx.log(&format!(
                "per-package build: {jobs} top-level job(s), {JLEVEL_KEY}={jlevel}"
            ));
        } else if let Some(pkg) = package {
            tracing::warn!(
                package = pkg,
                id = cfg.id.as_str(),
                "package scoping needs {PER_PACKAGE_KEY}=y; building everything"
            );
        }

        ctx.log(&format!("building {}", cfg.defconfig));
        let out = self.runner.run(&spec, ctx)?;
        if out.success() {
            return Ok(());
        }

        let log_path = cfg.build_path.join(BRMAKE_LOG);
        match tail_file(&log_path, DIAG_TAIL_LINES) {
            Some(lines) => ctx.diagnostics(&log_path.display().to_string(), lines),
            None => ctx.diagnostics(cfg.tool.program(), out.tail.clone()),
        }
        Err(Error::tool(out.code, format!("failed to build {}", cfg.id)))
    }

    pub fn legal_info_archive(&self, cfg: &ResolvedConfig) -> PathBuf {
        cfg.images_dir()
            .join(format!("{}-legal-info.tar.gz", cfg.display_name))
    }

    pub fn legal_info(&self, cfg: &ResolvedConfig, ctx: &ExecCtx) -> Result<LegalInfoOutcome> {
        let archive = self.legal_info_archive(cfg);
        if archive.is_file() {
            ctx.log(&format!("{} already exists", archive.display()));
            return Ok(LegalInfoOutcome::AlreadyPresent(archive));
        }

        ensure_dl_dir(cfg, ctx)?;
        ctx.log(&format!("generating legal-info for {}", cfg.defconfig));
        let spec = CommandSpec::new(cfg.tool.program(), &cfg.build_path)
            .env("BR2_DL_DIR", cfg.dl_dir.display().to_string())
            .arg("legal-info");
        let out = self.runner.run(&spec, ctx)?;
        if !out.success() {
            return Err(Error::tool(
                out.code,
                format!("legal-info failed for {}", cfg.id),
            ));
        }

        let generated = cfg.build_path.join("legal-info");
        let staged_name = format!("{}-legal-info", cfg.display_name);
        let staged = cfg.build_path.join(&staged_name);
        if !ctx.dry_run {
            for dir in LEGAL_INFO_SOURCE_DIRS {
                let p = generated.join(dir);
                if p.exists() {
                    fs::remove_dir_all(&p).map_err(|e| {
                        Error::tool(None, format!("failed to strip {}: {e}", p.display()))
                    })?;
                }
            }
            fs::create_dir_all(cfg.images_dir()).map_err(|e| {
                Error::tool(
                    None,
                    format!("failed to create {}: {e}", cfg.images_dir().display()),
                )
            })?;
            if staged.exists() {
                remove_tree(&staged)?;
            }
            fs::rename(&generated, &staged).map_err(|e| {
                Error::tool(
                    None,
                    format!(
                        "failed to move {} to {}: {e}",
                        generated.display(),
                        staged.display()
                    ),
                )
            })?;
        }

        let tar = CommandSpec::new("tar", &cfg.build_path).args([
            "-czf".to_string(),
            archive.display().to_string(),
            staged_name,
        ]);
        let out = self.runner.run(&tar, ctx)?;
        if !out.success() {
            return Err(Error::tool(
                out.code,
                format!("failed to archive {}", staged.display()),
            ));
        }
        if !ctx.dry_run && staged.exists() {
            remove_tree(&staged)?;
        }
        ctx.log(&format!("wrote {}", archive.display()));
        Ok(LegalInfoOutcome::Created(archive))
    }

    /// Pull the checkout when it is a git working copy; anything else is left alone.
    pub fn update(&self, root: &Path, ctx: &ExecCtx) -> Result<bool> {
        if !root.join(".git").exists() {
            ctx.log(&format!(
                "{} is not a git checkout, skipping update",
                root.display()
            ));
            return Ok(false);
        }
        ctx.log(&format!("updating {}", root.display()));
        let spec = CommandSpec::new("git", root).args([
            "-C".to_string(),
            root.display().to_string(),
            "pull".to_string(),
        ]);
        let out = self.runner.run(&spec, ctx)?;
        if !out.success() {
            return Err(Error::tool(
                out.code,
                format!("git pull failed in {}", root.display()),
            ));
        }
        Ok(true)
    }
}

/// Top-level jobs when every package already builds with `jlevel` jobs.
/// A `jlevel` of 0 is the build tool's "cpus + 1".
pub fn per_package_jobs(cpus: usize, jlevel: usize) -> usize {
    let cpus = cpus.max(1);
    let jlevel = if jlevel == 0 { cpus + 1 } else { jlevel };
    (cpus / jlevel).max(1)
}

// Dry runs leave the tree as it is.
fn ensure_dl_dir(cfg: &ResolvedConfig, ctx: &ExecCtx) -> Result<()> {
    if ctx.dry_run || cfg.dl_dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(&cfg.dl_dir).map_err(|e| {
        Error::config(format!(
            "failed to create download dir {}: {e}",
            cfg.dl_dir.display()
        ))
    })
}

fn append_fragment(dot_config: &Path, fragment: &Path) -> Result<()> {
    let body = fs::read_to_string(fragment)
        .map_err(|e| Error::config(format!("failed to read {}: {e}", fragment.display())))?;
    let needs_newline = fs::read(dot_config)
        .map(|b| b.last().is_some_and(|c| *c != b'\n'))
        .unwrap_or(false);
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dot_config)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", dot_config.display())))?;
    let mut chunk = String::with_capacity(body.len() + 2);
    if needs_newline {
        chunk.push('\n');
    }
    chunk.push_str(&body);
    if !chunk.ends_with('\n') {
        chunk.push('\n');
    }
    f.write_all(chunk.as_bytes())
        .map_err(|e| Error::msg(format!("failed to write {}: {e}", dot_config.display())))
}

// Symlinked build dirs lose the link, never the target.
fn remove_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let is_link = fs::symlink_metadata(path)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);
            if is_link {
                fs::remove_file(path).map_err(|e| {
                    Error::msg(format!("failed to remove link {}: {e}", path.display()))
                })
            } else {
                Err(Error::msg(format!(
                    "failed to remove {}: {e}",
                    path.display()
                )))
            }
        }
    }
}

fn tail_file(path: &Path, n: usize) -> Option<Vec<String>> {
    let data = fs::read(path).ok()?;
    let mut tail = TailBuffer::new(n);
    for line in String::from_utf8_lossy(&data).lines() {
        tail.push(line);
    }
    Some(tail.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ChannelSink, CommandOutcome};
    use crate::manifest::TargetDescriptor;
    use std::sync::{Arc, mpsc};

    struct Succeed;

    impl CommandRunner for Succeed {
        fn run(&self, _spec: &CommandSpec, _ctx: &ExecCtx) -> Result<CommandOutcome> {
            Ok(CommandOutcome::exited(0))
        }
    }

    fn ctx(dry_run: bool) -> ExecCtx {
        let (tx, _rx) = mpsc::channel();
        ExecCtx::new(dry_run, Arc::new(ChannelSink::new(tx)))
    }

    #[test]
    fn dry_run_apply_leaves_the_tree_alone() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::create_dir_all(root.join("retro/configs")).expect("mkdir");
        fs::write(root.join("retro/configs/pi4_defconfig"), "").expect("write defconfig");
        let cfg = crate::resolve::resolve(&TargetDescriptor::new("pi4", "retro"), root, false)
            .expect("resolve");

        Buildroot::new(&Succeed).apply(&cfg, &ctx(true)).expect("dry apply");
        assert!(!cfg.dl_dir.exists());
        assert!(!cfg.output_dir.exists());

        Buildroot::new(&Succeed).apply(&cfg, &ctx(false)).expect("apply");
        assert!(cfg.dl_dir.is_dir());
        assert!(cfg.output_dir.is_dir());
    }

    #[test]
    fn per_package_jobs_divides_cpus() {
        assert_eq!(per_package_jobs(16, 4), 4);
        assert_eq!(per_package_jobs(16, 5), 3);
        assert_eq!(per_package_jobs(2, 8), 1);
        assert_eq!(per_package_jobs(8, 0), 1);
        assert_eq!(per_package_jobs(0, 0), 1);
    }

    #[test]
    fn fragments_are_appended_on_their_own_line() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cfg = tmp.path().join(".config");
        let frag = tmp.path().join("debug.cfg");
        fs::write(&cfg, "BR2_A=y").expect("write config");
        fs::write(&frag, "BR2_B=y").expect("write fragment");
        append_fragment(&cfg, &frag).expect("append");
        assert_eq!(fs::read_to_string(&cfg).expect("read"), "BR2_A=y\nBR2_B=y\n");
    }

    #[test]
    fn tail_file_returns_last_lines() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let log = tmp.path().join("br.log");
        let body: String = (0..150).map(|i| format!("line {i}\n")).collect();
        fs::write(&log, body).expect("write log");
        let tail = tail_file(&log, DIAG_TAIL_LINES).expect("tail");
        assert_eq!(tail.len(), 100);
        assert_eq!(tail[0], "line 50");
        assert!(tail_file(&tmp.path().join("missing.log"), 10).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn removing_a_symlinked_build_dir_keeps_the_target() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let real = tmp.path().join("real");
        fs::create_dir_all(real.join("images")).expect("mkdir");
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&real, &link).expect("symlink");
        remove_tree(&link).expect("remove");
        assert!(fs::symlink_metadata(&link).is_err());
        assert!(real.join("images").is_dir());
    }
}
