use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use serde::Serialize;

use crate::buildroot::Buildroot;
use crate::error::{Error, Result};
use crate::executor::{CommandRunner, ExecCtx, ExecEvent};
use crate::manifest::{self, CleanIntent, Environment, TargetDescriptor};
use crate::options::RunOptions;
use crate::resolve::{self, ResolvedConfig};

#[derive(Debug, Clone)]
pub struct TargetPlan {
    pub descriptor: TargetDescriptor,
    /// `None` for skipped targets, which are never resolved.
    pub resolved: Option<ResolvedConfig>,
}

#[derive(Debug, Clone)]
pub struct ManifestPlan {
    pub path: PathBuf,
    pub environment: Environment,
    pub buildroot_root: PathBuf,
    pub targets: Vec<TargetPlan>,
}

#[derive(Debug, Clone)]
pub enum Plan {
    All(Vec<ManifestPlan>),
    Single {
        manifest: ManifestPlan,
        target: TargetPlan,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub built: Vec<String>,
    pub skipped: Vec<String>,
    /// Buildroot roots whose manifest asked to stay in a shell afterwards.
    pub shell_roots: Vec<PathBuf>,
}

/// Load, validate and resolve every manifest without touching the tree, so
/// any configuration error surfaces before the first build step.
pub fn plan(opts: &RunOptions) -> Result<Plan> {
    if opts.manifests.is_empty() {
        return Err(Error::config("no manifest given"));
    }
    let mut loaded = Vec::with_capacity(opts.manifests.len());
    for path in &opts.manifests {
        loaded.push(manifest::load(path)?);
    }

    if let Some(wanted) = opts.target() {
        for m in &loaded {
            let Some(desc) = m.targets.iter().find(|t| t.matches(wanted)) else {
                continue;
            };
            let root = buildroot_root(opts, &m.environment)?;
            let resolved = if desc.skip {
                None
            } else {
                Some(resolve::resolve(desc, &root, opts.verbose)?)
            };
            return Ok(Plan::Single {
                manifest: ManifestPlan {
                    path: m.path.clone(),
                    environment: m.environment.clone(),
                    buildroot_root: root,
                    targets: Vec::new(),
                },
                target: TargetPlan {
                    descriptor: desc.clone(),
                    resolved,
                },
            });
        }
        let searched = opts
            .manifests
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(Error::config(format!(
            "target '{wanted}' not found in {searched}"
        )));
    }

    let mut plans = Vec::with_capacity(loaded.len());
    for m in loaded {
        let root = buildroot_root(opts, &m.environment)?;
        let mut targets = Vec::with_capacity(m.targets.len());
        for desc in m.targets {
            let resolved = if desc.skip {
                None
            } else {
                Some(resolve::resolve(&desc, &root, opts.verbose)?)
            };
            targets.push(TargetPlan {
                descriptor: desc,
                resolved,
            });
        }
        plans.push(ManifestPlan {
            path: m.path,
            environment: m.environment,
            buildroot_root: root,
            targets,
        });
    }
    Ok(Plan::All(plans))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    Skip,
    Remove,
    Clean,
    Apply,
    LegalInfo,
    Build,
    CleanAfterBuild,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Skip => "skip",
            Step::Remove => "remove",
            Step::Clean => "clean",
            Step::Apply => "apply",
            Step::LegalInfo => "legal-info",
            Step::Build => "build",
            Step::CleanAfterBuild => "clean-after-build",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutlineTarget {
    pub id: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Outline {
    pub manifest: PathBuf,
    pub buildroot_root: PathBuf,
    pub environment: Environment,
    /// The checkout is pulled before this manifest's first target.
    pub update: bool,
    pub targets: Vec<OutlineTarget>,
}

/// The steps `execute` would take, per manifest, as the tree looks now.
pub fn outline(plan: &Plan, opts: &RunOptions) -> Vec<Outline> {
    match plan {
        Plan::All(manifests) => {
            let mut updated = BTreeSet::new();
            manifests
                .iter()
                .map(|m| Outline {
                    manifest: m.path.clone(),
                    buildroot_root: m.buildroot_root.clone(),
                    environment: m.environment.clone(),
                    update: m.environment.update_buildroot
                        && updated.insert(m.buildroot_root.clone()),
                    targets: m
                        .targets
                        .iter()
                        .map(|t| OutlineTarget {
                            id: t.descriptor.id().to_string(),
                            steps: target_steps(t, opts, false),
                        })
                        .collect(),
                })
                .collect()
        }
        Plan::Single { manifest, target } => vec![Outline {
            manifest: manifest.path.clone(),
            buildroot_root: manifest.buildroot_root.clone(),
            environment: manifest.environment.clone(),
            update: false,
            targets: vec![OutlineTarget {
                id: target.descriptor.id().to_string(),
                steps: target_steps(target, opts, true),
            }],
        }],
    }
}

fn target_steps(t: &TargetPlan, opts: &RunOptions, single: bool) -> Vec<Step> {
    let Some(cfg) = t.resolved.as_ref() else {
        return vec![Step::Skip];
    };
    let desc = &t.descriptor;
    let mut steps = Vec::new();
    if !single {
        let mut build_dir_left = cfg.build_path.exists();
        match desc.clean_intent() {
            CleanIntent::Remove => {
                steps.push(Step::Remove);
                build_dir_left = false;
            }
            CleanIntent::Clean => steps.push(Step::Clean),
            CleanIntent::None => {}
        }
        if opts.apply_configs || !build_dir_left {
            steps.push(Step::Apply);
        }
    }
    if desc.legal_info {
        steps.push(Step::LegalInfo);
    }
    if desc.build && !opts.no_build {
        steps.push(Step::Build);
        if opts.clean_after_build {
            steps.push(Step::CleanAfterBuild);
        }
    }
    steps
}

fn buildroot_root(opts: &RunOptions, env: &Environment) -> Result<PathBuf> {
    let root = opts
        .buildroot_root
        .clone()
        .unwrap_or_else(|| env.buildroot_root(&opts.home_base));
    if !root.is_dir() {
        return Err(Error::config(format!(
            "{}: buildroot checkout not found",
            root.display()
        )));
    }
    Ok(root)
}

/// Run a plan strictly in order. The first failing target ends the run.
pub fn execute(
    plan: &Plan,
    opts: &RunOptions,
    runner: &dyn CommandRunner,
    ctx: &mut ExecCtx,
) -> Result<RunReport> {
    let br = Buildroot::new(runner);
    let res = match plan {
        Plan::All(manifests) => execute_all(&br, manifests, opts, ctx),
        Plan::Single { manifest, target } => execute_single(&br, manifest, target, opts, ctx),
    };
    match &res {
        Ok(_) => ctx.sink.emit(ExecEvent::RunDone {
            ok: true,
            error: None,
        }),
        Err(e) => ctx.sink.emit(ExecEvent::RunDone {
            ok: false,
            error: Some(e.to_string()),
        }),
    }
    res
}

fn execute_all(
    br: &Buildroot<'_>,
    manifests: &[ManifestPlan],
    opts: &RunOptions,
    ctx: &mut ExecCtx,
) -> Result<RunReport> {
    let mut report = RunReport::default();
    let mut updated = BTreeSet::new();
    for m in manifests {
        tracing::info!(manifest = %m.path.display(), root = %m.buildroot_root.display(), "processing manifest");
        if m.environment.update_buildroot && updated.insert(m.buildroot_root.clone()) {
            update_checkout(br, m, ctx)?;
        }
        for t in &m.targets {
            let id = t.descriptor.id().to_string();
            ctx.set_target(id.clone());
            let Some(cfg) = t.resolved.as_ref() else {
                ctx.sink.emit(ExecEvent::TargetFinished {
                    id: id.clone(),
                    ok: true,
                    skipped: true,
                    error: None,
                    elapsed_ms: 0,
                });
                report.skipped.push(id);
                continue;
            };
            let built = run_step(&id, ctx, |ctx| {
                prepare_target(br, &t.descriptor, cfg, opts, ctx)?;
                finish_target(br, &t.descriptor, cfg, opts, ctx)
            })?;
            if built {
                report.built.push(id);
            }
        }
        if !m.environment.exit_after_build {
            report.shell_roots.push(m.buildroot_root.clone());
        }
    }
    Ok(report)
}

fn execute_single(
    br: &Buildroot<'_>,
    manifest: &ManifestPlan,
    target: &TargetPlan,
    opts: &RunOptions,
    ctx: &mut ExecCtx,
) -> Result<RunReport> {
    let mut report = RunReport::default();
    let id = target.descriptor.id().to_string();
    ctx.set_target(id.clone());
    let Some(cfg) = target.resolved.as_ref() else {
        tracing::info!(id = id.as_str(), "target is marked skip, nothing to do");
        ctx.sink.emit(ExecEvent::TargetFinished {
            id: id.clone(),
            ok: true,
            skipped: true,
            error: None,
            elapsed_ms: 0,
        });
        report.skipped.push(id);
        return Ok(report);
    };
    let built = run_step(&id, ctx, |ctx| {
        finish_target(br, &target.descriptor, cfg, opts, ctx)
    })?;
    if built {
        report.built.push(id);
    }
    if !manifest.environment.exit_after_build {
        report.shell_roots.push(manifest.buildroot_root.clone());
    }
    Ok(report)
}

fn run_step(
    id: &str,
    ctx: &mut ExecCtx,
    step: impl FnOnce(&ExecCtx) -> Result<bool>,
) -> Result<bool> {
    ctx.sink.emit(ExecEvent::TargetStarted { id: id.to_string() });
    let start = Instant::now();
    let res = step(&*ctx);
    let elapsed_ms = start.elapsed().as_millis();
    match res {
        Ok(built) => {
            ctx.sink.emit(ExecEvent::TargetFinished {
                id: id.to_string(),
                ok: true,
                skipped: false,
                error: None,
                elapsed_ms,
            });
            Ok(built)
        }
        Err(e) => {
            ctx.sink.emit(ExecEvent::TargetFinished {
                id: id.to_string(),
                ok: false,
                skipped: false,
                error: Some(e.to_string()),
                elapsed_ms,
            });
            Err(e.context(format!("target '{id}' failed")))
        }
    }
}

fn update_checkout(br: &Buildroot<'_>, m: &ManifestPlan, ctx: &mut ExecCtx) -> Result<()> {
    ctx.set_target("update");
    match br.update(&m.buildroot_root, ctx) {
        Ok(_) => Ok(()),
        Err(e) if e.is_interrupted() => Err(e),
        Err(e) => {
            tracing::warn!(root = %m.buildroot_root.display(), error = %e, "buildroot update failed, continuing");
            ctx.log(&format!("update failed: {e}"));
            Ok(())
        }
    }
}

// Clean/remove, then apply when the build dir is new or re-apply was asked for.
fn prepare_target(
    br: &Buildroot<'_>,
    desc: &TargetDescriptor,
    cfg: &ResolvedConfig,
    opts: &RunOptions,
    ctx: &ExecCtx,
) -> Result<()> {
    match desc.clean_intent() {
        CleanIntent::Remove => {
            br.remove(cfg, ctx)?;
        }
        CleanIntent::Clean => best_effort_clean(br, cfg, ctx)?,
        CleanIntent::None => {}
    }
    if opts.apply_configs || !cfg.build_path.exists() {
        br.apply(cfg, ctx)?;
    }
    Ok(())
}

// Legal-info lands in images/ before the build's own post-image steps.
fn finish_target(
    br: &Buildroot<'_>,
    desc: &TargetDescriptor,
    cfg: &ResolvedConfig,
    opts: &RunOptions,
    ctx: &ExecCtx,
) -> Result<bool> {
    if desc.legal_info {
        br.legal_info(cfg, ctx)?;
    }
    if !desc.build || opts.no_build {
        ctx.log(&format!("{}: skip build step", cfg.defconfig));
        return Ok(false);
    }
    br.build(cfg, opts.package(), ctx)?;
    if opts.clean_after_build {
        match desc.clean_intent() {
            CleanIntent::Remove => {
                br.remove(cfg, ctx)?;
            }
            CleanIntent::Clean | CleanIntent::None => best_effort_clean(br, cfg, ctx)?,
        }
    }
    Ok(true)
}

fn best_effort_clean(br: &Buildroot<'_>, cfg: &ResolvedConfig, ctx: &ExecCtx) -> Result<()> {
    match br.clean(cfg, ctx) {
        Ok(_) => Ok(()),
        Err(e) if e.is_interrupted() => Err(e),
        Err(e) => {
            tracing::error!(id = cfg.id.as_str(), error = %e, "clean failed, continuing");
            ctx.log(&format!("clean failed: {e}"));
            Ok(())
        }
    }
}
