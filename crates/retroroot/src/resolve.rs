use std::path::{Path, PathBuf};

use crate::defconfig;
use crate::error::{Error, Result};
use crate::manifest::{ExternalTree, TargetDescriptor};

pub const DL_DIR_KEY: &str = "BR2_DL_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildTool {
    /// Quiet wrapper that logs to `br.log` in the build dir.
    Brmake,
    Make,
}

impl BuildTool {
    pub fn select(verbose: bool) -> Self {
        if verbose { BuildTool::Make } else { BuildTool::Brmake }
    }

    pub fn program(self) -> &'static str {
        match self {
            BuildTool::Brmake => "brmake",
            BuildTool::Make => "make",
        }
    }
}

/// Per-target paths, derived fresh for every target and never persisted.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub id: String,
    pub display_name: String,
    pub buildroot_root: PathBuf,
    pub defconfig: String,
    pub defconfig_path: PathBuf,
    pub config_dir: PathBuf,
    pub output_dir: PathBuf,
    pub build_path: PathBuf,
    pub dl_dir: PathBuf,
    pub external_paths: Vec<PathBuf>,
    pub fragments: Vec<PathBuf>,
    pub tool: BuildTool,
}

impl ResolvedConfig {
    pub fn dot_config(&self) -> PathBuf {
        self.build_path.join(".config")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.build_path.join("images")
    }

    pub fn br2_external(&self) -> String {
        self.external_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":")
    }
}

pub fn resolve(target: &TargetDescriptor, root: &Path, verbose: bool) -> Result<ResolvedConfig> {
    let first_tree = target.first_tree();
    if first_tree.is_empty() {
        return Err(Error::config(format!(
            "{}: at least one external tree is required",
            target.defconfig
        )));
    }

    let output_tree = non_empty(target.output_tree.as_deref()).unwrap_or(first_tree);
    let output_dir = root.join(output_tree).join(&target.output_dir_name);

    let config_tree = non_empty(target.config_dir_tree.as_deref()).unwrap_or(first_tree);
    let config_dir = root.join(config_tree).join(&target.config_dir_name);

    let defconfig = defconfig::normalize(&target.defconfig);
    let defconfig_path = config_dir.join(&defconfig);
    if !defconfig_path.is_file() {
        return Err(Error::config(format!(
            "{}: no such file",
            defconfig_path.display()
        )));
    }

    let build_path = output_dir.join(target.display_name());

    let mut fragments = Vec::new();
    for tree in &target.external_trees {
        fragments.extend(tree_fragments(root, &config_dir, tree)?);
    }
    if !target.fragments.is_empty() {
        let dir = fragment_dir(root, first_tree, target.fragment_dir.as_deref(), &config_dir);
        fragments.extend(existing_fragments(&dir, &target.fragments)?);
    }

    let dl_dir = resolve_dl_dir(&defconfig_path, root, first_tree)?;

    let external_paths = target
        .external_trees
        .iter()
        .map(|t| root.join(&t.name))
        .collect();

    tracing::debug!(
        id = target.id(),
        build_path = %build_path.display(),
        fragments = fragments.len(),
        "resolved target paths"
    );

    Ok(ResolvedConfig {
        id: target.id().to_string(),
        display_name: target.display_name().to_string(),
        buildroot_root: root.to_path_buf(),
        defconfig,
        defconfig_path,
        config_dir,
        output_dir,
        build_path,
        dl_dir,
        external_paths,
        fragments,
        tool: BuildTool::select(verbose || target.verbose),
    })
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

fn fragment_dir(root: &Path, tree: &str, explicit: Option<&str>, config_dir: &Path) -> PathBuf {
    match non_empty(explicit) {
        Some(dir) => root.join(tree).join(dir),
        None => config_dir.join("configs"),
    }
}

fn tree_fragments(root: &Path, config_dir: &Path, tree: &ExternalTree) -> Result<Vec<PathBuf>> {
    if tree.fragments.is_empty() {
        return Ok(Vec::new());
    }
    let dir = fragment_dir(root, &tree.name, tree.fragment_dir.as_deref(), config_dir);
    existing_fragments(&dir, &tree.fragments)
}

fn existing_fragments(dir: &Path, names: &[String]) -> Result<Vec<PathBuf>> {
    names
        .iter()
        .map(|name| {
            let path = dir.join(name);
            if path.is_file() {
                Ok(path)
            } else {
                Err(Error::config(format!("{}: no such fragment", path.display())))
            }
        })
        .collect()
}

fn resolve_dl_dir(defconfig_path: &Path, root: &Path, first_tree: &str) -> Result<PathBuf> {
    let dl_dir = match defconfig::lookup(defconfig_path, DL_DIR_KEY, root)?
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        Some(raw) => {
            let p = PathBuf::from(raw);
            if p.is_absolute() { p } else { root.join(p) }
        }
        None => root.join(first_tree).join("dl"),
    };
    Ok(dl_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, body).expect("write");
    }

    #[test]
    fn default_layout_comes_from_first_tree() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        write(&root.join("retro/configs/pi4_defconfig"), "BR2_aarch64=y\n");

        let t = TargetDescriptor::new("pi4", "retro");
        let r = resolve(&t, root, false).expect("resolve");
        assert_eq!(r.defconfig, "pi4_defconfig");
        assert_eq!(r.defconfig_path, root.join("retro/configs/pi4_defconfig"));
        assert_eq!(r.output_dir, root.join("retro/output"));
        assert_eq!(r.build_path, root.join("retro/output/pi4"));
        assert_eq!(r.dl_dir, root.join("retro/dl"));
        assert!(!r.dl_dir.exists(), "resolving only computes paths");
        assert_eq!(r.tool, BuildTool::Brmake);
        assert_eq!(r.br2_external(), root.join("retro").display().to_string());
    }

    #[test]
    fn explicit_name_and_trees_override_defaults() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        write(&root.join("boards/defs/x86_defconfig"), "");

        let mut t = TargetDescriptor::new("x86_defconfig", "retro");
        t.name = Some("pc".into());
        t.output_tree = Some("out-tree".into());
        t.output_dir_name = "builds".into();
        t.config_dir_tree = Some("boards".into());
        t.config_dir_name = "defs".into();
        t.verbose = true;
        let r = resolve(&t, root, false).expect("resolve");
        assert_eq!(r.build_path, root.join("out-tree/builds/pc"));
        assert_eq!(r.tool, BuildTool::Make);
    }

    #[test]
    fn dl_dir_is_read_from_defconfig() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        write(
            &root.join("retro/configs/a_defconfig"),
            "BR2_DL_DIR=\"$(TOPDIR)/cache/dl\"\n",
        );
        let r = resolve(&TargetDescriptor::new("a", "retro"), root, false).expect("resolve");
        assert_eq!(r.dl_dir, PathBuf::from(format!("{}/cache/dl", root.display())));
    }

    #[test]
    fn fragments_follow_declaration_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        write(&root.join("a/configs/t_defconfig"), "");
        write(&root.join("a/frags/f1"), "BR2_F1=y\n");
        write(&root.join("a/frags/f2"), "BR2_F2=y\n");
        write(&root.join("a/configs/configs/f3"), "BR2_F3=y\n");

        let mut t = TargetDescriptor::new("t", "a");
        t.external_trees = vec![
            ExternalTree {
                name: "a".into(),
                fragment_dir: Some("frags".into()),
                fragments: vec!["f1".into(), "f2".into()],
            },
            ExternalTree {
                name: "b".into(),
                fragment_dir: None,
                fragments: vec!["f3".into()],
            },
        ];
        let r = resolve(&t, root, false).expect("resolve");
        assert_eq!(
            r.fragments,
            vec![
                root.join("a/frags/f1"),
                root.join("a/frags/f2"),
                root.join("a/configs/configs/f3"),
            ]
        );
        assert_eq!(r.external_paths, vec![root.join("a"), root.join("b")]);
    }

    #[test]
    fn missing_defconfig_and_fragment_are_config_errors() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        let err = resolve(&TargetDescriptor::new("nope", "retro"), root, false).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("nope_defconfig"), "{err}");

        write(&root.join("retro/configs/t_defconfig"), "");
        let mut t = TargetDescriptor::new("t", "retro");
        t.external_trees[0].fragments = vec!["ghost.cfg".into()];
        let err = resolve(&t, root, false).unwrap_err();
        assert!(err.to_string().contains("ghost.cfg"), "{err}");
    }
}
