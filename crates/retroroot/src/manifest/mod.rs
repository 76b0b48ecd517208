use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::defconfig;
use crate::error::{Error, Result};

pub mod attr;

use attr::{AttrType, parse_attr, parse_bool, parse_str, parse_str_list};

const DEFAULT_USER: &str = "br-user";
const DEFAULT_BUILDROOT_DIR: &str = "buildroot";
const DEFAULT_OUTPUT_DIR_NAME: &str = "output";
const DEFAULT_CONFIG_DIR_NAME: &str = "configs";

const ENVIRONMENT_KEYS: &[&str] = &[
    "user",
    "buildroot_dir_name",
    "update_buildroot",
    "exit_after_build",
];
const TARGET_KEYS: &[&str] = &[
    "defconfig",
    "name",
    "output_tree",
    "output_dir_name",
    "config_dir_tree",
    "config_dir_name",
    "external_trees",
    "fragment_dir",
    "fragments",
    "build",
    "clean",
    "remove",
    "skip",
    "legal_info",
    "verbose",
];

#[derive(Debug, Clone)]
pub struct Manifest {
    pub path: PathBuf,
    pub environment: Environment,
    pub targets: Vec<TargetDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Environment {
    pub user: String,
    pub buildroot_dir_name: String,
    pub update_buildroot: bool,
    pub exit_after_build: bool,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            user: DEFAULT_USER.into(),
            buildroot_dir_name: DEFAULT_BUILDROOT_DIR.into(),
            update_buildroot: false,
            exit_after_build: true,
        }
    }
}

impl Environment {
    pub fn buildroot_root(&self, home_base: &Path) -> PathBuf {
        home_base.join(&self.user).join(&self.buildroot_dir_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTree {
    pub name: String,
    pub fragment_dir: Option<String>,
    pub fragments: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanIntent {
    None,
    Clean,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    /// Always carries the `_defconfig` suffix.
    pub defconfig: String,
    pub name: Option<String>,
    pub output_tree: Option<String>,
    pub output_dir_name: String,
    pub config_dir_tree: Option<String>,
    pub config_dir_name: String,
    pub external_trees: Vec<ExternalTree>,
    // Descriptor-level fragments, merged after every tree's fragments.
    pub fragment_dir: Option<String>,
    pub fragments: Vec<String>,
    pub build: bool,
    pub clean: bool,
    pub remove: bool,
    pub skip: bool,
    pub legal_info: bool,
    pub verbose: bool,
}

impl TargetDescriptor {
    pub fn new(defconfig: &str, external_tree: &str) -> Self {
        Self {
            defconfig: defconfig::normalize(defconfig),
            name: None,
            output_tree: None,
            output_dir_name: DEFAULT_OUTPUT_DIR_NAME.into(),
            config_dir_tree: None,
            config_dir_name: DEFAULT_CONFIG_DIR_NAME.into(),
            external_trees: vec![ExternalTree {
                name: external_tree.into(),
                fragment_dir: None,
                fragments: Vec::new(),
            }],
            fragment_dir: None,
            fragments: Vec::new(),
            build: true,
            clean: false,
            remove: false,
            skip: false,
            legal_info: false,
            verbose: false,
        }
    }

    pub fn id(&self) -> &str {
        defconfig::strip_suffix(&self.defconfig)
    }

    // Build dir name: explicit display name, else the bare defconfig name.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.id())
    }

    pub fn first_tree(&self) -> &str {
        self.external_trees
            .first()
            .map(|t| t.name.as_str())
            .unwrap_or_default()
    }

    pub fn clean_intent(&self) -> CleanIntent {
        if self.remove {
            CleanIntent::Remove
        } else if self.clean {
            CleanIntent::Clean
        } else {
            CleanIntent::None
        }
    }

    pub fn matches(&self, target: &str) -> bool {
        let wanted = defconfig::strip_suffix(target);
        self.id() == wanted || self.name.as_deref().map(str::trim) == Some(target.trim())
    }
}

pub fn load(path: &Path) -> Result<Manifest> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read manifest {}: {e}", path.display())))?;
    let value = parse_document(path, &data)?;
    from_value(path, &value)
}

fn parse_document(path: &Path, data: &str) -> Result<Value> {
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    if is_toml {
        let doc: toml::Value = toml::from_str(data).map_err(|e| {
            Error::config(format!("TOML parse error in {}: {e}", path.display()))
        })?;
        serde_json::to_value(doc)
            .map_err(|e| Error::config(format!("unsupported value in {}: {e}", path.display())))
    } else {
        serde_json::from_str(data)
            .map_err(|e| Error::config(format!("JSON parse error in {}: {e}", path.display())))
    }
}

/// Validate the whole document and build the typed manifest. Every violation
/// is collected; the error lists all of them.
pub fn from_value(path: &Path, value: &Value) -> Result<Manifest> {
    let Some(root) = value.as_object() else {
        return Err(Error::config(format!(
            "{}: manifest root must be an object, got {}",
            path.display(),
            AttrType::of(value)
        )));
    };

    let mut violations = Vec::<String>::new();
    let environment = parse_environment(root, &mut violations);
    let targets = parse_targets(root, &mut violations);

    if !violations.is_empty() {
        let mut msg = format!(
            "{}: {} manifest error{}",
            path.display(),
            violations.len(),
            if violations.len() == 1 { "" } else { "s" }
        );
        for v in &violations {
            msg.push_str("\n  - ");
            msg.push_str(v);
        }
        return Err(Error::config(msg));
    }

    Ok(Manifest {
        path: path.to_path_buf(),
        environment,
        targets,
    })
}

fn record<T>(violations: &mut Vec<String>, scope: &str, res: Result<T>) -> Option<T> {
    match res {
        Ok(v) => Some(v),
        Err(e) => {
            violations.push(format!("{scope}: {e}"));
            None
        }
    }
}

fn warn_unknown_keys(scope: &str, table: &Map<String, Value>, known: &[&str]) {
    for key in table.keys() {
        if !known.contains(&key.as_str()) {
            tracing::warn!(scope, key = key.as_str(), "ignoring unknown manifest attribute");
        }
    }
}

fn parse_environment(root: &Map<String, Value>, violations: &mut Vec<String>) -> Environment {
    let mut env = Environment::default();
    let table = match root.get("environment") {
        None => return env,
        Some(Value::Array(items)) => match items.first() {
            None => return env,
            Some(Value::Object(t)) => t,
            Some(other) => {
                violations.push(format!(
                    "environment[0]: expected object, got {}",
                    AttrType::of(other)
                ));
                return env;
            }
        },
        Some(Value::Object(t)) => t,
        Some(other) => {
            violations.push(format!(
                "environment: expected list or object, got {}",
                AttrType::of(other)
            ));
            return env;
        }
    };
    warn_unknown_keys("environment", table, ENVIRONMENT_KEYS);

    let scope = "environment";
    if let Some(Some(user)) = record(violations, scope, parse_str(table, "user", Some(DEFAULT_USER), false)) {
        env.user = user;
    }
    if let Some(Some(dir)) = record(
        violations,
        scope,
        parse_str(table, "buildroot_dir_name", Some(DEFAULT_BUILDROOT_DIR), false),
    ) {
        env.buildroot_dir_name = dir;
    }
    if let Some(v) = record(violations, scope, parse_bool(table, "update_buildroot", false)) {
        env.update_buildroot = v;
    }
    if let Some(v) = record(violations, scope, parse_bool(table, "exit_after_build", true)) {
        env.exit_after_build = v;
    }
    env
}

fn parse_targets(root: &Map<String, Value>, violations: &mut Vec<String>) -> Vec<TargetDescriptor> {
    let configs = match parse_attr(root, "configs", AttrType::List, None, true) {
        Ok((_, Some(Value::Array(items)))) => items,
        Ok(_) => Vec::new(),
        Err(e) => {
            violations.push(e.to_string());
            return Vec::new();
        }
    };

    let mut out = Vec::with_capacity(configs.len());
    for (i, item) in configs.iter().enumerate() {
        let scope = format!("configs[{i}]");
        let Some(table) = item.as_object() else {
            violations.push(format!("{scope}: expected object, got {}", AttrType::of(item)));
            continue;
        };
        if let Some(target) = parse_target(&scope, table, violations) {
            out.push(target);
        }
    }
    out
}

fn parse_target(
    scope: &str,
    table: &Map<String, Value>,
    violations: &mut Vec<String>,
) -> Option<TargetDescriptor> {
    let before = violations.len();
    warn_unknown_keys(scope, table, TARGET_KEYS);

    let defconfig = record(violations, scope, parse_str(table, "defconfig", None, true)).flatten();
    let name = record(violations, scope, parse_str(table, "name", None, false)).flatten();
    let output_tree = record(violations, scope, parse_str(table, "output_tree", None, false)).flatten();
    let output_dir_name = record(
        violations,
        scope,
        parse_str(table, "output_dir_name", Some(DEFAULT_OUTPUT_DIR_NAME), false),
    )
    .flatten();
    let config_dir_tree =
        record(violations, scope, parse_str(table, "config_dir_tree", None, false)).flatten();
    let config_dir_name = record(
        violations,
        scope,
        parse_str(table, "config_dir_name", Some(DEFAULT_CONFIG_DIR_NAME), false),
    )
    .flatten();
    let fragment_dir = record(violations, scope, parse_str(table, "fragment_dir", None, false)).flatten();
    let fragments = record(violations, scope, parse_str_list(table, "fragments")).unwrap_or_default();

    let mut flag = |key: &str, default: bool| {
        record(violations, scope, parse_bool(table, key, default)).unwrap_or(default)
    };
    let build = flag("build", true);
    let clean = flag("clean", false);
    let remove = flag("remove", false);
    let skip = flag("skip", false);
    let legal_info = flag("legal_info", false);
    let verbose = flag("verbose", false);

    let external_trees = parse_external_trees(scope, table, violations);

    if let Some(d) = defconfig.as_deref()
        && defconfig::strip_suffix(d).is_empty()
    {
        violations.push(format!("{scope}: defconfig must not be empty"));
    }

    if violations.len() > before {
        return None;
    }

    Some(TargetDescriptor {
        defconfig: defconfig::normalize(defconfig.as_deref().unwrap_or_default()),
        name,
        output_tree,
        output_dir_name: output_dir_name.unwrap_or_else(|| DEFAULT_OUTPUT_DIR_NAME.into()),
        config_dir_tree,
        config_dir_name: config_dir_name.unwrap_or_else(|| DEFAULT_CONFIG_DIR_NAME.into()),
        external_trees,
        fragment_dir,
        fragments,
        build,
        clean,
        remove,
        skip,
        legal_info,
        verbose,
    })
}

fn parse_external_trees(
    scope: &str,
    table: &Map<String, Value>,
    violations: &mut Vec<String>,
) -> Vec<ExternalTree> {
    let items = match parse_attr(table, "external_trees", AttrType::List, None, true) {
        Ok((_, Some(Value::Array(items)))) => items,
        Ok(_) => Vec::new(),
        Err(e) => {
            violations.push(format!("{scope}: {e}"));
            return Vec::new();
        }
    };
    if items.is_empty() {
        violations.push(format!("{scope}: external_trees must list at least one tree"));
        return Vec::new();
    }

    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let tree_scope = format!("{scope}.external_trees[{i}]");
        let Some(tree) = item.as_object() else {
            violations.push(format!(
                "{tree_scope}: expected object, got {}",
                AttrType::of(item)
            ));
            continue;
        };
        let name = record(violations, &tree_scope, parse_str(tree, "name", None, true)).flatten();
        let fragment_dir =
            record(violations, &tree_scope, parse_str(tree, "fragment_dir", None, false)).flatten();
        let fragments =
            record(violations, &tree_scope, parse_str_list(tree, "fragments")).unwrap_or_default();
        if let Some(name) = name {
            out.push(ExternalTree {
                name,
                fragment_dir,
                fragments,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn load_json(v: Value) -> Result<Manifest> {
        from_value(Path::new("<mem>"), &v)
    }

    #[test]
    fn applies_descriptor_defaults() {
        let m = load_json(json!({
            "configs": [{ "defconfig": "pi4", "external_trees": [{ "name": "ext" }] }]
        }))
        .expect("manifest");
        let t = &m.targets[0];
        assert_eq!(t.defconfig, "pi4_defconfig");
        assert!(t.build);
        assert!(!t.clean && !t.remove && !t.skip && !t.legal_info && !t.verbose);
        assert_eq!(t.output_dir_name, "output");
        assert_eq!(t.config_dir_name, "configs");
        assert_eq!(t.display_name(), "pi4");
        assert_eq!(m.environment, Environment::default());
    }

    #[test]
    fn environment_list_uses_first_entry() {
        let m = load_json(json!({
            "environment": [{ "user": "dev", "buildroot_dir_name": "br", "update_buildroot": true, "exit_after_build": false }],
            "configs": []
        }))
        .expect("manifest");
        assert_eq!(m.environment.user, "dev");
        assert!(m.environment.update_buildroot);
        assert!(!m.environment.exit_after_build);
        assert_eq!(
            m.environment.buildroot_root(Path::new("/home")),
            PathBuf::from("/home/dev/br")
        );
    }

    #[test]
    fn reports_every_violation_at_once() {
        let err = load_json(json!({
            "configs": [
                { "external_trees": [{ "name": "ext" }] },
                { "defconfig": "b", "build": 1, "external_trees": [] },
                { "defconfig": "c", "external_trees": [{ "fragments": ["x"] }] }
            ]
        }))
        .unwrap_err();
        let msg = err.to_string();
        assert!(err.is_config());
        assert!(msg.contains("configs[0]") && msg.contains("defconfig"), "{msg}");
        assert!(msg.contains("configs[1]") && msg.contains("bool"), "{msg}");
        assert!(msg.contains("at least one tree"), "{msg}");
        assert!(msg.contains("configs[2].external_trees[0]"), "{msg}");
        assert!(msg.contains("4 manifest errors"), "{msg}");
    }

    #[test]
    fn missing_configs_list_is_fatal() {
        let err = load_json(json!({ "environment": [] })).unwrap_err();
        assert!(err.to_string().contains("configs"), "{err}");
    }

    #[test]
    fn remove_wins_over_clean() {
        let mut t = TargetDescriptor::new("a", "ext");
        t.clean = true;
        t.remove = true;
        assert_eq!(t.clean_intent(), CleanIntent::Remove);
        t.remove = false;
        assert_eq!(t.clean_intent(), CleanIntent::Clean);
    }

    #[test]
    fn matches_by_stripped_defconfig_or_name() {
        let mut t = TargetDescriptor::new("pi4_defconfig", "ext");
        t.name = Some("retro-pi4".into());
        assert!(t.matches("pi4"));
        assert!(t.matches("pi4_defconfig"));
        assert!(t.matches("retro-pi4"));
        assert!(!t.matches("pi3"));
    }

    #[test]
    fn toml_manifests_are_accepted() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("env.toml");
        fs::write(
            &path,
            r#"
[[environment]]
user = "ci"

[[configs]]
defconfig = "x86_64"
legal_info = true

[[configs.external_trees]]
name = "retro"
fragments = ["debug.cfg"]
"#,
        )
        .expect("write manifest");
        let m = load(&path).expect("load");
        assert_eq!(m.environment.user, "ci");
        assert!(m.targets[0].legal_info);
        assert_eq!(m.targets[0].external_trees[0].fragments, vec!["debug.cfg"]);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("env.json");
        fs::write(&path, "{ \"configs\": [ ").expect("write manifest");
        let err = load(&path).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("JSON parse error"), "{err}");
    }
}
