use std::path::PathBuf;

/// Run-wide switches, built once at the process boundary and handed to the
/// orchestrator. Nothing below `main` reads the environment.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub manifests: Vec<PathBuf>,
    /// Re-run defconfig application even when the build dir exists.
    pub apply_configs: bool,
    pub no_build: bool,
    pub clean_after_build: bool,
    /// Single-target mode when set.
    pub target: Option<String>,
    pub verbose: bool,
    /// Restrict a per-package parallel build to one package.
    pub package: Option<String>,
    pub buildroot_root: Option<PathBuf>,
    pub home_base: PathBuf,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            manifests: vec![PathBuf::from("env.json")],
            apply_configs: false,
            no_build: false,
            clean_after_build: false,
            target: None,
            verbose: false,
            package: None,
            buildroot_root: None,
            home_base: PathBuf::from("/home"),
        }
    }
}

impl RunOptions {
    pub fn target(&self) -> Option<&str> {
        self.target
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn package(&self) -> Option<&str> {
        self.package
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

pub fn split_manifest_list(raw: &str) -> Vec<PathBuf> {
    raw.split(':')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

// Loose boolean for flags coming from the environment.
pub fn parse_flag(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("expected a boolean, got '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_list_drops_empty_segments() {
        assert_eq!(
            split_manifest_list("a.json::b.toml:"),
            vec![PathBuf::from("a.json"), PathBuf::from("b.toml")]
        );
    }

    #[test]
    fn flags_are_case_insensitive() {
        assert_eq!(parse_flag("TRUE"), Ok(true));
        assert_eq!(parse_flag("off"), Ok(false));
        assert!(parse_flag("maybe").is_err());
    }

    #[test]
    fn blank_target_means_all_targets() {
        let opts = RunOptions {
            target: Some("  ".into()),
            ..RunOptions::default()
        };
        assert_eq!(opts.target(), None);
    }
}
