use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

pub const DEFCONFIG_SUFFIX: &str = "_defconfig";
pub const TOPDIR_TOKEN: &str = "$(TOPDIR)";
const UNSET_MARKER: &str = "is not set";

/// `foo` and `foo_defconfig` both normalize to `foo_defconfig`.
pub fn normalize(name: &str) -> String {
    format!("{}{DEFCONFIG_SUFFIX}", strip_suffix(name))
}

pub fn strip_suffix(name: &str) -> &str {
    let name = name.trim();
    name.strip_suffix(DEFCONFIG_SUFFIX).unwrap_or(name)
}

/// Key/value view of a defconfig or `.config`. Unset options are skipped, the
/// last assignment of a key wins.
pub fn parse_str(data: &str, topdir: &Path) -> BTreeMap<String, String> {
    let topdir = topdir.display().to_string();
    let mut out = BTreeMap::new();
    for line in data.lines() {
        let line = line.trim();
        if line.contains(UNSET_MARKER) {
            continue;
        }
        let Some((key, val)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || key.starts_with('#') {
            continue;
        }
        let val = val.replace('"', "").replace(TOPDIR_TOKEN, &topdir);
        out.insert(key.to_string(), val);
    }
    out
}

pub fn parse_file(path: &Path, topdir: &Path) -> Result<BTreeMap<String, String>> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
    Ok(parse_str(&data, topdir))
}

pub fn lookup(path: &Path, key: &str, topdir: &Path) -> Result<Option<String>> {
    Ok(parse_file(path, topdir)?.remove(key))
}

pub fn is_enabled(cfg: &BTreeMap<String, String>, key: &str) -> bool {
    cfg.get(key).map(|v| v == "y").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn normalization_is_idempotent() {
        assert_eq!(normalize("foo"), "foo_defconfig");
        assert_eq!(normalize("foo_defconfig"), "foo_defconfig");
        assert_eq!(normalize(&normalize("foo")), "foo_defconfig");
        assert_eq!(strip_suffix("foo_defconfig"), "foo");
    }

    #[test]
    fn topdir_is_substituted_and_unset_skipped() {
        let cfg = parse_str(
            "BR2_DL_DIR=\"$(TOPDIR)/dl\"\n# BR2_FOO is not set\n",
            &PathBuf::from("/root"),
        );
        assert_eq!(cfg.get("BR2_DL_DIR").map(String::as_str), Some("/root/dl"));
        assert!(!cfg.contains_key("BR2_FOO"));
    }

    #[test]
    fn last_assignment_wins_and_comments_are_ignored() {
        let cfg = parse_str(
            "# a comment\n\nBR2_JLEVEL=2\nBR2_JLEVEL=8\nBR2_X=a=b\n",
            &PathBuf::from("/br"),
        );
        assert_eq!(cfg.get("BR2_JLEVEL").map(String::as_str), Some("8"));
        assert_eq!(cfg.get("BR2_X").map(String::as_str), Some("a=b"));
        assert_eq!(cfg.len(), 2);
    }

    #[test]
    fn enabled_requires_y() {
        let cfg = parse_str(
            "BR2_PER_PACKAGE_DIRECTORIES=y\nBR2_CCACHE=n\n",
            &PathBuf::from("/br"),
        );
        assert!(is_enabled(&cfg, "BR2_PER_PACKAGE_DIRECTORIES"));
        assert!(!is_enabled(&cfg, "BR2_CCACHE"));
        assert!(!is_enabled(&cfg, "BR2_MISSING"));
    }
}
