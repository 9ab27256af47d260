pub mod generate;
pub mod parse;
pub mod types;

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub use parse::{load, load_config, require, ConfigError};
pub use types::{
    CompletionConfig, Config, ExtractionConfig, StageBackend, StageConfig, StagingConfig,
    StoreBackend, StoreConfig, WebConfig,
};

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
    })
}

/// Expands environment variables in a string.
/// Supports $env{VAR_NAME} syntax.
/// If an environment variable is not set, it's left unchanged.
pub fn expand_env_vars(text: &str) -> String {
    env_var_pattern()
        .replace_all(text, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .to_string()
}

/// Names of `$env{...}` references that survived expansion, ignoring
/// comment lines.
pub(crate) fn unexpanded_env_vars(text: &str) -> Vec<String> {
    let mut names: Vec<String> = text
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .flat_map(|line| env_var_pattern().captures_iter(line))
        .map(|caps| caps[1].to_string())
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Expands tilde (~) in paths to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(rest);
        }
    } else if path_str == "~" {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir;
        }
    }

    path.to_path_buf()
}

/// Resolves the config file path based on explicit argument or default locations.
/// Returns the first existing path from:
/// 1. Explicit path (if provided, with tilde expansion)
/// 2. ~/.config/docproc/config.yml
/// 3. /etc/docproc/config.yml
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand_tilde(path));
    }

    if let Some(home_dir) = dirs::home_dir() {
        let user_config = home_dir.join(".config/docproc/config.yml");
        if user_config.exists() {
            return Some(user_config);
        }
    }

    let system_config = PathBuf::from("/etc/docproc/config.yml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars_single() {
        std::env::set_var("DOCPROC_TEST_CONTAINER", "uploads");
        let result = expand_env_vars("container: $env{DOCPROC_TEST_CONTAINER}");
        assert_eq!(result, "container: uploads");
        std::env::remove_var("DOCPROC_TEST_CONTAINER");
    }

    #[test]
    fn test_expand_env_vars_unset_left_unchanged() {
        let result = expand_env_vars("key: $env{DOCPROC_TEST_NOT_SET}");
        assert_eq!(result, "key: $env{DOCPROC_TEST_NOT_SET}");
        assert_eq!(
            unexpanded_env_vars(&result),
            vec!["DOCPROC_TEST_NOT_SET".to_string()]
        );
    }

    #[test]
    fn test_unexpanded_env_vars_dedups() {
        let names = unexpanded_env_vars("$env{B} $env{A} $env{B}");
        assert_eq!(names, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_unexpanded_env_vars_skips_comments() {
        let names = unexpanded_env_vars("  # endpoint: $env{A}\nkey: $env{B} # $env{C}");
        assert_eq!(names, vec!["B".to_string(), "C".to_string()]);
    }

    #[test]
    fn test_expand_tilde_with_path() {
        let expanded = expand_tilde(Path::new("~/objects"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("objects"));
        }
    }

    #[test]
    fn test_expand_tilde_no_expansion() {
        let expanded = expand_tilde(Path::new("/var/lib/docproc"));
        assert_eq!(expanded, Path::new("/var/lib/docproc"));
    }

    #[test]
    fn test_resolve_explicit_path_wins() {
        let resolved = resolve_config_path(Some(Path::new("/tmp/docproc.yml")));
        assert_eq!(resolved, Some(PathBuf::from("/tmp/docproc.yml")));
    }
}
