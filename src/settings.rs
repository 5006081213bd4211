//! Layered settings for stratum
//!
//! Each layer overrides the one before it:
//!
//! 1. Built-in defaults (`main.json`, `stratum.state.json`, parallelism 10)
//! 2. A settings file: the one named by `STRATUM_CONFIG`, else `stratum.toml`
//!    in the working directory, else `stratum.toml` in the user config
//!    directory (`~/.config/stratum` on Linux)
//! 3. `STRATUM_STATE` and `STRATUM_PARALLELISM`
//! 4. Command-line flags
//!
//! Relative paths in a settings file are resolved against the file's own
//! directory. Everything else is resolved against the working directory.

use anyhow::{Context, Result, bail};
use declarative::DEFAULT_PARALLELISM;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming the settings file
pub const ENV_CONFIG: &str = "STRATUM_CONFIG";

/// Environment variable overriding the state file path
pub const ENV_STATE: &str = "STRATUM_STATE";

/// Environment variable overriding the walk parallelism
pub const ENV_PARALLELISM: &str = "STRATUM_PARALLELISM";

/// Settings file looked up in the working and user config directories
pub const SETTINGS_FILE: &str = "stratum.toml";

pub const DEFAULT_CONFIG: &str = "main.json";
pub const DEFAULT_STATE: &str = "stratum.state.json";

// ============================================================================
// Settings File
// ============================================================================

/// Contents of `stratum.toml`
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsFile {
    /// Configuration document to plan from
    pub config: Option<String>,
    /// State file to read and write
    pub state: Option<String>,
    /// Maximum number of graph nodes visited at once
    pub parallelism: Option<usize>,
}

impl SettingsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        let file: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;
        log::debug!("Loaded settings from {}", path.display());
        Ok(file)
    }
}

// ============================================================================
// Resolved Settings
// ============================================================================

/// Values given on the command line
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub state: Option<PathBuf>,
    pub parallelism: Option<usize>,
}

/// Fully resolved settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub config: PathBuf,
    pub state: PathBuf,
    pub parallelism: usize,
    /// Settings file that contributed, if any
    pub source: Option<PathBuf>,
}

impl Settings {
    fn defaults(cwd: &Path) -> Self {
        Self {
            config: cwd.join(DEFAULT_CONFIG),
            state: cwd.join(DEFAULT_STATE),
            parallelism: DEFAULT_PARALLELISM,
            source: None,
        }
    }

    /// Resolve against the process environment and working directory
    pub fn load(overrides: &Overrides) -> Result<Self> {
        let cwd = std::env::current_dir().context("Could not determine working directory")?;
        Self::resolve(&cwd, user_dir().as_deref(), overrides, |key| std::env::var(key).ok())
    }

    /// Resolve every layer. `env` looks up environment variables.
    pub fn resolve(
        cwd: &Path,
        user_dir: Option<&Path>,
        overrides: &Overrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut settings = Self::defaults(cwd);

        if let Some(path) = settings_file(cwd, user_dir, &env) {
            let file = SettingsFile::load(&path)?;
            let base = path.parent().unwrap_or(cwd);
            if let Some(config) = &file.config {
                settings.config = resolve_path(base, config);
            }
            if let Some(state) = &file.state {
                settings.state = resolve_path(base, state);
            }
            if let Some(parallelism) = file.parallelism {
                settings.parallelism = validate_parallelism(parallelism)
                    .with_context(|| format!("Invalid parallelism in {}", path.display()))?;
            }
            settings.source = Some(path);
        }

        if let Some(state) = env(ENV_STATE).filter(|s| !s.is_empty()) {
            settings.state = resolve_path(cwd, &state);
            log::debug!("Using state file from {ENV_STATE}: {}", settings.state.display());
        }
        if let Some(raw) = env(ENV_PARALLELISM).filter(|s| !s.is_empty()) {
            settings.parallelism =
                parse_parallelism(&raw).with_context(|| format!("Invalid {ENV_PARALLELISM}"))?;
        }

        if let Some(config) = &overrides.config {
            settings.config = cwd.join(config);
        }
        if let Some(state) = &overrides.state {
            settings.state = cwd.join(state);
        }
        if let Some(parallelism) = overrides.parallelism {
            settings.parallelism = validate_parallelism(parallelism)?;
        }

        Ok(settings)
    }
}

/// Pick the settings file, if one applies
fn settings_file(
    cwd: &Path,
    user_dir: Option<&Path>,
    env: &impl Fn(&str) -> Option<String>,
) -> Option<PathBuf> {
    if let Some(explicit) = env(ENV_CONFIG).filter(|s| !s.is_empty()) {
        let path = resolve_path(cwd, &explicit);
        log::debug!("Using settings file from {ENV_CONFIG}: {}", path.display());
        return Some(path);
    }

    let local = cwd.join(SETTINGS_FILE);
    if local.is_file() {
        return Some(local);
    }

    user_dir
        .map(|dir| dir.join(SETTINGS_FILE))
        .filter(|path| path.is_file())
}

/// User-level settings directory
///
/// `XDG_CONFIG_HOME/stratum` when set, otherwise the platform config
/// directory.
pub fn user_dir() -> Option<PathBuf> {
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config).join("stratum"));
    }
    dirs::config_dir().map(|dir| dir.join("stratum"))
}

/// Expand `~` and environment variables in a path string
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

/// Expand `path` and anchor it at `base` when relative
fn resolve_path(base: &Path, path: &str) -> PathBuf {
    let expanded = expand(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

fn parse_parallelism(raw: &str) -> Result<usize> {
    let n: usize = raw
        .trim()
        .parse()
        .with_context(|| format!("'{raw}' is not a number"))?;
    validate_parallelism(n)
}

fn validate_parallelism(n: usize) -> Result<usize> {
    if n == 0 {
        bail!("parallelism must be at least 1");
    }
    Ok(n)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn no_env() -> impl Fn(&str) -> Option<String> {
        env_of(&[])
    }

    #[test]
    fn test_defaults() {
        let cwd = TempDir::new().unwrap();
        let settings =
            Settings::resolve(cwd.path(), None, &Overrides::default(), no_env()).unwrap();
        assert_eq!(settings.config, cwd.path().join(DEFAULT_CONFIG));
        assert_eq!(settings.state, cwd.path().join(DEFAULT_STATE));
        assert_eq!(settings.parallelism, DEFAULT_PARALLELISM);
        assert!(settings.source.is_none());
    }

    #[test]
    fn test_settings_file_in_working_directory() {
        let cwd = TempDir::new().unwrap();
        fs::write(
            cwd.path().join(SETTINGS_FILE),
            "config = \"infra/main.json\"\n\
             state = \"/var/lib/stratum/state.json\"\n\
             parallelism = 4\n",
        )
        .unwrap();

        let settings =
            Settings::resolve(cwd.path(), None, &Overrides::default(), no_env()).unwrap();
        assert_eq!(settings.config, cwd.path().join("infra/main.json"));
        assert_eq!(settings.state, PathBuf::from("/var/lib/stratum/state.json"));
        assert_eq!(settings.parallelism, 4);
        assert_eq!(settings.source, Some(cwd.path().join(SETTINGS_FILE)));
    }

    #[test]
    fn test_user_settings_apply_when_no_local_file() {
        let cwd = TempDir::new().unwrap();
        let user = TempDir::new().unwrap();
        fs::write(user.path().join(SETTINGS_FILE), "state = \"shared.json\"\n").unwrap();

        let settings =
            Settings::resolve(cwd.path(), Some(user.path()), &Overrides::default(), no_env())
                .unwrap();
        // relative to the settings file, not the working directory
        assert_eq!(settings.state, user.path().join("shared.json"));

        fs::write(cwd.path().join(SETTINGS_FILE), "parallelism = 2\n").unwrap();
        let settings =
            Settings::resolve(cwd.path(), Some(user.path()), &Overrides::default(), no_env())
                .unwrap();
        assert_eq!(settings.state, cwd.path().join(DEFAULT_STATE));
        assert_eq!(settings.parallelism, 2);
    }

    #[test]
    fn test_explicit_settings_file_from_env() {
        let cwd = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let file = other.path().join("ci.toml");
        fs::write(&file, "config = \"ci.json\"\n").unwrap();
        fs::write(cwd.path().join(SETTINGS_FILE), "config = \"local.json\"\n").unwrap();

        let env = env_of(&[(ENV_CONFIG, file.to_str().unwrap())]);
        let settings = Settings::resolve(cwd.path(), None, &Overrides::default(), env).unwrap();
        assert_eq!(settings.config, other.path().join("ci.json"));
        assert_eq!(settings.source, Some(file));
    }

    #[test]
    fn test_missing_explicit_settings_file_is_an_error() {
        let cwd = TempDir::new().unwrap();
        let env = env_of(&[(ENV_CONFIG, "does-not-exist.toml")]);
        let err = Settings::resolve(cwd.path(), None, &Overrides::default(), env).unwrap_err();
        assert!(err.to_string().contains("Failed to read settings file"));
    }

    #[test]
    fn test_env_overrides_file_and_flags_override_env() {
        let cwd = TempDir::new().unwrap();
        fs::write(
            cwd.path().join(SETTINGS_FILE),
            "state = \"from-file.json\"\nparallelism = 3\n",
        )
        .unwrap();
        let env = || env_of(&[(ENV_STATE, "from-env.json"), (ENV_PARALLELISM, "7")]);

        let settings = Settings::resolve(cwd.path(), None, &Overrides::default(), env()).unwrap();
        assert_eq!(settings.state, cwd.path().join("from-env.json"));
        assert_eq!(settings.parallelism, 7);

        let flags = Overrides {
            config: Some(PathBuf::from("flag.json")),
            state: Some(PathBuf::from("from-flag.json")),
            parallelism: Some(1),
        };
        let settings = Settings::resolve(cwd.path(), None, &flags, env()).unwrap();
        assert_eq!(settings.config, cwd.path().join("flag.json"));
        assert_eq!(settings.state, cwd.path().join("from-flag.json"));
        assert_eq!(settings.parallelism, 1);
    }

    #[test]
    fn test_invalid_parallelism() {
        let cwd = TempDir::new().unwrap();
        for raw in ["zero", "0", "-2"] {
            let env = env_of(&[(ENV_PARALLELISM, raw)]);
            let err = Settings::resolve(cwd.path(), None, &Overrides::default(), env).unwrap_err();
            assert!(err.to_string().contains(ENV_PARALLELISM), "{err:#}");
        }

        let flags = Overrides {
            parallelism: Some(0),
            ..Overrides::default()
        };
        assert!(Settings::resolve(cwd.path(), None, &flags, no_env()).is_err());
    }

    #[test]
    fn test_unknown_settings_key_is_rejected() {
        let cwd = TempDir::new().unwrap();
        fs::write(cwd.path().join(SETTINGS_FILE), "statefile = \"x.json\"\n").unwrap();
        let err = Settings::resolve(cwd.path(), None, &Overrides::default(), no_env()).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse settings file"));
    }

    #[test]
    fn test_expand_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand("~/infra/state.json"), home.join("infra/state.json"));
        assert_eq!(expand("/absolute/path"), PathBuf::from("/absolute/path"));
    }
}
