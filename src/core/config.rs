use std::fs;
use std::path::PathBuf;
use serde::{Serialize, Deserialize};
use tracing::debug;
use crate::core::error::{Error, ErrorKind, Result};

const CONFIG_DIR_NAME: &str = "runbroker";
const CONFIG_EXTENSION: &str = "yml";

/// Metadata store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Journal directory; `None` keeps everything in memory
    pub directory: Option<PathBuf>,
    /// "UTC" or a fixed offset such as "-05:00".
    ///
    /// IANA names like "US/Eastern" are not supported, so daylight saving
    /// changes must be handled by picking the offset in effect.
    pub timezone: String,
    pub compress_journal: bool,
    /// fsync the journal after every appended document
    pub sync_journal: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            directory: None,
            timezone: "UTC".to_string(),
            compress_journal: true,
            sync_journal: false,
        }
    }
}

/// Asset registry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    pub handler_cache_size: usize,
    /// Root prepended to relative resource paths without a root of their own
    pub root: Option<PathBuf>,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        AssetsConfig {
            handler_cache_size: 64,
            root: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub metadatastore: StoreConfig,
    pub assets: AssetsConfig,
    /// Register the built-in handlers on construction
    pub auto_register: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            metadatastore: StoreConfig::default(),
            assets: AssetsConfig::default(),
            auto_register: true,
        }
    }
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Directories searched for named configurations, in priority order:
/// `~/.config/runbroker`, `<exe>/../../etc/runbroker`, `/etc/runbroker`.
pub fn config_search_path() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(PathBuf::from(home).join(".config").join(CONFIG_DIR_NAME));
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(prefix) = exe.parent().and_then(|bin| bin.parent()) {
            paths.push(prefix.join("etc").join(CONFIG_DIR_NAME));
        }
    }
    paths.push(PathBuf::from("/etc").join(CONFIG_DIR_NAME));
    paths
}

/// Names of every configuration found on the search path, sorted
pub fn list_configs() -> Result<Vec<String>> {
    list_configs_in(&config_search_path())
}

pub fn list_configs_in(search_path: &[PathBuf]) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for dir in search_path {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == CONFIG_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Load the first configuration named `name` on the search path
pub fn lookup_config(name: &str) -> Result<Config> {
    lookup_config_in(name, &config_search_path())
}

pub fn lookup_config_in(name: &str, search_path: &[PathBuf]) -> Result<Config> {
    let file_name = if name.ends_with(".yml") {
        name.to_string()
    } else {
        format!("{}.{}", name, CONFIG_EXTENSION)
    };

    let mut tried = Vec::new();
    for dir in search_path {
        let candidate = dir.join(&file_name);
        if candidate.is_file() {
            debug!(path = %candidate.display(), "loading broker configuration");
            let text = fs::read_to_string(&candidate)?;
            return Config::from_yaml(&text);
        }
        tried.push(candidate.display().to_string());
    }

    Err(Error::new(
        ErrorKind::Config,
        format!(
            "No config file named '{}' could be found in the following locations:\n{}",
            file_name,
            tried.join("\n")
        ),
    ))
}

/// Configuration backed by a fresh scratch directory.
///
/// Suitable for testing and experimentation; the directory is not removed
/// automatically.
pub fn temp_config() -> Result<Config> {
    let dir = tempfile::Builder::new()
        .prefix("runbroker-")
        .tempdir()?
        .keep();
    Ok(Config {
        metadatastore: StoreConfig {
            directory: Some(dir.join("metadatastore")),
            ..StoreConfig::default()
        },
        assets: AssetsConfig {
            root: Some(dir.join("assets")),
            ..AssetsConfig::default()
        },
        auto_register: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_defaults_fill_missing_sections() {
        let config = Config::from_yaml("metadatastore:\n  timezone: \"-05:00\"\n").unwrap();
        assert_eq!(config.metadatastore.timezone, "-05:00");
        assert_eq!(config.metadatastore.directory, None);
        assert_eq!(config.assets, AssetsConfig::default());
        assert!(config.auto_register);
    }

    #[test]
    fn test_lookup_and_list_configs() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        fs::write(first.path().join("beamline.yml"), "auto_register: false\n").unwrap();
        fs::write(second.path().join("beamline.yml"), "auto_register: true\n").unwrap();
        fs::write(second.path().join("archive.yml"), "{}\n").unwrap();
        fs::write(second.path().join("notes.txt"), "ignored").unwrap();

        let search = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        let config = lookup_config_in("beamline", &search).unwrap();
        assert!(!config.auto_register, "first match on the search path wins");

        let names = list_configs_in(&search).unwrap();
        assert_eq!(names, vec!["archive", "beamline", "beamline"]);
    }

    #[test]
    fn test_missing_config_lists_tried_locations() {
        let dir = tempfile::tempdir().unwrap();
        let err = lookup_config_in("nope", &[dir.path().to_path_buf()]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
        assert!(err.context.contains("nope.yml"));
    }

    #[test]
    fn test_temp_config_uses_scratch_directories() {
        let config = temp_config().unwrap();
        let directory = config.metadatastore.directory.unwrap();
        assert!(directory.ends_with("metadatastore"));
        assert!(config.assets.root.is_some());
    }
}
