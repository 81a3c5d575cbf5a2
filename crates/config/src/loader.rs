use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::OpsentryConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["opsentry.toml", "opsentry.yaml", "opsentry.yml", "opsentry.json"];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<OpsentryConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./opsentry.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/opsentry/opsentry.{toml,yaml,yml,json}` (user-global)
///
/// Returns `OpsentryConfig::default()` if no config file is found.
pub fn discover_and_load() -> OpsentryConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    OpsentryConfig::default()
}

/// Find the first config file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    if let Some(dirs) = directories::ProjectDirs::from("", "", "opsentry") {
        let config_dir = dirs.config_dir();
        for name in CONFIG_FILENAMES {
            let p = config_dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }

    None
}

/// Returns the user-global config directory (`~/.config/opsentry/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "opsentry").map(|d| d.config_dir().to_path_buf())
}

/// Returns the user-global data directory, used by the preference store for
/// its persisted JSON document.
pub fn data_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "opsentry").map(|d| d.data_dir().to_path_buf())
}

/// Returns the path of an existing config file, or the default TOML path.
pub fn find_or_default_config_path() -> PathBuf {
    if let Some(path) = find_config_file() {
        return path;
    }
    config_dir().unwrap_or_else(|| PathBuf::from(".")).join("opsentry.toml")
}

/// Serialize `config` to TOML and write it to the user-global config path.
///
/// Creates parent directories if needed. Returns the path written to.
pub fn save_config(config: &OpsentryConfig) -> anyhow::Result<PathBuf> {
    let path = find_or_default_config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("serialize config: {e}"))?;
    std::fs::write(&path, toml_str)?;
    debug!(path = %path.display(), "saved config");
    Ok(path)
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<OpsentryConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("opsentry.toml");
        let cfg = OpsentryConfig::default();
        std::fs::write(&path, toml::to_string_pretty(&cfg).expect("serialize")).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded.api_port, cfg.api_port);
        assert_eq!(loaded.approval_timeout, cfg.approval_timeout);
    }

    #[test]
    fn missing_file_errors() {
        let missing = PathBuf::from("/nonexistent/opsentry.toml");
        assert!(load_config(&missing).is_err());
    }
}
