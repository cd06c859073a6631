//! Configuration loading from `~/.aip/config.toml` with defaults.
//!
//! Supports config includes: the `include` field lists additional TOML files
//! that are deep-merged before the root config (root overrides includes).

use aip_types::config::AipConfig;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

/// Maximum include nesting depth.
const MAX_INCLUDE_DEPTH: u32 = 10;

/// Load configuration and apply `AIP_*` environment overrides.
pub fn load(path: Option<&Path>) -> AipConfig {
    let mut config = load_config(path);
    config.apply_env_overrides();
    config
}

/// Load configuration from a TOML file, with defaults.
///
/// A missing, unreadable or malformed file logs a warning and yields the
/// defaults. Failed include resolution keeps the root file alone.
pub fn load_config(path: Option<&Path>) -> AipConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return AipConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            return AipConfig::default();
        }
    };
    let mut root_value = match toml::from_str::<toml::Value>(&contents) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to parse config, using defaults"
            );
            return AipConfig::default();
        }
    };

    let config_dir = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let mut visited = HashSet::new();
    visited.insert(std::fs::canonicalize(&config_path).unwrap_or_else(|_| config_path.clone()));
    if let Err(e) = resolve_config_includes(&mut root_value, &config_dir, &mut visited, 0) {
        tracing::warn!(error = %e, "Config include resolution failed, using root config only");
    }
    if let toml::Value::Table(ref mut tbl) = root_value {
        tbl.remove("include");
    }

    match root_value.try_into::<AipConfig>() {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to deserialize merged config, using defaults"
            );
            AipConfig::default()
        }
    }
}

/// Deep-merge included files into `root_value`, root last.
///
/// Rejects absolute paths, `..` components, paths escaping the config
/// directory, and circular references.
fn resolve_config_includes(
    root_value: &mut toml::Value,
    config_dir: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> Result<(), String> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(format!(
            "Config include depth exceeded maximum of {MAX_INCLUDE_DEPTH}"
        ));
    }

    let includes: Vec<String> = match root_value {
        toml::Value::Table(tbl) => match tbl.get("include") {
            Some(toml::Value::Array(arr)) => arr
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => return Ok(()),
        },
        _ => return Ok(()),
    };
    if includes.is_empty() {
        return Ok(());
    }

    let canonical_dir = std::fs::canonicalize(config_dir)
        .map_err(|e| format!("Config dir cannot be canonicalized: {e}"))?;
    let mut merged_base = toml::Value::Table(toml::map::Map::new());

    for include in &includes {
        let include_path = Path::new(include);
        if include_path.is_absolute() {
            return Err(format!("Config include rejects absolute path: {include}"));
        }
        if include_path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(format!("Config include rejects path traversal: {include}"));
        }

        let canonical = std::fs::canonicalize(config_dir.join(include_path))
            .map_err(|e| format!("Config include '{include}' cannot be resolved: {e}"))?;
        if !canonical.starts_with(&canonical_dir) {
            return Err(format!("Config include '{include}' escapes config directory"));
        }
        if !visited.insert(canonical.clone()) {
            return Err(format!("Circular config include detected: {include}"));
        }

        info!(include = %include, "Loading config include");
        let contents = std::fs::read_to_string(&canonical)
            .map_err(|e| format!("Failed to read config include '{include}': {e}"))?;
        let mut include_value: toml::Value = toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config include '{include}': {e}"))?;

        let include_dir = canonical.parent().unwrap_or(config_dir).to_path_buf();
        resolve_config_includes(&mut include_value, &include_dir, visited, depth + 1)?;
        if let toml::Value::Table(ref mut tbl) = include_value {
            tbl.remove("include");
        }
        deep_merge_toml(&mut merged_base, &include_value);
    }

    let mut root_without_include = root_value.clone();
    if let toml::Value::Table(ref mut tbl) = root_without_include {
        tbl.remove("include");
    }
    deep_merge_toml(&mut merged_base, &root_without_include);
    *root_value = merged_base;
    Ok(())
}

/// Deep-merge two TOML values. Tables merge recursively; anything else in
/// `overlay` replaces `base`.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, overlay_val) in overlay_tbl {
                match base_tbl.get_mut(key) {
                    Some(base_val) => deep_merge_toml(base_val, overlay_val),
                    None => {
                        base_tbl.insert(key.clone(), overlay_val.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// `~/.aip`, or the temp dir when there is no home.
pub fn aip_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".aip")
}

pub fn default_config_path() -> PathBuf {
    aip_home().join("config.toml")
}
