//! Multi-file configuration loading.
//!
//! Files are merged in the order given; a directory contributes its YAML
//! files in name order. Entities and views must be unique across files.
//! Problems from every file are reported together.

use std::path::Path;

use super::{Config, ConfigPath, is_yaml_file};
use crate::error::ConfigError;

/// Load and merge configuration without validating the result.
pub fn load_from_paths(paths: &[ConfigPath]) -> Result<Config, ConfigError> {
    let mut config = Config::default();
    let mut errors = Vec::new();

    for source in paths {
        let partial = match source {
            ConfigPath::File(path) => load_file(path),
            ConfigPath::Dir(path) => load_dir(path),
        };
        match partial.and_then(|partial| config.merge(partial)) {
            Ok(()) => {}
            Err(ConfigError::MultipleErrors { errors: nested }) => errors.extend(nested),
            Err(e) => errors.push(format!("{}: {e}", source.path().display())),
        }
    }

    if !errors.is_empty() {
        return Err(ConfigError::MultipleErrors { errors });
    }
    Ok(config)
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    if !is_yaml_file(path) {
        return Err(ConfigError::UnsupportedFormat {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    Config::parse_yaml(&contents)
}

fn load_dir(dir: &Path) -> Result<Config, ConfigError> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .map_err(|source| ConfigError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_yaml_file(path))
        .collect();
    files.sort();

    let mut config = Config::default();
    let mut errors = Vec::new();
    for path in files {
        if let Err(e) = load_file(&path).and_then(|partial| config.merge(partial)) {
            errors.push(format!("{}: {e}", path.display()));
        }
    }

    if !errors.is_empty() {
        return Err(ConfigError::MultipleErrors { errors });
    }
    Ok(config)
}
