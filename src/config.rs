use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use xdg::BaseDirectories;

use crate::artifacts;

const CONFIG_FILE: &str = "pipeline_config.json";

/// Where a loaded configuration came from, reported once logging is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    Custom(PathBuf),
    Stored(PathBuf),
    Seeded(PathBuf),
}

impl fmt::Display for ConfigOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigOrigin::Custom(p) | ConfigOrigin::Stored(p) => {
                write!(f, "loaded configuration from {}", p.display())
            }
            ConfigOrigin::Seeded(p) => write!(f, "stored default configuration in {}", p.display()),
        }
    }
}

/// Reads `custom_path` when given. Otherwise reads `testsift/pipeline_config.json`
/// from the XDG config directories, writing the defaults there first if it
/// does not exist yet.
pub fn load_configuration(custom_path: Option<&Path>) -> Result<(PipelineConfig, ConfigOrigin)> {
    if let Some(p) = custom_path {
        let config = artifacts::read_json(p, "Config file")?;
        return Ok((config, ConfigOrigin::Custom(p.to_owned())));
    }

    let dirs = BaseDirectories::with_prefix("testsift")?;
    match dirs.find_config_file(CONFIG_FILE) {
        Some(p) => Ok((artifacts::read_json(&p, "Config file")?, ConfigOrigin::Stored(p))),
        None => {
            let p = dirs.place_config_file(CONFIG_FILE)?;
            let config = PipelineConfig::default();
            artifacts::write_json(&p, &config)?;
            Ok((config, ConfigOrigin::Seeded(p)))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FormatterConfig {
    Lexical,
    Command { command: String },
}

impl Default for FormatterConfig {
    fn default() -> Self {
        FormatterConfig::Lexical
    }
}

/// Locations of the pipeline inputs and artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub repos_file: PathBuf,
    pub clones_dir: PathBuf,
    pub dataset_dir: PathBuf,
    pub log_dir: PathBuf,
    pub formatter: FormatterConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            repos_file: PathBuf::from("../repos_with_tests.txt"),
            clones_dir: PathBuf::from("../clones"),
            dataset_dir: PathBuf::from("../dataset"),
            log_dir: PathBuf::from("../logs"),
            formatter: FormatterConfig::default(),
        }
    }
}
