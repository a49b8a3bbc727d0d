// ⚙️ Configuration - unmerge.toml
//
// Every key is optional; a missing file means all defaults.

use crate::bitmap::BitmapCodec;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "unmerge.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// SQLite file holding registry and classification tables
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Where worksheets are written and read
    #[serde(default = "default_workbook_dir")]
    pub workbook_dir: PathBuf,

    /// Where processing summaries land
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default)]
    pub markers: MarkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: default_database(),
            workbook_dir: default_workbook_dir(),
            output_dir: default_output_dir(),
            markers: MarkerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerConfig {
    #[serde(default = "default_present")]
    pub present: char,
    #[serde(default = "default_absent")]
    pub absent: char,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            present: default_present(),
            absent: default_absent(),
        }
    }
}

fn default_database() -> PathBuf {
    PathBuf::from("unmerge.db")
}

fn default_workbook_dir() -> PathBuf {
    PathBuf::from("workbooks")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_present() -> char {
    '#'
}

fn default_absent() -> char {
    '_'
}

impl Config {
    pub fn codec(&self) -> BitmapCodec {
        BitmapCodec {
            present: self.markers.present,
            absent: self.markers.absent,
        }
    }

    /// Default worksheet path for a kind.
    pub fn workbook_path(&self, kind: &str) -> PathBuf {
        self.workbook_dir
            .join(format!("unmerge_workbook_{}.csv", kind))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<Config>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}
