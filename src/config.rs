use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::db::{BlobLimits, DEFAULT_MAX_BLOB_BYTES, DEFAULT_SNIFF_BYTES};
use crate::model::DELETE_TAG;

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "IMAGEDB_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub blobs: BlobConfig,

    #[serde(default)]
    pub duplicates: DuplicatesConfig,

    #[serde(default)]
    pub sweep: SweepConfig,

    #[serde(default)]
    pub import: ImportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    #[serde(default = "default_blob_path")]
    pub path: PathBuf,

    /// Largest accepted upload. 0 disables the cap.
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,

    #[serde(default = "default_sniff_bytes")]
    pub sniff_bytes: usize,
}

fn default_blob_path() -> PathBuf {
    data_dir().join("blobs")
}

fn default_max_size_bytes() -> u64 {
    DEFAULT_MAX_BLOB_BYTES // 4 MiB
}

fn default_sniff_bytes() -> usize {
    DEFAULT_SNIFF_BYTES
}

impl BlobConfig {
    pub fn limits(&self) -> BlobLimits {
        BlobLimits {
            max_size_bytes: (self.max_size_bytes > 0).then_some(self.max_size_bytes),
            sniff_bytes: self.sniff_bytes.max(1),
        }
    }
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            path: default_blob_path(),
            max_size_bytes: default_max_size_bytes(),
            sniff_bytes: default_sniff_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicatesConfig {
    /// Records carrying any of these tags are left out of duplicate detection.
    #[serde(default = "default_exclude_tags")]
    pub exclude_tags: Vec<String>,

    /// Tag given to the losing members of a merged group.
    #[serde(default = "default_delete_tag")]
    pub delete_tag: String,
}

fn default_exclude_tags() -> Vec<String> {
    vec![DELETE_TAG.to_string()]
}

fn default_delete_tag() -> String {
    DELETE_TAG.to_string()
}

impl Default for DuplicatesConfig {
    fn default() -> Self {
        Self {
            exclude_tags: default_exclude_tags(),
            delete_tag: default_delete_tag(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Delete blobs left unreferenced by a sweep.
    #[serde(default = "default_reap_blobs")]
    pub reap_blobs: bool,
}

fn default_reap_blobs() -> bool {
    true
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            reap_blobs: default_reap_blobs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Extensions picked up when a directory is imported.
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff"]
        .iter()
        .map(|e| e.to_string())
        .collect()
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            image_extensions: default_image_extensions(),
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("imagedb")
}

fn default_db_path() -> PathBuf {
    data_dir().join("imagedb.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            blobs: BlobConfig::default(),
            duplicates: DuplicatesConfig::default(),
            sweep: SweepConfig::default(),
            import: ImportConfig::default(),
        }
    }
}

impl Config {
    /// Load from `path`, `$IMAGEDB_CONFIG`, or the user config directory,
    /// in that order of preference.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var_os(CONFIG_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(Self::config_path),
        };
        Self::load_from(&path)
    }

    /// Read the config at `path`, writing defaults there if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config {}", path.display()))?;
            Ok(config)
        } else {
            // Create default config
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config {}", path.display()))?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("imagedb")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_config_is_created_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.blobs.max_size_bytes, 4 * 1024 * 1024);
        assert_eq!(config.duplicates.delete_tag, "_delete");
        assert!(config.sweep.reap_blobs);

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.db_path, config.db_path);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "db_path = \"/tmp/images.db\"\n\n[blobs]\nmax_size_bytes = 0\n\n[sweep]\nreap_blobs = false\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/images.db"));
        assert_eq!(config.blobs.sniff_bytes, 512);
        assert_eq!(config.blobs.limits().max_size_bytes, None);
        assert!(!config.sweep.reap_blobs);
        assert_eq!(config.duplicates.exclude_tags, vec!["_delete".to_string()]);
        assert!(config.import.image_extensions.contains(&"png".to_string()));
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "db_path = [").unwrap();

        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_default_limits() {
        let limits = BlobConfig::default().limits();
        assert_eq!(limits, BlobLimits::default());
    }
}
