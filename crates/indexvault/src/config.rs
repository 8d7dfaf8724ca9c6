//! Vault configuration: storage root, naming, and stream parameters.

use crate::compression::Lz4BlockSize;
use crate::encryption::{EncryptionAlgorithm, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration consumed by the vault. Usually loaded from a TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Root storage path; artifacts live directly under it
    pub root: PathBuf,
    /// Directory under `root` that holds live index folders
    pub data_dir_name: String,
    /// Prefix of every container name
    pub name_prefix: String,
    /// Format version tag embedded in container names
    pub format_version: String,
    /// Minimum free disk space required before a snapshot (checked by the caller)
    pub min_free_bytes: u64,
    /// AEAD cipher for newly written artifacts
    pub encryption: EncryptionAlgorithm,
    /// Plaintext bytes per sealed AEAD chunk
    pub chunk_size: u32,
    /// LZ4 frame block size
    pub lz4_block_size: Lz4BlockSize,
    /// Whether LZ4 frames carry a content checksum
    pub lz4_checksum: bool,
    /// Remove the live index directory before unpacking a restore
    pub clear_before_restore: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./indexvault"),
            data_dir_name: "data".to_string(),
            name_prefix: "search_index".to_string(),
            format_version: "v1".to_string(),
            min_free_bytes: 300_000_000,
            encryption: EncryptionAlgorithm::default(),
            chunk_size: 64 * 1024,
            lz4_block_size: Lz4BlockSize::default(),
            lz4_checksum: true,
            clear_before_restore: false,
        }
    }
}

impl VaultConfig {
    /// Default configuration rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Load from a `.toml` or `.json` file, chosen by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: VaultConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would produce unusable names or streams.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (field, value) in [
            ("data_dir_name", &self.data_dir_name),
            ("name_prefix", &self.name_prefix),
            ("format_version", &self.format_version),
        ] {
            if value.is_empty() {
                anyhow::bail!("{} must not be empty", field);
            }
            if value.contains(['/', '\\']) || value == ".." || value == "." {
                anyhow::bail!("{} must be a single path component: {:?}", field, value);
            }
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            anyhow::bail!(
                "chunk_size {} outside {}..={}",
                self.chunk_size,
                MIN_CHUNK_SIZE,
                MAX_CHUNK_SIZE
            );
        }
        Ok(())
    }
}
