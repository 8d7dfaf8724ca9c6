//! Artifact naming and on-disk layout under the configured root.
//!
//! ```text
//! <root>/<data_dir>/<container>      live index directory
//! <root>/<container>.tar             transient archive (snapshot)
//! <root>/<container>.tar.lz4         transient compressed archive (snapshot)
//! <root>/<container>.enc.tmp         encrypted output before it is committed
//! <root>/<container>.enc             persisted encrypted artifact
//! <root>/decrypted.tar.lz4           transient decrypted artifact (restore)
//! <root>/decrypted.tar               transient decompressed archive (restore)
//! ```
//!
//! `container = <prefix>_<identity>_<format_version>`.

use crate::config::VaultConfig;
use crate::error::VaultError;
use std::path::{Path, PathBuf};

/// Extension of the raw archive.
pub const TAR_EXT: &str = ".tar";
/// Extension of the compressed archive.
pub const TAR_LZ4_EXT: &str = ".tar.lz4";
/// Extension of the persisted encrypted artifact.
pub const ENC_EXT: &str = ".enc";
/// Extension of an encrypted artifact that has not been committed yet.
pub const ENC_STAGING_EXT: &str = ".enc.tmp";
/// Base name of the restore intermediates.
pub const DECRYPTED_STEM: &str = "decrypted";

/// Kinds of file a pipeline invocation produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Raw tar container of the index tree
    Archive,
    /// LZ4-framed tar container
    Compressed,
    /// Encrypted output still being written
    EncryptedStaging,
    /// Final persisted encrypted artifact
    Encrypted,
    /// Decrypted, still compressed container (restore)
    DecryptedCompressed,
    /// Decrypted and decompressed container (restore)
    DecryptedArchive,
}

impl ArtifactKind {
    /// True for everything except the persisted artifact.
    pub fn is_intermediate(self) -> bool {
        !matches!(self, ArtifactKind::Encrypted)
    }
}

/// Resolves paths for the vault root.
#[derive(Debug, Clone)]
pub struct VaultLayout {
    root: PathBuf,
    data_dir: PathBuf,
    name_prefix: String,
    format_version: String,
}

impl VaultLayout {
    /// Build the layout described by `config`.
    pub fn new(config: &VaultConfig) -> Self {
        Self {
            root: config.root.clone(),
            data_dir: config.root.join(&config.data_dir_name),
            name_prefix: config.name_prefix.clone(),
            format_version: config.format_version.clone(),
        }
    }

    /// Root storage path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the live index folders.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Format version tag embedded in every name.
    pub fn format_version(&self) -> &str {
        &self.format_version
    }

    /// Resolve the snapshot entity for `identity`.
    pub fn snapshot(&self, identity: &str) -> Result<IndexSnapshot, VaultError> {
        validate_identity(identity)?;
        let container_name = format!(
            "{}_{}_{}",
            self.name_prefix, identity, self.format_version
        );
        Ok(IndexSnapshot {
            identity: identity.to_string(),
            format_version: self.format_version.clone(),
            source_dir: self.data_dir.join(&container_name),
            container_name,
        })
    }

    /// Path of the `kind` artifact for `snap`. Restore scratch kinds are
    /// shared by every identity under this root.
    pub fn artifact_path(&self, snap: &IndexSnapshot, kind: ArtifactKind) -> PathBuf {
        let name = match kind {
            ArtifactKind::Archive => format!("{}{}", snap.container_name, TAR_EXT),
            ArtifactKind::Compressed => format!("{}{}", snap.container_name, TAR_LZ4_EXT),
            ArtifactKind::EncryptedStaging => format!("{}{}", snap.container_name, ENC_STAGING_EXT),
            ArtifactKind::Encrypted => format!("{}{}", snap.container_name, ENC_EXT),
            ArtifactKind::DecryptedCompressed => format!("{}{}", DECRYPTED_STEM, TAR_LZ4_EXT),
            ArtifactKind::DecryptedArchive => format!("{}{}", DECRYPTED_STEM, TAR_EXT),
        };
        self.root.join(name)
    }

    /// True if `file_name` is one of the transient names this layout produces.
    pub fn is_transient_name(file_name: &str) -> bool {
        file_name.ends_with(TAR_EXT)
            || file_name.ends_with(TAR_LZ4_EXT)
            || file_name.ends_with(ENC_STAGING_EXT)
    }
}

fn validate_identity(identity: &str) -> Result<(), VaultError> {
    let reason = if identity.is_empty() {
        Some("empty")
    } else if identity.contains(['/', '\\', '\0']) {
        Some("contains a path separator or NUL")
    } else if identity == "." || identity == ".." {
        Some("is a relative path component")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(VaultError::InvalidIdentity {
            identity: identity.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// One identity's index at one format version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSnapshot {
    /// Owning identity
    pub identity: String,
    /// Format version tag
    pub format_version: String,
    /// Live index directory
    pub source_dir: PathBuf,
    /// `<prefix>_<identity>_<format_version>`
    pub container_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> VaultLayout {
        VaultLayout::new(&VaultConfig::with_root("/vault"))
    }

    #[test]
    fn test_container_name_is_deterministic() {
        let a = layout().snapshot("alice").unwrap();
        let b = layout().snapshot("alice").unwrap();
        assert_eq!(a.container_name, "search_index_alice_v1");
        assert_eq!(a, b);
    }

    #[test]
    fn test_paths() {
        let layout = layout();
        let snap = layout.snapshot("u1").unwrap();
        assert_eq!(
            snap.source_dir,
            PathBuf::from("/vault/data/search_index_u1_v1")
        );
        let expect = [
            (ArtifactKind::Archive, "/vault/search_index_u1_v1.tar"),
            (ArtifactKind::Compressed, "/vault/search_index_u1_v1.tar.lz4"),
            (ArtifactKind::EncryptedStaging, "/vault/search_index_u1_v1.enc.tmp"),
            (ArtifactKind::Encrypted, "/vault/search_index_u1_v1.enc"),
            (ArtifactKind::DecryptedCompressed, "/vault/decrypted.tar.lz4"),
            (ArtifactKind::DecryptedArchive, "/vault/decrypted.tar"),
        ];
        for (kind, path) in expect {
            assert_eq!(layout.artifact_path(&snap, kind), PathBuf::from(path));
        }
    }

    #[test]
    fn test_restore_scratch_is_shared_across_identities() {
        let layout = layout();
        let a = layout.snapshot("a").unwrap();
        let b = layout.snapshot("b").unwrap();
        assert_eq!(
            layout.artifact_path(&a, ArtifactKind::DecryptedCompressed),
            layout.artifact_path(&b, ArtifactKind::DecryptedCompressed)
        );
        assert_ne!(
            layout.artifact_path(&a, ArtifactKind::Encrypted),
            layout.artifact_path(&b, ArtifactKind::Encrypted)
        );
    }

    #[test]
    fn test_transient_names() {
        assert!(VaultLayout::is_transient_name("x_u_v1.tar"));
        assert!(VaultLayout::is_transient_name("decrypted.tar.lz4"));
        assert!(VaultLayout::is_transient_name("x_u_v1.enc.tmp"));
        assert!(!VaultLayout::is_transient_name("x_u_v1.enc"));
    }

    #[test]
    fn test_version_changes_name() {
        let mut config = VaultConfig::with_root("/vault");
        config.format_version = "v2".to_string();
        let snap = VaultLayout::new(&config).snapshot("u1").unwrap();
        assert_eq!(snap.container_name, "search_index_u1_v2");
    }

    #[test]
    fn test_invalid_identities_rejected() {
        for bad in ["", "..", ".", "a/b", "a\\b", "nul\0"] {
            assert!(
                matches!(
                    layout().snapshot(bad),
                    Err(VaultError::InvalidIdentity { .. })
                ),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_intermediate_kinds() {
        assert!(ArtifactKind::Archive.is_intermediate());
        assert!(ArtifactKind::DecryptedArchive.is_intermediate());
        assert!(!ArtifactKind::Encrypted.is_intermediate());
    }
}
