//! Snapshot/restore orchestrator: archive → compress → encrypt, and back.
//!
//! Stages run strictly in sequence. Each one reads the previous stage's
//! closed file and writes exactly one new file; the file it consumed is
//! deleted as soon as the stage succeeds. Every exit path deletes whatever
//! intermediates are still on disk, so after a failure only persisted `.enc`
//! artifacts remain under the root.
//!
//! Restore does not roll back a partially unpacked index directory. A failed
//! unarchive is reported and the caller decides what to do with the tree.

use crate::archive::{self, ArchiveStats};
use crate::compression::{self, Lz4Options, StreamStats};
use crate::config::VaultConfig;
use crate::encryption::{self, EncryptionAlgorithm, KeyMaterial};
use crate::error::{StageError, VaultError};
use crate::layout::{ArtifactKind, IndexSnapshot, VaultLayout, DECRYPTED_STEM};
use crate::lock::ArtifactLocks;
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::task;
use tracing::{debug, error, info, instrument, warn};

/// Pipeline stage, used for logging and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Live index directory → `.tar`
    Archive,
    /// `.tar` → `.tar.lz4`
    Compress,
    /// `.tar.lz4` → `.enc`
    Encrypt,
    /// `.enc` → `decrypted.tar.lz4`
    Decrypt,
    /// `decrypted.tar.lz4` → `decrypted.tar`
    Decompress,
    /// `decrypted.tar` → live index directory
    Unarchive,
}

impl Stage {
    /// Lowercase stage name.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Archive => "archive",
            Stage::Compress => "compress",
            Stage::Encrypt => "encrypt",
            Stage::Decrypt => "decrypt",
            Stage::Decompress => "decompress",
            Stage::Unarchive => "unarchive",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The six blocking file-to-file stage operations.
///
/// Every method must leave its output flushed and closed before returning
/// `Ok`. On `Err` the output may be partial; the orchestrator removes it.
pub trait StageRunner: Send + Sync + 'static {
    /// Serialize `source_dir` into a container at `dest`.
    fn archive(&self, source_dir: &Path, dest: &Path) -> Result<ArchiveStats, StageError>;
    /// LZ4-frame `src` into `dest`.
    fn compress(&self, src: &Path, dest: &Path) -> Result<StreamStats, StageError>;
    /// Seal `src` into an encrypted container at `dest`.
    fn encrypt(&self, src: &Path, dest: &Path, key: &KeyMaterial)
        -> Result<StreamStats, StageError>;
    /// Open the encrypted container at `src` into `dest`.
    fn decrypt(&self, src: &Path, dest: &Path, key: &KeyMaterial)
        -> Result<StreamStats, StageError>;
    /// Strip LZ4 framing from `src` into `dest`.
    fn decompress(&self, src: &Path, dest: &Path) -> Result<StreamStats, StageError>;
    /// Recreate the tree in `container` under `dest_dir`.
    fn unarchive(&self, container: &Path, dest_dir: &Path) -> Result<ArchiveStats, StageError>;
}

/// Stages backed by the crate's archive, compression and encryption modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardStages {
    /// LZ4 frame parameters for new archives
    pub lz4: Lz4Options,
    /// Cipher for new artifacts
    pub algorithm: EncryptionAlgorithm,
    /// Plaintext bytes per sealed chunk
    pub chunk_size: u32,
}

impl StandardStages {
    /// Stage parameters taken from `config`.
    pub fn from_config(config: &VaultConfig) -> Self {
        Self {
            lz4: Lz4Options {
                block_size: config.lz4_block_size,
                content_checksum: config.lz4_checksum,
            },
            algorithm: config.encryption,
            chunk_size: config.chunk_size,
        }
    }
}

impl Default for StandardStages {
    fn default() -> Self {
        Self::from_config(&VaultConfig::default())
    }
}

impl StageRunner for StandardStages {
    fn archive(&self, source_dir: &Path, dest: &Path) -> Result<ArchiveStats, StageError> {
        archive::archive(source_dir, dest)
    }

    fn compress(&self, src: &Path, dest: &Path) -> Result<StreamStats, StageError> {
        compression::compress_file(src, dest, self.lz4)
    }

    fn encrypt(
        &self,
        src: &Path,
        dest: &Path,
        key: &KeyMaterial,
    ) -> Result<StreamStats, StageError> {
        encryption::encrypt_file(src, dest, key, self.algorithm, self.chunk_size)
    }

    fn decrypt(
        &self,
        src: &Path,
        dest: &Path,
        key: &KeyMaterial,
    ) -> Result<StreamStats, StageError> {
        encryption::decrypt_file(src, dest, key)
    }

    fn decompress(&self, src: &Path, dest: &Path) -> Result<StreamStats, StageError> {
        compression::decompress_file(src, dest)
    }

    fn unarchive(&self, container: &Path, dest_dir: &Path) -> Result<ArchiveStats, StageError> {
        archive::unarchive(container, dest_dir)
    }
}

/// Outcome of a successful snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotReport {
    /// Persisted encrypted artifact
    pub artifact: PathBuf,
    /// Entries written to the archive
    pub entries: u64,
    /// Size of the raw archive
    pub archive_bytes: u64,
    /// Size of the compressed archive
    pub compressed_bytes: u64,
    /// Size of the encrypted artifact
    pub encrypted_bytes: u64,
}

/// Outcome of a successful restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    /// Live index directory that was restored
    pub index_dir: PathBuf,
    /// Entries unpacked
    pub entries: u64,
    /// Plaintext bytes recovered from the artifact
    pub decrypted_bytes: u64,
    /// Size of the decompressed archive
    pub archive_bytes: u64,
}

/// Header summary of a persisted artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactInfo {
    /// Artifact path
    pub path: PathBuf,
    /// `<prefix>_<identity>_<format_version>`
    pub container_name: String,
    /// Size on disk
    pub size_bytes: u64,
    /// Cipher the artifact was sealed with
    pub algorithm: EncryptionAlgorithm,
    /// Plaintext bytes per sealed chunk
    pub chunk_size: u32,
}

/// Validate raw key bytes for use with [`Vault::snapshot`] and [`Vault::restore`].
pub fn load_key(bytes: &[u8]) -> Result<KeyMaterial, VaultError> {
    KeyMaterial::from_slice(bytes).map_err(VaultError::InvalidKey)
}

/// Snapshot/restore orchestrator for one vault root.
///
/// Invocations that share artifact names wait for each other; invocations
/// for different identities only contend on the restore scratch files.
#[derive(Debug)]
pub struct Vault<S: StageRunner = StandardStages> {
    layout: VaultLayout,
    stages: Arc<S>,
    locks: ArtifactLocks,
    clear_before_restore: bool,
}

impl Vault<StandardStages> {
    /// Vault over `config` using the standard stages.
    pub fn new(config: &VaultConfig) -> Self {
        Self::with_stages(config, StandardStages::from_config(config))
    }
}

impl<S: StageRunner> Vault<S> {
    /// Vault over `config` with a custom stage implementation.
    pub fn with_stages(config: &VaultConfig, stages: S) -> Self {
        Self {
            layout: VaultLayout::new(config),
            stages: Arc::new(stages),
            locks: ArtifactLocks::new(),
            clear_before_restore: config.clear_before_restore,
        }
    }

    /// Path layout of this vault.
    pub fn layout(&self) -> &VaultLayout {
        &self.layout
    }

    /// Lock table shared by this vault's invocations.
    pub fn locks(&self) -> &ArtifactLocks {
        &self.locks
    }

    /// Archive, compress and encrypt the live index of `identity` into its
    /// persisted artifact, replacing any previous one.
    #[instrument(skip(self, key))]
    pub async fn snapshot(
        &self,
        identity: &str,
        key: &KeyMaterial,
    ) -> Result<SnapshotReport, VaultError> {
        let snap = self.layout.snapshot(identity)?;
        let _held = self.locks.acquire([snap.container_name.clone()]).await;
        sweep_stale_staging(&self.layout.artifact_path(&snap, ArtifactKind::EncryptedStaging))
            .await?;

        if !is_dir(&snap.source_dir).await {
            warn!(path = %snap.source_dir.display(), "live index directory missing");
            return Err(VaultError::SourceMissing {
                path: snap.source_dir,
            });
        }

        let mut scratch = Scratch::default();
        let outcome = self.run_snapshot(&snap, key, &mut scratch).await;
        let outcome = scratch.settle(outcome).await;
        match &outcome {
            Ok(report) => info!(
                artifact = %report.artifact.display(),
                entries = report.entries,
                encrypted_bytes = report.encrypted_bytes,
                "snapshot complete"
            ),
            Err(e) => error!(error = %e, "snapshot failed"),
        }
        outcome
    }

    /// Decrypt, decompress and unpack the persisted artifact of `identity`
    /// into its live index directory.
    #[instrument(skip(self, key))]
    pub async fn restore(
        &self,
        identity: &str,
        key: &KeyMaterial,
    ) -> Result<RestoreReport, VaultError> {
        let snap = self.layout.snapshot(identity)?;
        let _held = self
            .locks
            .acquire([snap.container_name.clone(), DECRYPTED_STEM.to_string()])
            .await;

        let artifact = self.layout.artifact_path(&snap, ArtifactKind::Encrypted);
        if !is_file(&artifact).await {
            warn!(path = %artifact.display(), "encrypted artifact missing");
            return Err(VaultError::ArtifactMissing { path: artifact });
        }

        let mut scratch = Scratch::default();
        let outcome = self.run_restore(&snap, artifact, key, &mut scratch).await;
        let outcome = scratch.settle(outcome).await;
        match &outcome {
            Ok(report) => info!(
                index_dir = %report.index_dir.display(),
                entries = report.entries,
                "restore complete"
            ),
            Err(e) => error!(error = %e, "restore failed"),
        }
        outcome
    }

    /// Read the header of the persisted artifact of `identity`. No key needed.
    pub async fn inspect(&self, identity: &str) -> Result<ArtifactInfo, VaultError> {
        let snap = self.layout.snapshot(identity)?;
        let path = self.layout.artifact_path(&snap, ArtifactKind::Encrypted);
        let size_bytes = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Err(VaultError::ArtifactMissing { path }),
        };

        let header = {
            let path = path.clone();
            task::spawn_blocking(move || encryption::read_header(&path))
                .await
                .map_err(|e| StageError::Interrupted(e.to_string()))
                .and_then(|read| read)
                .map_err(VaultError::DecryptFailed)?
        };

        Ok(ArtifactInfo {
            path,
            container_name: snap.container_name,
            size_bytes,
            algorithm: header.algorithm,
            chunk_size: header.chunk_size,
        })
    }

    /// Whether `identity` has a persisted artifact at the current format version.
    pub async fn artifact_exists(&self, identity: &str) -> Result<bool, VaultError> {
        let snap = self.layout.snapshot(identity)?;
        Ok(is_file(&self.layout.artifact_path(&snap, ArtifactKind::Encrypted)).await)
    }

    async fn run_snapshot(
        &self,
        snap: &IndexSnapshot,
        key: &KeyMaterial,
        scratch: &mut Scratch,
    ) -> Result<SnapshotReport, VaultError> {
        let tar = self.layout.artifact_path(snap, ArtifactKind::Archive);
        let lz4 = self.layout.artifact_path(snap, ArtifactKind::Compressed);
        let staging = self.layout.artifact_path(snap, ArtifactKind::EncryptedStaging);
        let artifact = self.layout.artifact_path(snap, ArtifactKind::Encrypted);

        scratch.track(&tar);
        let archived = {
            let (src, dest) = (snap.source_dir.clone(), tar.clone());
            self.run(Stage::Archive, move |s| s.archive(&src, &dest))
                .await
                .map_err(VaultError::ArchiveFailed)?
        };

        scratch.track(&lz4);
        let compressed = {
            let (src, dest) = (tar.clone(), lz4.clone());
            self.run(Stage::Compress, move |s| s.compress(&src, &dest))
                .await
                .map_err(VaultError::CompressFailed)?
        };
        scratch.consume(&tar).await?;

        scratch.track(&staging);
        let encrypted = {
            let (src, dest, key) = (lz4.clone(), staging.clone(), key.clone());
            self.run(Stage::Encrypt, move |s| s.encrypt(&src, &dest, &key))
                .await
                .map_err(VaultError::EncryptFailed)?
        };
        scratch.consume(&lz4).await?;

        tokio::fs::rename(&staging, &artifact)
            .await
            .map_err(|source| {
                VaultError::EncryptFailed(StageError::WriteFailure {
                    path: artifact.clone(),
                    source,
                })
            })?;
        scratch.release(&staging);

        Ok(SnapshotReport {
            artifact,
            entries: archived.entries,
            archive_bytes: compressed.bytes_in,
            compressed_bytes: compressed.bytes_out,
            encrypted_bytes: encrypted.bytes_out,
        })
    }

    async fn run_restore(
        &self,
        snap: &IndexSnapshot,
        artifact: PathBuf,
        key: &KeyMaterial,
        scratch: &mut Scratch,
    ) -> Result<RestoreReport, VaultError> {
        let decrypted = self
            .layout
            .artifact_path(snap, ArtifactKind::DecryptedCompressed);
        let unpacked = self.layout.artifact_path(snap, ArtifactKind::DecryptedArchive);

        scratch.track(&decrypted);
        let opened = {
            let (src, dest, key) = (artifact, decrypted.clone(), key.clone());
            self.run(Stage::Decrypt, move |s| s.decrypt(&src, &dest, &key))
                .await
                .map_err(VaultError::DecryptFailed)?
        };

        let written = tokio::fs::metadata(&decrypted)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        if written == 0 {
            return Err(VaultError::DecryptFailed(StageError::EmptyOutput {
                path: decrypted,
            }));
        }

        // The decrypted intermediate goes away whether or not decompression worked.
        scratch.track(&unpacked);
        let decompressed = {
            let (src, dest) = (decrypted.clone(), unpacked.clone());
            self.run(Stage::Decompress, move |s| s.decompress(&src, &dest))
                .await
                .map_err(restore_failure)
        };
        let cleaned = scratch.consume(&decrypted).await;
        let decompressed = decompressed?;
        cleaned?;

        if self.clear_before_restore {
            clear_index_dir(&snap.source_dir).await?;
        }

        let unarchived = {
            let (src, dest) = (unpacked.clone(), snap.source_dir.clone());
            self.run(Stage::Unarchive, move |s| s.unarchive(&src, &dest))
                .await
                .map_err(restore_failure)
        };
        let cleaned = scratch.consume(&unpacked).await;
        let unarchived = unarchived?;
        cleaned?;

        Ok(RestoreReport {
            index_dir: snap.source_dir.clone(),
            entries: unarchived.entries,
            decrypted_bytes: opened.bytes_out,
            archive_bytes: decompressed.bytes_out,
        })
    }

    async fn run<T, F>(&self, stage: Stage, job: F) -> Result<T, StageError>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> Result<T, StageError> + Send + 'static,
    {
        let stages = Arc::clone(&self.stages);
        let started = Instant::now();
        debug!(%stage, "stage started");

        let outcome = task::spawn_blocking(move || job(&stages))
            .await
            .map_err(|e| StageError::Interrupted(format!("{} stage: {}", stage, e)))?;

        match &outcome {
            Ok(_) => debug!(
                %stage,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "stage finished"
            ),
            Err(e) => warn!(%stage, error = %e, "stage failed"),
        }
        outcome
    }
}

/// Intermediates this invocation has created and not yet deleted.
#[derive(Debug, Default)]
struct Scratch {
    live: Vec<PathBuf>,
}

impl Scratch {
    fn track(&mut self, path: &Path) {
        self.live.push(path.to_path_buf());
    }

    fn release(&mut self, path: &Path) {
        self.live.retain(|p| p != path);
    }

    /// Delete a consumed intermediate now.
    async fn consume(&mut self, path: &Path) -> Result<(), VaultError> {
        remove_intermediate(path).await?;
        self.release(path);
        Ok(())
    }

    /// Delete everything still tracked. A cleanup failure only becomes the
    /// result when the pipeline itself succeeded.
    async fn settle<T>(self, outcome: Result<T, VaultError>) -> Result<T, VaultError> {
        let mut outcome = outcome;
        for path in &self.live {
            if let Err(cleanup) = remove_intermediate(path).await {
                if outcome.is_ok() {
                    outcome = Err(cleanup);
                } else {
                    warn!(error = %cleanup, "cleanup failed after pipeline error");
                }
            }
        }
        outcome
    }
}

async fn remove_intermediate(path: &Path) -> Result<(), VaultError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "removed intermediate");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(VaultError::CleanupFailed {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Remove a staging file left behind by an interrupted snapshot. Only called
/// while the container lock is held, so no live invocation owns it.
async fn sweep_stale_staging(staging: &Path) -> Result<(), VaultError> {
    if is_file(staging).await {
        warn!(path = %staging.display(), "removing stale staging artifact");
        remove_intermediate(staging).await?;
    }
    Ok(())
}

async fn clear_index_dir(dir: &Path) -> Result<(), VaultError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {
            info!(dir = %dir.display(), "cleared live index directory");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(VaultError::UnpackFailed(StageError::WriteFailure {
            path: dir.to_path_buf(),
            source,
        })),
    }
}

/// Classify a decompress or unarchive failure. Only malformed container
/// contents count as corruption; local I/O on the intermediates does not.
fn restore_failure(err: StageError) -> VaultError {
    if matches!(
        err,
        StageError::WriteFailure { .. }
            | StageError::ReadFailure { .. }
            | StageError::SourceNotFound { .. }
            | StageError::Io(_)
            | StageError::Interrupted(_)
    ) {
        VaultError::UnpackFailed(err)
    } else {
        VaultError::CorruptContainer(err)
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_restore_failure_classification() {
        let write = StageError::WriteFailure {
            path: PathBuf::from("/x"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert!(matches!(
            restore_failure(write),
            VaultError::UnpackFailed(_)
        ));
        assert!(matches!(
            restore_failure(StageError::MalformedCompressedData("bad".into())),
            VaultError::CorruptContainer(_)
        ));
        assert!(matches!(
            restore_failure(StageError::CorruptContainer("bad".into())),
            VaultError::CorruptContainer(_)
        ));
    }

    #[test]
    fn test_local_read_errors_are_not_corruption() {
        let read = StageError::ReadFailure {
            path: PathBuf::from("/vault/decrypted.tar"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert!(matches!(restore_failure(read), VaultError::UnpackFailed(_)));
        let missing = StageError::SourceNotFound {
            path: PathBuf::from("/vault/decrypted.tar.lz4"),
        };
        assert!(matches!(
            restore_failure(missing),
            VaultError::UnpackFailed(_)
        ));
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Decompress.to_string(), "decompress");
        assert_eq!(Stage::Archive.as_str(), "archive");
    }

    #[test]
    fn test_standard_stages_follow_config() {
        let mut config = VaultConfig::with_root("/vault");
        config.chunk_size = 4096;
        config.encryption = EncryptionAlgorithm::ChaCha20Poly1305;
        config.lz4_checksum = false;
        let stages = StandardStages::from_config(&config);
        assert_eq!(stages.chunk_size, 4096);
        assert_eq!(stages.algorithm, EncryptionAlgorithm::ChaCha20Poly1305);
        assert!(!stages.lz4.content_checksum);
    }

    #[test]
    fn test_load_key_rejects_wrong_length() {
        assert!(matches!(
            load_key(&[0u8; 16]),
            Err(VaultError::InvalidKey(StageError::InvalidKey { len: 16 }))
        ));
        assert!(load_key(&[7u8; 32]).is_ok());
    }

    #[tokio::test]
    async fn test_settle_removes_tracked_files() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.tar");
        let b = dir.path().join("b.tar.lz4");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();

        let mut scratch = Scratch::default();
        scratch.track(&a);
        scratch.track(&b);
        scratch.track(&dir.path().join("never-created"));
        let outcome = scratch.settle(Ok(5u32)).await;

        assert_eq!(outcome.unwrap(), 5);
        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[tokio::test]
    async fn test_settle_keeps_primary_error() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be removed with remove_file.
        let stuck = dir.path().join("stuck.tar");
        std::fs::create_dir(&stuck).unwrap();

        let mut scratch = Scratch::default();
        scratch.track(&stuck);
        let outcome: Result<(), VaultError> = scratch
            .settle(Err(VaultError::CompressFailed(StageError::Truncated)))
            .await;
        assert!(matches!(outcome, Err(VaultError::CompressFailed(_))));

        let mut scratch = Scratch::default();
        scratch.track(&stuck);
        let outcome = scratch.settle(Ok(())).await;
        assert!(matches!(outcome, Err(VaultError::CleanupFailed { .. })));
    }

    #[tokio::test]
    async fn test_consume_releases_path() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.tar");
        std::fs::write(&a, b"a").unwrap();

        let mut scratch = Scratch::default();
        scratch.track(&a);
        scratch.consume(&a).await.unwrap();
        assert!(!a.exists());
        assert!(scratch.live.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_identity_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let vault = Vault::new(&VaultConfig::with_root(dir.path()));
        let key = KeyMaterial::generate();
        assert!(matches!(
            vault.snapshot("../escape", &key).await,
            Err(VaultError::InvalidIdentity { .. })
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
