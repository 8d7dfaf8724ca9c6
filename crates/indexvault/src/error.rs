//! Error types for the indexvault snapshot/restore pipeline

use std::path::PathBuf;

/// Errors raised by a single pipeline stage (archiver, compressor, encryptor).
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// The directory or file a stage reads from does not exist
    #[error("Source not found: {}", path.display())]
    SourceNotFound {
        /// Missing path
        path: PathBuf,
    },
    /// Reading stage input failed
    #[error("Read failed on {}: {source}", path.display())]
    ReadFailure {
        /// Path being read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
    /// Writing stage output failed
    #[error("Write failed on {}: {source}", path.display())]
    WriteFailure {
        /// Path being written
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
    /// The tar container could not be parsed
    #[error("Corrupt container: {0}")]
    CorruptContainer(String),
    /// The input is not a valid LZ4 frame sequence
    #[error("Malformed compressed data: {0}")]
    MalformedCompressedData(String),
    /// Key material has the wrong length for the cipher family
    #[error("Invalid key: expected 32 bytes, got {len}")]
    InvalidKey {
        /// Length of the rejected key
        len: usize,
    },
    /// AEAD tag mismatch: the stream was tampered with or the key is wrong
    #[error("Authentication failed: ciphertext tampered or wrong key")]
    AuthenticationFailure,
    /// The AEAD primitive refused to seal a chunk
    #[error("Cipher failure: {0}")]
    CipherFailure(String),
    /// Encrypted container header is not one we can read
    #[error("Unsupported encrypted container: {0}")]
    UnsupportedFormat(String),
    /// The encrypted stream ended without its final chunk
    #[error("Encrypted stream truncated")]
    Truncated,
    /// A stage completed but produced no output
    #[error("Stage produced empty output: {}", path.display())]
    EmptyOutput {
        /// Path of the empty output
        path: PathBuf,
    },
    /// I/O error on a stream sink
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The blocking task running the stage panicked or was cancelled
    #[error("Stage task interrupted: {0}")]
    Interrupted(String),
}

/// Terminal result of a snapshot or restore invocation.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Live index directory for the identity does not exist
    #[error("Index source missing: {}", path.display())]
    SourceMissing {
        /// Expected live index directory
        path: PathBuf,
    },
    /// Persisted encrypted artifact for the identity does not exist
    #[error("Encrypted artifact missing: {}", path.display())]
    ArtifactMissing {
        /// Expected artifact path
        path: PathBuf,
    },
    /// Archiving the live index failed
    #[error("Archive stage failed: {0}")]
    ArchiveFailed(#[source] StageError),
    /// Compressing the archive failed
    #[error("Compress stage failed: {0}")]
    CompressFailed(#[source] StageError),
    /// Encrypting the compressed archive failed
    #[error("Encrypt stage failed: {0}")]
    EncryptFailed(#[source] StageError),
    /// Decrypting the artifact failed (I/O or integrity)
    #[error("Decrypt stage failed: {0}")]
    DecryptFailed(#[source] StageError),
    /// The decrypted payload could not be decompressed or parsed as a container
    #[error("Corrupt container: {0}")]
    CorruptContainer(#[source] StageError),
    /// Writing the restored tree into the live index directory failed
    #[error("Unpack into index directory failed: {0}")]
    UnpackFailed(#[source] StageError),
    /// Key material rejected before any output was produced
    #[error("Invalid key material: {0}")]
    InvalidKey(#[source] StageError),
    /// Identity cannot be embedded in an artifact name
    #[error("Invalid identity {identity:?}: {reason}")]
    InvalidIdentity {
        /// Rejected identity
        identity: String,
        /// Why it was rejected
        reason: &'static str,
    },
    /// A consumed intermediate could not be deleted
    #[error("Cleanup failed for {}: {source}", path.display())]
    CleanupFailed {
        /// Intermediate that is still on disk
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl VaultError {
    /// Underlying stage error, if this failure came from a stage.
    pub fn stage_error(&self) -> Option<&StageError> {
        match self {
            VaultError::ArchiveFailed(e)
            | VaultError::CompressFailed(e)
            | VaultError::EncryptFailed(e)
            | VaultError::DecryptFailed(e)
            | VaultError::CorruptContainer(e)
            | VaultError::UnpackFailed(e)
            | VaultError::InvalidKey(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StageError> for std::io::Error {
    fn from(err: StageError) -> Self {
        match err {
            StageError::ReadFailure { source, .. }
            | StageError::WriteFailure { source, .. }
            | StageError::Io(source) => source,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}
