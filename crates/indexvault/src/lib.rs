#![warn(missing_docs)]

//! indexvault: encrypted snapshots of local search index directories
//!
//! Snapshot: index dir → Archive (tar) → Compress (LZ4 frame) → Encrypt (chunked AEAD) → `.enc`
//! Restore:  `.enc` → Decrypt → Decompress → Unarchive → index dir
//!
//! Every stage is file-to-file and streaming; intermediates are deleted as
//! soon as the next stage has consumed them.

pub mod archive;
pub mod cli;
pub mod compression;
pub mod config;
pub mod disk;
pub mod encryption;
pub mod error;
pub mod layout;
pub mod lock;
pub mod pipeline;

pub use archive::ArchiveStats;
pub use compression::{Lz4BlockSize, Lz4Options, StreamStats};
pub use config::VaultConfig;
pub use disk::{ensure_room, DiskError, FreeSpaceProbe, StatvfsProbe};
pub use encryption::{EncryptionAlgorithm, KeyMaterial, StreamHeader};
pub use error::{StageError, VaultError};
pub use layout::{ArtifactKind, IndexSnapshot, VaultLayout};
pub use lock::{ArtifactLocks, LockSet};
pub use pipeline::{
    load_key, ArtifactInfo, RestoreReport, SnapshotReport, Stage, StageRunner, StandardStages,
    Vault,
};
