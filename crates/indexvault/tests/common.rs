//! Common fixtures for the pipeline integration tests.

#![allow(dead_code)]

use indexvault::{
    ArchiveStats, KeyMaterial, Stage, StageError, StageRunner, StandardStages, StreamStats, Vault,
    VaultConfig, VaultLayout,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use walkdir::WalkDir;

/// A vault root in a temporary directory.
pub struct TestVault {
    pub dir: TempDir,
    pub config: VaultConfig,
}

impl TestVault {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut VaultConfig)) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let mut config = VaultConfig::with_root(dir.path());
        tweak(&mut config);
        Self { dir, config }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn vault(&self) -> Vault {
        Vault::new(&self.config)
    }

    pub fn vault_with<S: StageRunner>(&self, stages: S) -> Vault<S> {
        Vault::with_stages(&self.config, stages)
    }

    pub fn index_dir(&self, identity: &str) -> PathBuf {
        VaultLayout::new(&self.config)
            .snapshot(identity)
            .expect("valid identity")
            .source_dir
    }

    pub fn artifact(&self, identity: &str) -> PathBuf {
        let layout = VaultLayout::new(&self.config);
        let snap = layout.snapshot(identity).expect("valid identity");
        layout.artifact_path(&snap, indexvault::ArtifactKind::Encrypted)
    }

    /// Create the live index for `identity` with a small but varied tree.
    pub fn seed_index(&self, identity: &str) -> PathBuf {
        let dir = self.index_dir(identity);
        write_sample_tree(&dir);
        dir
    }

    /// Names directly under the root that only a running invocation may hold.
    pub fn transient_files(&self) -> Vec<String> {
        std::fs::read_dir(self.root())
            .expect("read root")
            .map(|e| e.expect("dir entry").file_name().to_string_lossy().into_owned())
            .filter(|name| VaultLayout::is_transient_name(name) || name.starts_with("decrypted"))
            .collect()
    }

    /// Every name directly under the root.
    pub fn root_listing(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.root())
            .expect("read root")
            .map(|e| e.expect("dir entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

pub fn write_sample_tree(dir: &Path) {
    std::fs::create_dir_all(dir.join("segments/_0")).unwrap();
    std::fs::create_dir_all(dir.join("empty")).unwrap();
    std::fs::write(dir.join("segments.gen"), b"generation 7\n").unwrap();
    std::fs::write(dir.join("segments/_0/postings.bin"), pseudo_random(3, 20_000)).unwrap();
    std::fs::write(
        dir.join("segments/_0/terms.txt"),
        "alpha beta gamma delta\n".repeat(500),
    )
    .unwrap();
    std::fs::write(dir.join("segments/_0/deleted.bits"), b"").unwrap();
    std::fs::write(dir.join("write.lock"), b"").unwrap();
}

/// Relative path → contents (None for directories).
pub fn tree_contents(dir: &Path) -> BTreeMap<PathBuf, Option<Vec<u8>>> {
    WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .map(|e| e.expect("walk"))
        .map(|e| {
            let rel = e.path().strip_prefix(dir).unwrap().to_path_buf();
            let body = if e.file_type().is_dir() {
                None
            } else {
                Some(std::fs::read(e.path()).unwrap())
            };
            (rel, body)
        })
        .collect()
}

pub fn pseudo_random(seed: u64, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut out);
    out
}

pub fn test_key() -> KeyMaterial {
    KeyMaterial::from_slice(&[0x42; 32]).unwrap()
}

/// Runs the standard stages but fails `fail_at` after leaving partial output.
pub struct FailingStages {
    pub fail_at: Stage,
    inner: StandardStages,
}

impl FailingStages {
    pub fn new(fail_at: Stage, config: &VaultConfig) -> Self {
        Self {
            fail_at,
            inner: StandardStages::from_config(config),
        }
    }

    fn inject(&self, stage: Stage, partial: Option<&Path>) -> Result<(), StageError> {
        if stage != self.fail_at {
            return Ok(());
        }
        if let Some(path) = partial {
            std::fs::write(path, b"partial output").unwrap();
        }
        Err(match stage {
            Stage::Decompress => StageError::MalformedCompressedData("injected".into()),
            Stage::Unarchive => StageError::CorruptContainer("injected".into()),
            _ => StageError::Io(io::Error::new(io::ErrorKind::Other, "injected")),
        })
    }
}

impl StageRunner for FailingStages {
    fn archive(&self, source_dir: &Path, dest: &Path) -> Result<ArchiveStats, StageError> {
        self.inject(Stage::Archive, Some(dest))?;
        self.inner.archive(source_dir, dest)
    }

    fn compress(&self, src: &Path, dest: &Path) -> Result<StreamStats, StageError> {
        self.inject(Stage::Compress, Some(dest))?;
        self.inner.compress(src, dest)
    }

    fn encrypt(&self, src: &Path, dest: &Path, key: &KeyMaterial) -> Result<StreamStats, StageError> {
        self.inject(Stage::Encrypt, Some(dest))?;
        self.inner.encrypt(src, dest, key)
    }

    fn decrypt(&self, src: &Path, dest: &Path, key: &KeyMaterial) -> Result<StreamStats, StageError> {
        self.inject(Stage::Decrypt, Some(dest))?;
        self.inner.decrypt(src, dest, key)
    }

    fn decompress(&self, src: &Path, dest: &Path) -> Result<StreamStats, StageError> {
        self.inject(Stage::Decompress, Some(dest))?;
        self.inner.decompress(src, dest)
    }

    fn unarchive(&self, container: &Path, dest_dir: &Path) -> Result<ArchiveStats, StageError> {
        self.inject(Stage::Unarchive, None)?;
        self.inner.unarchive(container, dest_dir)
    }
}

/// Standard stages that record how many stages run at once.
#[derive(Default)]
pub struct GatedStages {
    inner: StandardStages,
    in_flight: AtomicUsize,
    pub peak: Arc<AtomicUsize>,
}

impl GatedStages {
    fn enter(&self) -> Gate<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(10));
        Gate(&self.in_flight)
    }
}

struct Gate<'a>(&'a AtomicUsize);

impl Drop for Gate<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StageRunner for GatedStages {
    fn archive(&self, source_dir: &Path, dest: &Path) -> Result<ArchiveStats, StageError> {
        let _gate = self.enter();
        self.inner.archive(source_dir, dest)
    }

    fn compress(&self, src: &Path, dest: &Path) -> Result<StreamStats, StageError> {
        let _gate = self.enter();
        self.inner.compress(src, dest)
    }

    fn encrypt(&self, src: &Path, dest: &Path, key: &KeyMaterial) -> Result<StreamStats, StageError> {
        let _gate = self.enter();
        self.inner.encrypt(src, dest, key)
    }

    fn decrypt(&self, src: &Path, dest: &Path, key: &KeyMaterial) -> Result<StreamStats, StageError> {
        let _gate = self.enter();
        self.inner.decrypt(src, dest, key)
    }

    fn decompress(&self, src: &Path, dest: &Path) -> Result<StreamStats, StageError> {
        let _gate = self.enter();
        self.inner.decompress(src, dest)
    }

    fn unarchive(&self, container: &Path, dest_dir: &Path) -> Result<ArchiveStats, StageError> {
        let _gate = self.enter();
        self.inner.unarchive(container, dest_dir)
    }
}
