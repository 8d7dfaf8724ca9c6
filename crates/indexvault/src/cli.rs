//! `ivault` command line.

use crate::config::VaultConfig;
use crate::disk::{ensure_room, StatvfsProbe};
use crate::encryption::{KeyMaterial, KEY_LEN};
use crate::pipeline::{load_key, Vault};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Encrypted search index snapshots.
#[derive(Parser, Debug)]
#[command(name = "ivault")]
#[command(about = "Snapshot and restore encrypted search indexes", long_about = None)]
pub struct Cli {
    /// Vault configuration file (.toml or .json)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the configured root storage path
    #[arg(short, long, global = true)]
    pub root: Option<PathBuf>,

    /// Emit JSON logs and JSON reports
    #[arg(long, global = true)]
    pub json: bool,

    /// Operation to run
    #[command(subcommand)]
    pub command: Command,
}

/// Key source shared by snapshot and restore.
#[derive(Args, Clone)]
pub struct KeyArgs {
    /// File holding the 32-byte key, hex encoded or raw
    #[arg(short, long)]
    pub key_file: Option<PathBuf>,

    /// Key as 64 hex characters
    #[arg(long = "key", env = "IVAULT_KEY", hide_env_values = true)]
    pub key_hex: Option<String>,
}

impl std::fmt::Debug for KeyArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyArgs")
            .field("key_file", &self.key_file)
            .field("key_hex", &self.key_hex.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// `ivault` subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Archive, compress and encrypt an identity's live index
    Snapshot {
        /// Identity owning the index
        #[arg(short, long)]
        identity: String,
        /// Key source
        #[command(flatten)]
        key: KeyArgs,
    },
    /// Restore an identity's live index from its encrypted artifact
    Restore {
        /// Identity owning the index
        #[arg(short, long)]
        identity: String,
        /// Key source
        #[command(flatten)]
        key: KeyArgs,
    },
    /// Print the header of an identity's encrypted artifact
    Inspect {
        /// Identity owning the index
        #[arg(short, long)]
        identity: String,
    },
    /// Write a new random key as hex
    Keygen {
        /// Destination file; must not exist
        #[arg(short, long)]
        out: PathBuf,
    },
}

impl Cli {
    /// Configuration from `--config` (or defaults) with `--root` applied.
    pub fn load_config(&self) -> Result<VaultConfig> {
        let mut config = match &self.config {
            Some(path) => VaultConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => VaultConfig::default(),
        };
        if let Some(root) = &self.root {
            config.root = root.clone();
        }
        Ok(config)
    }

    /// Execute the selected subcommand.
    pub async fn run(self) -> Result<()> {
        match &self.command {
            Command::Snapshot { identity, key } => self.snapshot(identity, key).await,
            Command::Restore { identity, key } => self.restore(identity, key).await,
            Command::Inspect { identity } => self.inspect(identity).await,
            Command::Keygen { out } => {
                keygen(out)?;
                println!("Wrote new key to {}", out.display());
                Ok(())
            }
        }
    }

    async fn snapshot(&self, identity: &str, key: &KeyArgs) -> Result<()> {
        let config = self.load_config()?;
        let key = resolve_key(key)?;
        if config.root.exists() {
            ensure_room(&StatvfsProbe, &config.root, config.min_free_bytes)?;
        }

        let report = Vault::new(&config).snapshot(identity, &key).await?;
        self.emit(&report, || {
            println!("Snapshot: {}", report.artifact.display());
            println!("Entries: {}", report.entries);
            println!("Archive bytes: {}", report.archive_bytes);
            println!("Compressed bytes: {}", report.compressed_bytes);
            println!("Encrypted bytes: {}", report.encrypted_bytes);
        })
    }

    async fn restore(&self, identity: &str, key: &KeyArgs) -> Result<()> {
        let config = self.load_config()?;
        let key = resolve_key(key)?;

        let report = Vault::new(&config).restore(identity, &key).await?;
        self.emit(&report, || {
            println!("Restored: {}", report.index_dir.display());
            println!("Entries: {}", report.entries);
            println!("Decrypted bytes: {}", report.decrypted_bytes);
            println!("Archive bytes: {}", report.archive_bytes);
        })
    }

    async fn inspect(&self, identity: &str) -> Result<()> {
        let config = self.load_config()?;
        let info = Vault::new(&config).inspect(identity).await?;
        self.emit(&info, || {
            println!("Artifact: {}", info.path.display());
            println!("Container: {}", info.container_name);
            println!("Size: {} bytes", info.size_bytes);
            println!("Algorithm: {:?}", info.algorithm);
            println!("Chunk size: {}", info.chunk_size);
        })
    }

    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce()) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human();
        }
        Ok(())
    }
}

/// Key from `--key-file`, falling back to `--key` / `IVAULT_KEY`.
pub fn resolve_key(args: &KeyArgs) -> Result<KeyMaterial> {
    if let Some(path) = &args.key_file {
        let raw = Zeroizing::new(
            std::fs::read(path).with_context(|| format!("reading key file {}", path.display()))?,
        );
        return parse_key(&raw);
    }
    match &args.key_hex {
        Some(hex_key) => parse_key(hex_key.as_bytes()),
        None => anyhow::bail!("no key given: pass --key-file or set IVAULT_KEY"),
    }
}

/// Accept 64 hex characters (surrounding whitespace ignored) or exactly 32 raw bytes.
pub fn parse_key(raw: &[u8]) -> Result<KeyMaterial> {
    let text = std::str::from_utf8(raw).ok().map(str::trim);
    let bytes = match text {
        Some(text) if text.len() == 2 * KEY_LEN => {
            Zeroizing::new(hex::decode(text).context("key is not valid hex")?)
        }
        _ => Zeroizing::new(raw.to_vec()),
    };
    Ok(load_key(bytes.as_slice())?)
}

/// Write a fresh random key to `out` as hex. Never overwrites.
pub fn keygen(out: &Path) -> Result<()> {
    let key = KeyMaterial::generate();
    let encoded = Zeroizing::new(hex::encode(key.expose()));

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(out).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AlreadyExists {
            anyhow::anyhow!("refusing to overwrite existing key file {}", out.display())
        } else {
            anyhow::Error::new(e).context(format!("creating key file {}", out.display()))
        }
    })?;
    writeln!(file, "{}", encoded.as_str())?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_snapshot_args() {
        let cli = Cli::try_parse_from([
            "ivault",
            "--root",
            "/srv/vault",
            "snapshot",
            "--identity",
            "u1",
            "--key-file",
            "/etc/ivault.key",
        ])
        .unwrap();
        assert_eq!(cli.root, Some(PathBuf::from("/srv/vault")));
        match cli.command {
            Command::Snapshot { identity, key } => {
                assert_eq!(identity, "u1");
                assert_eq!(key.key_file, Some(PathBuf::from("/etc/ivault.key")));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_root_overrides_config() {
        let cli = Cli::try_parse_from(["ivault", "inspect", "-i", "u1", "--root", "/x"]).unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.root, PathBuf::from("/x"));
        assert_eq!(config.name_prefix, "search_index");
    }

    #[test]
    fn test_parse_hex_key() {
        let hex_key = format!("{}\n", "ab".repeat(KEY_LEN));
        let key = parse_key(hex_key.as_bytes()).unwrap();
        assert_eq!(key.expose(), &[0xab; KEY_LEN]);
    }

    #[test]
    fn test_parse_raw_key() {
        let key = parse_key(&[9u8; KEY_LEN]).unwrap();
        assert_eq!(key.expose(), &[9u8; KEY_LEN]);
    }

    #[test]
    fn test_parse_key_rejects_bad_input() {
        assert!(parse_key(b"too short").is_err());
        assert!(parse_key("zz".repeat(KEY_LEN).as_bytes()).is_err());
    }

    #[test]
    fn test_missing_key_is_an_error() {
        let args = KeyArgs {
            key_file: None,
            key_hex: None,
        };
        assert!(resolve_key(&args).is_err());
    }

    #[test]
    fn test_keygen_roundtrip_and_no_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("vault.key");
        keygen(&out).unwrap();

        let args = KeyArgs {
            key_file: Some(out.clone()),
            key_hex: None,
        };
        let first = resolve_key(&args).unwrap();

        let err = keygen(&out).unwrap_err();
        assert!(err.to_string().contains("refusing to overwrite"));
        assert_eq!(resolve_key(&args).unwrap().expose(), first.expose());
    }
}
