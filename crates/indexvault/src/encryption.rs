//! Chunked AEAD stream encryption (AES-256-GCM or ChaCha20-Poly1305).
//!
//! Container layout, integers big endian:
//!
//! ```text
//! header (51 bytes, AAD of every chunk)
//!   magic "IVLT" | version u8 | algorithm u8 | reserved u16 | chunk_size u32
//!   | salt [32] | nonce_prefix [7]
//! frame*
//!   flag u8 (0 = more, 1 = final) | len u32 | ciphertext+tag [len]
//! ```
//!
//! The stream key is HKDF-SHA256(salt, key material). Chunk nonces are
//! `nonce_prefix || counter u32 || flag`, so reordering, dropping, or
//! truncating chunks fails authentication. Every non-final chunk carries
//! exactly `chunk_size` plaintext bytes.
//!
//! The decrypt writer releases a chunk's plaintext to its sink only after that
//! chunk's tag verifies. A later chunk can still fail, so callers must treat
//! everything written to the sink as provisional until [`DecryptWriter::finish`]
//! returns `Ok`.

use crate::compression::StreamStats;
use crate::error::StageError;
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm,
};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Required key material length in bytes.
pub const KEY_LEN: usize = 32;
/// AEAD authentication tag length.
pub const TAG_LEN: usize = 16;
/// Encoded header length.
pub const HEADER_LEN: usize = 51;
/// Smallest accepted plaintext chunk size.
pub const MIN_CHUNK_SIZE: u32 = 1024;
/// Largest accepted plaintext chunk size.
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

const MAGIC: [u8; 4] = *b"IVLT";
const CONTAINER_VERSION: u8 = 1;
const SALT_LEN: usize = 32;
const NONCE_PREFIX_LEN: usize = 7;
const FRAME_HEADER_LEN: usize = 5;
const FLAG_MORE: u8 = 0;
const FLAG_FINAL: u8 = 1;
const HKDF_INFO: &[u8] = b"indexvault-stream-v1";
const COPY_BUF_LEN: usize = 64 * 1024;

/// Caller-supplied 256-bit secret. Zeroized on drop, never logged.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_LEN]);

impl KeyMaterial {
    /// Validate and copy raw key bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, StageError> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| StageError::InvalidKey { len: bytes.len() })?;
        Ok(Self(key))
    }

    /// Fresh random key from the OS-seeded thread RNG.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Raw key bytes.
    pub fn expose(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyMaterial([REDACTED])")
    }
}

/// AEAD cipher selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncryptionAlgorithm {
    /// AES-256-GCM, hardware accelerated on x86 with AES-NI
    #[default]
    AesGcm256,
    /// ChaCha20-Poly1305, fast on hardware without AES instructions
    ChaCha20Poly1305,
}

impl EncryptionAlgorithm {
    fn id(self) -> u8 {
        match self {
            EncryptionAlgorithm::AesGcm256 => 0,
            EncryptionAlgorithm::ChaCha20Poly1305 => 1,
        }
    }

    fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(EncryptionAlgorithm::AesGcm256),
            1 => Some(EncryptionAlgorithm::ChaCha20Poly1305),
            _ => None,
        }
    }
}

/// Parsed encrypted container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    /// Cipher the stream was sealed with
    pub algorithm: EncryptionAlgorithm,
    /// Plaintext bytes per non-final chunk
    pub chunk_size: u32,
    salt: [u8; SALT_LEN],
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
}

impl StreamHeader {
    fn generate(algorithm: EncryptionAlgorithm, chunk_size: u32) -> Result<Self, StageError> {
        check_chunk_size(chunk_size)?;
        let mut rng = rand::thread_rng();
        let mut salt = [0u8; SALT_LEN];
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce_prefix);
        Ok(Self {
            algorithm,
            chunk_size,
            salt,
            nonce_prefix,
        })
    }

    /// Encode to the on-disk form.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&MAGIC);
        out[4] = CONTAINER_VERSION;
        out[5] = self.algorithm.id();
        // 6..8 reserved
        out[8..12].copy_from_slice(&self.chunk_size.to_be_bytes());
        out[12..44].copy_from_slice(&self.salt);
        out[44..51].copy_from_slice(&self.nonce_prefix);
        out
    }

    /// Decode and validate an on-disk header.
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self, StageError> {
        if bytes[0..4] != MAGIC {
            return Err(StageError::UnsupportedFormat("bad magic".to_string()));
        }
        if bytes[4] != CONTAINER_VERSION {
            return Err(StageError::UnsupportedFormat(format!(
                "container version {}",
                bytes[4]
            )));
        }
        let algorithm = EncryptionAlgorithm::from_id(bytes[5]).ok_or_else(|| {
            StageError::UnsupportedFormat(format!("algorithm id {}", bytes[5]))
        })?;
        if bytes[6..8] != [0, 0] {
            return Err(StageError::UnsupportedFormat(
                "reserved bytes set".to_string(),
            ));
        }
        let chunk_size = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        check_chunk_size(chunk_size)?;

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes[12..44]);
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        nonce_prefix.copy_from_slice(&bytes[44..51]);
        Ok(Self {
            algorithm,
            chunk_size,
            salt,
            nonce_prefix,
        })
    }

    fn nonce(&self, counter: u32, flag: u8) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..NONCE_PREFIX_LEN].copy_from_slice(&self.nonce_prefix);
        nonce[7..11].copy_from_slice(&counter.to_be_bytes());
        nonce[11] = flag;
        nonce
    }
}

fn check_chunk_size(chunk_size: u32) -> Result<(), StageError> {
    if (MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
        Ok(())
    } else {
        Err(StageError::UnsupportedFormat(format!(
            "chunk size {} outside {}..={}",
            chunk_size, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
        )))
    }
}

/// Both variants wipe their key schedules on drop.
enum StreamCipher {
    AesGcm256(Aes256Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
}

impl StreamCipher {
    fn new(key: &KeyMaterial, header: &StreamHeader) -> Result<Self, StageError> {
        let hk = Hkdf::<Sha256>::new(Some(&header.salt), &key.0);
        let mut okm = Zeroizing::new([0u8; KEY_LEN]);
        hk.expand(HKDF_INFO, &mut okm[..])
            .map_err(|e| StageError::CipherFailure(e.to_string()))?;
        let cipher = match header.algorithm {
            EncryptionAlgorithm::AesGcm256 => StreamCipher::AesGcm256(
                Aes256Gcm::new_from_slice(&okm[..])
                    .map_err(|e| StageError::CipherFailure(e.to_string()))?,
            ),
            EncryptionAlgorithm::ChaCha20Poly1305 => StreamCipher::ChaCha20Poly1305(
                ChaCha20Poly1305::new_from_slice(&okm[..])
                    .map_err(|e| StageError::CipherFailure(e.to_string()))?,
            ),
        };
        Ok(cipher)
    }

    fn seal(&self, nonce: &[u8; 12], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>, StageError> {
        let payload = Payload { msg, aad };
        let sealed = match self {
            StreamCipher::AesGcm256(cipher) => {
                cipher.encrypt(aes_gcm::Nonce::from_slice(nonce), payload)
            }
            StreamCipher::ChaCha20Poly1305(cipher) => {
                cipher.encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
            }
        };
        sealed.map_err(|e| StageError::CipherFailure(e.to_string()))
    }

    fn open(&self, nonce: &[u8; 12], aad: &[u8], msg: &[u8]) -> Result<Vec<u8>, StageError> {
        let payload = Payload { msg, aad };
        let opened = match self {
            StreamCipher::AesGcm256(cipher) => {
                cipher.decrypt(aes_gcm::Nonce::from_slice(nonce), payload)
            }
            StreamCipher::ChaCha20Poly1305(cipher) => {
                cipher.decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
            }
        };
        opened.map_err(|_| StageError::AuthenticationFailure)
    }
}

/// Write adapter that seals everything written to it into `sink`.
///
/// Dropping the writer without [`EncryptWriter::finish`] leaves a stream with
/// no final chunk, which decryption rejects as truncated.
pub struct EncryptWriter<W: Write> {
    sink: W,
    cipher: StreamCipher,
    header: StreamHeader,
    aad: [u8; HEADER_LEN],
    buf: Vec<u8>,
    counter: u32,
    bytes_in: u64,
    bytes_out: u64,
}

/// Start an encrypted stream into `sink`. The header is written immediately;
/// nothing is written if stream setup fails.
pub fn open_encrypt_stream<W: Write>(
    key: &KeyMaterial,
    algorithm: EncryptionAlgorithm,
    chunk_size: u32,
    mut sink: W,
) -> Result<EncryptWriter<W>, StageError> {
    let header = StreamHeader::generate(algorithm, chunk_size)?;
    let cipher = StreamCipher::new(key, &header)?;
    let aad = header.to_bytes();
    sink.write_all(&aad)?;
    Ok(EncryptWriter {
        sink,
        cipher,
        header,
        aad,
        buf: Vec::with_capacity(chunk_size as usize),
        counter: 0,
        bytes_in: 0,
        bytes_out: HEADER_LEN as u64,
    })
}

impl<W: Write> EncryptWriter<W> {
    /// Accept plaintext; full chunks are sealed once more data follows them.
    pub fn push(&mut self, mut data: &[u8]) -> Result<(), StageError> {
        let chunk_size = self.header.chunk_size as usize;
        self.bytes_in += data.len() as u64;
        while !data.is_empty() {
            if self.buf.len() == chunk_size {
                self.seal_chunk(FLAG_MORE)?;
            }
            let take = (chunk_size - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
        }
        Ok(())
    }

    fn seal_chunk(&mut self, flag: u8) -> Result<(), StageError> {
        let nonce = self.header.nonce(self.counter, flag);
        let sealed = self.cipher.seal(&nonce, &self.aad, &self.buf)?;
        self.buf.zeroize();
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| StageError::CipherFailure("chunk counter exhausted".to_string()))?;

        let len = sealed.len() as u32;
        self.sink.write_all(&[flag])?;
        self.sink.write_all(&len.to_be_bytes())?;
        self.sink.write_all(&sealed)?;
        self.bytes_out += (FRAME_HEADER_LEN + sealed.len()) as u64;
        Ok(())
    }

    /// Plaintext bytes accepted so far.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Container bytes written to the sink so far.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// Plaintext currently held back waiting to be sealed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Seal the final chunk, flush, and return the sink.
    pub fn finish(mut self) -> Result<W, StageError> {
        self.seal_chunk(FLAG_FINAL)?;
        self.sink.flush()?;
        Ok(self.sink)
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

enum DecryptState {
    AwaitHeader,
    Streaming {
        cipher: StreamCipher,
        header: StreamHeader,
        aad: [u8; HEADER_LEN],
    },
    Finished,
}

/// Write adapter that verifies and decrypts a container written to it,
/// forwarding plaintext to `sink` one verified chunk at a time.
pub struct DecryptWriter<W: Write> {
    sink: W,
    key: KeyMaterial,
    state: DecryptState,
    pending: Vec<u8>,
    counter: u32,
    bytes_in: u64,
    bytes_out: u64,
}

/// Start decrypting a container into `sink`.
pub fn open_decrypt_stream<W: Write>(key: &KeyMaterial, sink: W) -> DecryptWriter<W> {
    DecryptWriter {
        sink,
        key: key.clone(),
        state: DecryptState::AwaitHeader,
        pending: Vec::new(),
        counter: 0,
        bytes_in: 0,
        bytes_out: 0,
    }
}

impl<W: Write> DecryptWriter<W> {
    /// Accept container bytes, releasing every chunk that completes and verifies.
    pub fn push(&mut self, data: &[u8]) -> Result<(), StageError> {
        self.bytes_in += data.len() as u64;
        self.pending.extend_from_slice(data);
        loop {
            match &self.state {
                DecryptState::AwaitHeader => {
                    if self.pending.len() < HEADER_LEN {
                        return Ok(());
                    }
                    let mut raw = [0u8; HEADER_LEN];
                    raw.copy_from_slice(&self.pending[..HEADER_LEN]);
                    let header = StreamHeader::parse(&raw)?;
                    let cipher = StreamCipher::new(&self.key, &header)?;
                    self.pending.drain(..HEADER_LEN);
                    self.state = DecryptState::Streaming {
                        cipher,
                        header,
                        aad: raw,
                    };
                }
                DecryptState::Streaming {
                    cipher,
                    header,
                    aad,
                } => {
                    if self.pending.len() < FRAME_HEADER_LEN {
                        return Ok(());
                    }
                    let flag = self.pending[0];
                    if flag != FLAG_MORE && flag != FLAG_FINAL {
                        return Err(StageError::AuthenticationFailure);
                    }
                    let len = u32::from_be_bytes([
                        self.pending[1],
                        self.pending[2],
                        self.pending[3],
                        self.pending[4],
                    ]) as usize;
                    let chunk_size = header.chunk_size as usize;
                    if !(TAG_LEN..=chunk_size + TAG_LEN).contains(&len) {
                        return Err(StageError::AuthenticationFailure);
                    }
                    if self.pending.len() < FRAME_HEADER_LEN + len {
                        return Ok(());
                    }

                    let nonce = header.nonce(self.counter, flag);
                    let sealed = &self.pending[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
                    let plaintext = Zeroizing::new(cipher.open(&nonce, aad, sealed)?);
                    if flag == FLAG_MORE && plaintext.len() != chunk_size {
                        return Err(StageError::AuthenticationFailure);
                    }
                    self.sink.write_all(&plaintext)?;
                    self.bytes_out += plaintext.len() as u64;
                    self.pending.drain(..FRAME_HEADER_LEN + len);
                    self.counter = self.counter.checked_add(1).ok_or_else(|| {
                        StageError::UnsupportedFormat("chunk counter exhausted".to_string())
                    })?;
                    if flag == FLAG_FINAL {
                        self.state = DecryptState::Finished;
                    }
                }
                DecryptState::Finished => {
                    if !self.pending.is_empty() {
                        return Err(StageError::UnsupportedFormat(
                            "data after final chunk".to_string(),
                        ));
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Plaintext bytes released to the sink so far.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// Container bytes accepted so far.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Require a complete, verified stream; flush and return the sink.
    pub fn finish(mut self) -> Result<W, StageError> {
        if !matches!(self.state, DecryptState::Finished) {
            return Err(StageError::Truncated);
        }
        self.sink.flush()?;
        Ok(self.sink)
    }
}

impl<W: Write> Write for DecryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

/// Encrypt the file at `src` into a new container at `dest`.
pub fn encrypt_file(
    src: &Path,
    dest: &Path,
    key: &KeyMaterial,
    algorithm: EncryptionAlgorithm,
    chunk_size: u32,
) -> Result<StreamStats, StageError> {
    let input = open_input(src)?;
    let output = File::create(dest).map_err(|source| StageError::WriteFailure {
        path: dest.to_path_buf(),
        source,
    })?;
    let mut writer = open_encrypt_stream(key, algorithm, chunk_size, BufWriter::new(output))
        .map_err(|e| at_sink(e, dest))?;

    pump(src, BufReader::new(input), |chunk| {
        writer.push(chunk).map_err(|e| at_sink(e, dest))
    })?;

    let bytes_in = writer.bytes_in();
    let sink = writer.finish().map_err(|e| at_sink(e, dest))?;
    let bytes_out = crate::compression::finish_file(sink).map_err(|source| StageError::WriteFailure {
        path: dest.to_path_buf(),
        source,
    })?;
    debug!(src = %src.display(), dest = %dest.display(), bytes_in, bytes_out, "encrypted stream");
    Ok(StreamStats { bytes_in, bytes_out })
}

/// Decrypt the container at `src` into `dest`. On error `dest` may hold
/// plaintext from chunks that verified before the failure.
pub fn decrypt_file(src: &Path, dest: &Path, key: &KeyMaterial) -> Result<StreamStats, StageError> {
    let input = open_input(src)?;
    let output = File::create(dest).map_err(|source| StageError::WriteFailure {
        path: dest.to_path_buf(),
        source,
    })?;
    let mut writer = open_decrypt_stream(key, BufWriter::new(output));

    pump(src, BufReader::new(input), |chunk| {
        writer.push(chunk).map_err(|e| at_sink(e, dest))
    })?;

    let bytes_in = writer.bytes_in();
    let sink = writer.finish().map_err(|e| at_sink(e, dest))?;
    let bytes_out = crate::compression::finish_file(sink).map_err(|source| StageError::WriteFailure {
        path: dest.to_path_buf(),
        source,
    })?;
    debug!(src = %src.display(), dest = %dest.display(), bytes_in, bytes_out, "decrypted stream");
    Ok(StreamStats { bytes_in, bytes_out })
}

/// Read the header of the container at `path` without a key.
pub fn read_header(path: &Path) -> Result<StreamHeader, StageError> {
    let mut file = open_input(path)?;
    let mut raw = [0u8; HEADER_LEN];
    file.read_exact(&mut raw).map_err(|source| {
        if source.kind() == io::ErrorKind::UnexpectedEof {
            StageError::Truncated
        } else {
            StageError::ReadFailure {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    StreamHeader::parse(&raw)
}

fn pump<R: Read>(
    src: &Path,
    mut reader: R,
    mut consume: impl FnMut(&[u8]) -> Result<(), StageError>,
) -> Result<(), StageError> {
    let mut buf = vec![0u8; COPY_BUF_LEN];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => consume(&buf[..n])?,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(StageError::ReadFailure {
                    path: src.to_path_buf(),
                    source,
                })
            }
        }
    }
}

fn at_sink(err: StageError, dest: &Path) -> StageError {
    match err {
        StageError::Io(source) => StageError::WriteFailure {
            path: dest.to_path_buf(),
            source,
        },
        other => other,
    }
}

fn open_input(path: &Path) -> Result<File, StageError> {
    File::open(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            StageError::SourceNotFound {
                path: path.to_path_buf(),
            }
        } else {
            StageError::ReadFailure {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}
