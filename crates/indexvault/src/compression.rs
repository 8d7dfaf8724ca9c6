//! Streaming LZ4 frame compression for the snapshot pipeline.
//!
//! The encoder is a [`Write`] adapter over an output sink; the decoder is a
//! [`Read`] adapter over a compressed source. Neither buffers more than one
//! LZ4 block, so payload size is bounded only by disk.

use crate::error::StageError;
use lz4_flex::frame::{BlockMode, BlockSize, FrameDecoder, FrameEncoder, FrameInfo};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;

const COPY_BUF_LEN: usize = 64 * 1024;

/// LZ4 frame block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Lz4BlockSize {
    /// 64 KiB blocks
    #[default]
    Max64KB,
    /// 256 KiB blocks
    Max256KB,
    /// 1 MiB blocks
    Max1MB,
    /// 4 MiB blocks
    Max4MB,
}

impl From<Lz4BlockSize> for BlockSize {
    fn from(size: Lz4BlockSize) -> Self {
        match size {
            Lz4BlockSize::Max64KB => BlockSize::Max64KB,
            Lz4BlockSize::Max256KB => BlockSize::Max256KB,
            Lz4BlockSize::Max1MB => BlockSize::Max1MB,
            Lz4BlockSize::Max4MB => BlockSize::Max4MB,
        }
    }
}

/// Frame parameters for the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lz4Options {
    /// Maximum block size
    pub block_size: Lz4BlockSize,
    /// Append an xxHash32 of the whole content to the frame
    pub content_checksum: bool,
}

impl Default for Lz4Options {
    fn default() -> Self {
        Self {
            block_size: Lz4BlockSize::Max64KB,
            content_checksum: true,
        }
    }
}

impl Lz4Options {
    fn frame_info(self) -> FrameInfo {
        FrameInfo::new()
            .block_size(self.block_size.into())
            .block_mode(BlockMode::Independent)
            .content_checksum(self.content_checksum)
    }
}

/// Byte counts from one compress or decompress pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Bytes consumed from the input
    pub bytes_in: u64,
    /// Bytes produced to the output
    pub bytes_out: u64,
}

/// Write adapter that LZ4-frames everything written to it into `sink`.
///
/// [`Lz4Encoder::finish`] must be called to emit the end-of-stream marker.
pub struct Lz4Encoder<W: Write> {
    inner: FrameEncoder<W>,
    bytes_in: u64,
}

/// Start an LZ4 frame stream into `sink`.
pub fn open_encode_stream<W: Write>(sink: W, options: Lz4Options) -> Lz4Encoder<W> {
    Lz4Encoder {
        inner: FrameEncoder::with_frame_info(options.frame_info(), sink),
        bytes_in: 0,
    }
}

impl<W: Write> Lz4Encoder<W> {
    /// Raw bytes accepted so far.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Flush the last block and the end mark, returning the sink.
    pub fn finish(self) -> io::Result<W> {
        self.inner.finish().map_err(io::Error::from)
    }
}

impl<W: Write> Write for Lz4Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.bytes_in += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Read adapter yielding the decompressed contents of an LZ4 frame stream.
pub struct Lz4Decoder<R: Read> {
    inner: FrameDecoder<R>,
    bytes_out: u64,
}

/// Start decoding the LZ4 frame stream read from `source`.
pub fn open_decode_stream<R: Read>(source: R) -> Lz4Decoder<R> {
    Lz4Decoder {
        inner: FrameDecoder::new(source),
        bytes_out: 0,
    }
}

impl<R: Read> Lz4Decoder<R> {
    /// Decompressed bytes produced so far.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }
}

impl<R: Read> Read for Lz4Decoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes_out += n as u64;
        Ok(n)
    }
}

/// True when `err` came from LZ4 frame parsing rather than the source reader.
pub fn is_frame_error(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<lz4_flex::frame::Error>())
        || err.kind() == io::ErrorKind::UnexpectedEof
}

/// Compress the file at `src` into a new LZ4 frame file at `dest`.
pub fn compress_file(src: &Path, dest: &Path, options: Lz4Options) -> Result<StreamStats, StageError> {
    let input = open_input(src)?;
    let write_err = |source: io::Error| StageError::WriteFailure {
        path: dest.to_path_buf(),
        source,
    };
    let output = File::create(dest).map_err(write_err)?;
    let mut encoder = open_encode_stream(BufWriter::new(output), options);

    let mut reader = BufReader::new(input);
    let mut buf = vec![0u8; COPY_BUF_LEN];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(StageError::ReadFailure {
                    path: src.to_path_buf(),
                    source,
                })
            }
        };
        encoder.write_all(&buf[..n]).map_err(write_err)?;
    }

    let bytes_in = encoder.bytes_in();
    let bytes_out = finish_file(encoder.finish().map_err(write_err)?).map_err(write_err)?;
    debug!(src = %src.display(), dest = %dest.display(), bytes_in, bytes_out, "lz4 compressed");
    Ok(StreamStats { bytes_in, bytes_out })
}

/// Decompress the LZ4 frame file at `src` into `dest`.
pub fn decompress_file(src: &Path, dest: &Path) -> Result<StreamStats, StageError> {
    let input = open_input(src)?;
    let bytes_in = input
        .metadata()
        .map_err(|source| StageError::ReadFailure {
            path: src.to_path_buf(),
            source,
        })?
        .len();
    let write_err = |source: io::Error| StageError::WriteFailure {
        path: dest.to_path_buf(),
        source,
    };
    let mut output = BufWriter::new(File::create(dest).map_err(write_err)?);
    let mut decoder = open_decode_stream(BufReader::new(input));

    let mut buf = vec![0u8; COPY_BUF_LEN];
    loop {
        let n = match decoder.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_frame_error(&e) => {
                return Err(StageError::MalformedCompressedData(e.to_string()))
            }
            Err(source) => {
                return Err(StageError::ReadFailure {
                    path: src.to_path_buf(),
                    source,
                })
            }
        };
        output.write_all(&buf[..n]).map_err(write_err)?;
    }

    let bytes_out = finish_file(output).map_err(write_err)?;
    debug!(src = %src.display(), dest = %dest.display(), bytes_in, bytes_out, "lz4 decompressed");
    Ok(StreamStats { bytes_in, bytes_out })
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

/// Flush and fsync a buffered output file, returning its final length.
pub(crate) fn finish_file(mut writer: BufWriter<File>) -> io::Result<u64> {
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}
