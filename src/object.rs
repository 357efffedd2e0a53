//! Chunked compiled-object containers (`.rmod` files).
//!
//! Layout: 4-byte magic `RMOD`, then a sequence of chunks, each a
//! one-byte name length, the ASCII name, a big-endian u32 payload
//! length, and the payload. A gzip-compressed object (magic `1f 8b`)
//! is decompressed transparently on parse.
//!
//! Stripping retains the chunks the platform needs to load and
//! execute the object, the reflection metadata chunks, and anything
//! the caller asked to keep; debug symbols, documentation and
//! provenance chunks are discarded.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

/// Magic of an uncompressed compiled object.
pub const OBJECT_MAGIC: &[u8; 4] = b"RMOD";

/// File extension of compiled objects inside `artifacts/`.
pub const OBJECT_EXTENSION: &str = "rmod";

/// Chunks required to load and execute an object.
pub const ESSENTIAL_CHUNKS: &[&str] = &["Code", "Syms", "Imports", "Exports"];

/// Reflection metadata kept by every strip.
pub const METADATA_CHUNKS: &[&str] = &["Attrs", "Meta"];

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectError {
    #[error("not a compiled object (bad magic)")]
    BadMagic,
    #[error("truncated compiled object at byte {0}")]
    Truncated(usize),
    #[error("invalid chunk name at byte {0}")]
    BadChunkName(usize),
}

/// One named chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub name: String,
    pub payload: Vec<u8>,
}

impl Chunk {
    pub fn new(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// A parsed compiled object: its chunks, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectFile {
    pub chunks: Vec<Chunk>,
}

impl ObjectFile {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self { chunks }
    }

    pub fn chunk(&self, name: &str) -> Option<&Chunk> {
        self.chunks.iter().find(|chunk| chunk.name == name)
    }

    /// Parse an object, decompressing first when it is gzipped.
    pub fn parse(bytes: &[u8]) -> Result<ObjectFile> {
        if bytes.starts_with(&GZIP_MAGIC) {
            let mut decompressed = Vec::new();
            GzDecoder::new(bytes)
                .read_to_end(&mut decompressed)
                .context("decompressing gzipped compiled object")?;
            return Self::parse_plain(&decompressed);
        }
        Self::parse_plain(bytes)
    }

    fn parse_plain(bytes: &[u8]) -> Result<ObjectFile> {
        if bytes.len() < OBJECT_MAGIC.len() || &bytes[..OBJECT_MAGIC.len()] != OBJECT_MAGIC {
            return Err(ObjectError::BadMagic.into());
        }
        let mut chunks = Vec::new();
        let mut at = OBJECT_MAGIC.len();
        while at < bytes.len() {
            let name_len = bytes[at] as usize;
            at += 1;
            if name_len == 0 {
                return Err(ObjectError::BadChunkName(at - 1).into());
            }
            if at + name_len > bytes.len() {
                return Err(ObjectError::Truncated(at).into());
            }
            let name = std::str::from_utf8(&bytes[at..at + name_len])
                .ok()
                .filter(|name| name.chars().all(|c| c.is_ascii_graphic()))
                .ok_or(ObjectError::BadChunkName(at))?
                .to_string();
            at += name_len;
            if at + 4 > bytes.len() {
                return Err(ObjectError::Truncated(at).into());
            }
            let payload_len =
                u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
                    as usize;
            at += 4;
            if at + payload_len > bytes.len() {
                return Err(ObjectError::Truncated(at).into());
            }
            chunks.push(Chunk::new(name, bytes[at..at + payload_len].to_vec()));
            at += payload_len;
        }
        Ok(ObjectFile { chunks })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(OBJECT_MAGIC);
        for chunk in &self.chunks {
            debug_assert!(!chunk.name.is_empty() && chunk.name.len() <= u8::MAX as usize);
            out.push(chunk.name.len() as u8);
            out.extend_from_slice(chunk.name.as_bytes());
            out.extend_from_slice(&(chunk.payload.len() as u32).to_be_bytes());
            out.extend_from_slice(&chunk.payload);
        }
        out
    }

    pub fn to_gzip_bytes(&self) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&self.to_bytes())
            .context("compressing compiled object")?;
        encoder.finish().context("compressing compiled object")
    }

    /// Retain the essential chunk set, the reflection metadata, and
    /// any chunk named in `keep`; discard the rest. Chunk order is
    /// preserved.
    pub fn strip(&self, keep: &[String]) -> ObjectFile {
        let retained = self
            .chunks
            .iter()
            .filter(|chunk| {
                ESSENTIAL_CHUNKS.contains(&chunk.name.as_str())
                    || METADATA_CHUNKS.contains(&chunk.name.as_str())
                    || keep.iter().any(|name| name == &chunk.name)
            })
            .cloned()
            .collect();
        ObjectFile { chunks: retained }
    }
}

/// Strip `source` into `target`, optionally gzip-compressing the
/// result. The caller decides what a failure means; the packager
/// degrades it to a byte copy.
pub fn strip_object_file(
    source: &Path,
    target: &Path,
    keep: &[String],
    compress: bool,
) -> Result<()> {
    let bytes = fs::read(source)
        .with_context(|| format!("reading compiled object '{}'", source.display()))?;
    let object = ObjectFile::parse(&bytes)
        .with_context(|| format!("parsing compiled object '{}'", source.display()))?;
    let stripped = object.strip(keep);
    let out = if compress {
        stripped.to_gzip_bytes()?
    } else {
        stripped.to_bytes()
    };
    fs::write(target, out)
        .with_context(|| format!("writing stripped object '{}'", target.display()))
}
