//! Content digests.
//!
//! Every blob, layer, config and manifest is identified by a `sha256:<hex>` digest.
//! Digests are computed by streaming through SHA-256 so large layers never have to be
//! held in memory.

use std::fmt;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::io::{self, Read, Write};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::constants::DEFAULT_IO_BUFFER_SIZE;
use crate::error::{CtaError, Result};

const ALGORITHM: &str = "sha256";

/// A validated `sha256:<hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse and validate a digest string.
    pub fn parse(value: &str) -> Result<Self> {
        let hex_part = value
            .strip_prefix("sha256:")
            .ok_or_else(|| invalid_digest(value, "expected 'sha256:' prefix"))?;
        if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid_digest(value, "expected 64 hex characters"));
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    fn from_hasher(hasher: Sha256) -> Self {
        Self(format!("{}:{}", ALGORITHM, hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex part after `sha256:`.
    pub fn hex(&self) -> &str {
        &self.0[ALGORITHM.len() + 1..]
    }

    /// File name used inside archive `blobs/` directories (`sha256.<hex>`).
    pub fn file_name(&self) -> String {
        self.0.replacen(':', ".", 1)
    }

    /// Inverse of [`Digest::file_name`].
    pub fn from_file_name(name: &str) -> Result<Self> {
        Self::parse(&name.replacen('.', ":", 1))
    }
}

fn invalid_digest(value: &str, reason: &str) -> CtaError {
    CtaError::InvalidReference {
        reference: value.to_string(),
        reason: reason.to_string(),
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = CtaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = CtaError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

/// Descriptor of a content-addressed blob.
///
/// Two `BlobRef`s are equal when their digests are equal; size and media type are
/// metadata only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobRef {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
}

impl BlobRef {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
        }
    }

    /// Describe an in-memory blob.
    pub fn for_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self::new(media_type, digest_bytes(data), data.len() as u64)
    }
}

impl PartialEq for BlobRef {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Eq for BlobRef {}

impl Hash for BlobRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

/// Digest an in-memory byte slice.
pub fn digest_bytes(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Digest::from_hasher(hasher)
}

/// Stream a reader through SHA-256, returning the digest and the number of bytes read.
pub fn digest_of<R: Read>(mut reader: R) -> Result<(Digest, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DEFAULT_IO_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((Digest::from_hasher(hasher), total))
}

/// Digest a file on disk.
pub fn digest_file(path: &Path) -> Result<(Digest, u64)> {
    digest_of(File::open(path)?)
}

/// Writer adapter that hashes everything written through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Finish hashing; returns the inner writer, digest and byte count.
    pub fn finish(self) -> (W, Digest, u64) {
        (self.inner, Digest::from_hasher(self.hasher), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Copy `reader` into `writer`, failing with `DigestMismatch` if the content does not
/// hash to `expected`. Returns the number of bytes copied.
pub fn copy_verified<R: Read, W: Write>(
    mut reader: R,
    writer: W,
    expected: &Digest,
) -> Result<u64> {
    let mut hashing = HashingWriter::new(writer);
    io::copy(&mut reader, &mut hashing)?;
    hashing.flush()?;
    let (_, actual, size) = hashing.finish();
    verify(expected, &actual)?;
    Ok(size)
}

/// Compare a computed digest with the expected one.
pub fn verify(expected: &Digest, actual: &Digest) -> Result<()> {
    if expected != actual {
        crate::log_digest_mismatch!(expected, actual);
        return Err(CtaError::DigestMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA: &str =
        "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_digest_bytes_known_value() {
        assert_eq!(digest_bytes(b"hello").as_str(), HELLO_SHA);
    }

    #[test]
    fn test_streaming_digest_matches_bytes() {
        let data = vec![7u8; DEFAULT_IO_BUFFER_SIZE * 3 + 17];
        let (digest, size) = digest_of(&data[..]).unwrap();
        assert_eq!(digest, digest_bytes(&data));
        assert_eq!(size, data.len() as u64);
    }

    #[test]
    fn test_parse_rejects_bad_digests() {
        assert!(Digest::parse("md5:abc").is_err());
        assert!(Digest::parse("sha256:xyz").is_err());
        assert!(Digest::parse(HELLO_SHA).is_ok());
    }

    #[test]
    fn test_file_name_form() {
        let d = Digest::parse(HELLO_SHA).unwrap();
        assert!(d.file_name().starts_with("sha256."));
        assert_eq!(Digest::from_file_name(&d.file_name()).unwrap(), d);
    }

    #[test]
    fn test_blobref_equality_is_digest_equality() {
        let d = digest_bytes(b"hello");
        let a = BlobRef::new("application/octet-stream", d.clone(), 5);
        let b = BlobRef::new("application/vnd.oci.image.layer.v1.tar", d, 999);
        assert_eq!(a, b);
    }

    #[test]
    fn test_copy_verified_detects_corruption() {
        let expected = digest_bytes(b"hello");
        let mut out = Vec::new();
        let err = copy_verified(&b"hellO"[..], &mut out, &expected).unwrap_err();
        assert!(matches!(err, CtaError::DigestMismatch { .. }));

        let mut out = Vec::new();
        assert_eq!(copy_verified(&b"hello"[..], &mut out, &expected).unwrap(), 5);
        assert_eq!(out, b"hello");
    }

    #[test]
    fn test_blobref_serializes_oci_field_names() {
        let blob = BlobRef::for_bytes("application/vnd.oci.image.config.v1+json", b"{}");
        let json = serde_json::to_value(&blob).unwrap();
        assert_eq!(json["mediaType"], "application/vnd.oci.image.config.v1+json");
        assert_eq!(json["size"], 2);
        assert!(json["digest"].as_str().unwrap().starts_with("sha256:"));
    }
}
