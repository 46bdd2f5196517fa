//! Layer and archive construction.
//!
//! Layers are built as a plain tar first and digested (the `diff_id`), then compressed
//! in a second pass over the finished tar so the uncompressed digest never depends on
//! the compression library. Header metadata is normalized (mtime, uid, gid) to keep
//! repeated builds of the same tree byte-identical.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, EntryType, Header};
use tempfile::NamedTempFile;

use crate::digest::{digest_file, BlobRef, Digest};
use crate::error::{CtaError, Result};
use crate::walker::{walk_dir, WalkEntry};

/// A layer blob materialized in a temporary file.
#[derive(Debug)]
pub struct LayerBlob {
    /// Digest of the uncompressed tar
    pub diff_id: Digest,
    /// Digest of the stored bytes (equals `diff_id` when not compressed)
    pub digest: Digest,
    pub size: u64,
    pub compressed: bool,
    file: NamedTempFile,
}

impl LayerBlob {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn open(&self) -> Result<File> {
        Ok(File::open(self.file.path())?)
    }

    pub fn blob_ref(&self, media_type: &str) -> BlobRef {
        BlobRef::new(media_type, self.digest.clone(), self.size)
    }
}

/// Build a layer from `dir`.
///
/// Members are stored as `<dirname>/<relative path>` so extracting the layer at `/`
/// recreates `/<dirname>/...`. An empty directory yields an empty tar.
pub fn build_layer(dir: &Path, compress: bool) -> Result<LayerBlob> {
    let prefix = dir
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| {
            CtaError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot derive a layer prefix from {}", dir.display()),
            ))
        })?;

    let tar_file = NamedTempFile::new()?;
    {
        let mut builder = Builder::new(BufWriter::new(tar_file.reopen()?));
        append_tree(&mut builder, dir, Some(&prefix))?;
        builder.into_inner()?.flush()?;
    }
    let (diff_id, tar_size) = digest_file(tar_file.path())?;

    if !compress {
        tracing::debug!(dir = %dir.display(), diff_id = %diff_id, size = tar_size, "Built layer");
        return Ok(LayerBlob {
            digest: diff_id.clone(),
            diff_id,
            size: tar_size,
            compressed: false,
            file: tar_file,
        });
    }

    let gz_file = gzip_file(tar_file.path())?;
    let (digest, size) = digest_file(gz_file.path())?;
    tracing::debug!(
        dir = %dir.display(),
        diff_id = %diff_id,
        digest = %digest,
        size,
        "Built compressed layer"
    );

    Ok(LayerBlob {
        diff_id,
        digest,
        size,
        compressed: true,
        file: gz_file,
    })
}

/// Second pass: gzip an already materialized file into a new temp file.
fn gzip_file(source: &Path) -> Result<NamedTempFile> {
    let out = NamedTempFile::new()?;
    let mut input = BufReader::new(File::open(source)?);
    let mut encoder = GzEncoder::new(BufWriter::new(out.reopen()?), Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.flush()?;
    Ok(out)
}

fn normalized_header(entry_type: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else {
        0o644
    }
}

fn append_entry<W: Write>(
    builder: &mut Builder<W>,
    entry: &WalkEntry,
    member: &Path,
) -> Result<()> {
    if entry.is_symlink {
        let target = fs::read_link(&entry.path)?;
        let mut header = normalized_header(EntryType::Symlink, 0o777, 0);
        builder.append_link(&mut header, member, target)?;
        return Ok(());
    }

    let metadata = fs::metadata(&entry.path)?;
    if entry.is_dir {
        let mut header = normalized_header(EntryType::Directory, file_mode(&metadata), 0);
        builder.append_data(&mut header, member, io::empty())?;
    } else {
        let mut header =
            normalized_header(EntryType::Regular, file_mode(&metadata), metadata.len());
        builder.append_data(&mut header, member, File::open(&entry.path)?)?;
    }
    Ok(())
}

fn append_tree<W: Write>(
    builder: &mut Builder<W>,
    root: &Path,
    prefix: Option<&Path>,
) -> Result<()> {
    for entry in walk_dir(root)? {
        let member = match prefix {
            Some(p) => p.join(&entry.relative),
            None => entry.relative.clone(),
        };
        append_entry(builder, &entry, &member)?;
    }
    Ok(())
}

/// Build an in-memory tar holding exactly one regular file.
pub fn tar_single_file(name: &str, data: &[u8]) -> Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    let mut header = normalized_header(EntryType::Regular, 0o644, data.len() as u64);
    builder.append_data(&mut header, name, data)?;
    Ok(builder.into_inner()?)
}

/// Extract the single regular file from a tar stream.
///
/// Fails with `MalformedArchive` when the tar holds no file or more than one.
pub fn extract_single_member<R: Read>(reader: R) -> Result<(String, Vec<u8>)> {
    let mut archive = Archive::new(reader);
    let mut found: Option<(String, Vec<u8>)> = None;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        if found.is_some() {
            return Err(CtaError::malformed(
                "expected a single member in descriptor tar, found several",
            ));
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;
        found = Some((name, content));
    }
    found.ok_or_else(|| CtaError::malformed("descriptor tar contains no file"))
}

/// Archive the contents of `dir` (without a prefix) as a tar.gz temp file.
pub fn tar_gz_dir(dir: &Path) -> Result<NamedTempFile> {
    let out = NamedTempFile::new()?;
    {
        let encoder = GzEncoder::new(BufWriter::new(out.reopen()?), Compression::default());
        let mut builder = Builder::new(encoder);
        append_tree(&mut builder, dir, None)?;
        builder.into_inner()?.finish()?.flush()?;
    }
    Ok(out)
}

/// Unpack a tar.gz stream below `dest`. Entries escaping `dest` are rejected by `tar`.
pub fn extract_tar_gz<R: Read>(reader: R, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    let mut archive = Archive::new(GzDecoder::new(reader));
    archive.unpack(dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::digest_of;
    use tempfile::TempDir;

    fn make_hello_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        let hello = dir.path().join("hello");
        fs::create_dir(&hello).unwrap();
        fs::write(hello.join("hello"), b"#!/bin/sh\necho hello\n").unwrap();
        fs::write(hello.join("VERSION"), b"0.1.0\n").unwrap();
        dir
    }

    fn member_names(path: &Path, gz: bool) -> Vec<String> {
        let file = File::open(path).unwrap();
        let reader: Box<dyn Read> = if gz {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        let mut archive = Archive::new(reader);
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_layer_members_are_prefixed_with_dir_name() {
        let dir = make_hello_dir();
        let layer = build_layer(&dir.path().join("hello"), false).unwrap();
        let names = member_names(layer.path(), false);
        assert_eq!(names, vec!["hello/VERSION", "hello/hello"]);
    }

    #[test]
    fn test_uncompressed_digest_is_deterministic() {
        let dir = make_hello_dir();
        let a = build_layer(&dir.path().join("hello"), true).unwrap();
        let b = build_layer(&dir.path().join("hello"), true).unwrap();
        assert_eq!(a.diff_id, b.diff_id);
        assert_eq!(a.digest, b.digest);
    }

    #[test]
    fn test_compressed_digest_differs_from_diff_id() {
        let dir = make_hello_dir();
        let layer = build_layer(&dir.path().join("hello"), true).unwrap();
        assert!(layer.compressed);
        assert_ne!(layer.diff_id, layer.digest);

        // diff_id is the digest of the decompressed stream
        let (decompressed, _) = digest_of(GzDecoder::new(layer.open().unwrap())).unwrap();
        assert_eq!(decompressed, layer.diff_id);
        assert_eq!(member_names(layer.path(), true).len(), 2);
    }

    #[test]
    fn test_uncompressed_layer_digest_equals_diff_id() {
        let dir = make_hello_dir();
        let layer = build_layer(&dir.path().join("hello"), false).unwrap();
        assert_eq!(layer.diff_id, layer.digest);
        assert_eq!(layer.size, fs::metadata(layer.path()).unwrap().len());
    }

    #[test]
    fn test_empty_dir_yields_valid_tar() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty");
        fs::create_dir(&empty).unwrap();
        let layer = build_layer(&empty, false).unwrap();
        assert!(member_names(layer.path(), false).is_empty());
        assert!(layer.size > 0);
    }

    #[test]
    fn test_single_member_roundtrip_and_rejection() {
        let tar = tar_single_file("component-descriptor.yaml", b"meta: {}\n").unwrap();
        let (name, content) = extract_single_member(&tar[..]).unwrap();
        assert_eq!(name, "component-descriptor.yaml");
        assert_eq!(content, b"meta: {}\n");

        let mut builder = Builder::new(Vec::new());
        for name in ["a", "b"] {
            let mut header = normalized_header(EntryType::Regular, 0o644, 1);
            builder.append_data(&mut header, name, &b"x"[..]).unwrap();
        }
        let two = builder.into_inner().unwrap();
        assert!(matches!(
            extract_single_member(&two[..]),
            Err(CtaError::MalformedArchive(_))
        ));
    }

    #[test]
    fn test_tar_gz_dir_extracts_to_same_tree() {
        let dir = make_hello_dir();
        let archive = tar_gz_dir(&dir.path().join("hello")).unwrap();
        let out = TempDir::new().unwrap();
        extract_tar_gz(File::open(archive.path()).unwrap(), out.path()).unwrap();
        assert_eq!(fs::read(out.path().join("VERSION")).unwrap(), b"0.1.0\n");
    }
}
