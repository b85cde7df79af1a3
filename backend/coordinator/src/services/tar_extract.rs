//! Safe extraction of worker artifact archives
//!
//! Workers upload gzipped tar archives of HLS artifacts. Nothing from an
//! archive may land under the videos tree until every entry has passed these
//! rules: regular files only, plain filenames, per-endpoint extension
//! allow-list, and per-file/total size caps. Extraction happens into a
//! caller-provided staging directory, never the destination, and every
//! extracted file gets 0644 permissions.

use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tar::{Archive, EntryType};
use thiserror::Error;

/// Which endpoint the archive arrived on; controls the extension allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    /// Variant artifacts: playlists and segments.
    Quality,
    /// Master playlist and thumbnail.
    Finalize,
}

impl UploadKind {
    pub fn allowed_extensions(&self) -> &'static [&'static str] {
        match self {
            UploadKind::Quality => &["m3u8", "ts", "m4s", "mp4"],
            UploadKind::Finalize => &["m3u8", "jpg"],
        }
    }
}

/// Size caps applied during extraction.
#[derive(Debug, Clone, Copy)]
pub struct ExtractLimits {
    pub max_file_bytes: u64,
    pub max_total_bytes: u64,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("symlinks not allowed in archive: {0}")]
    Symlink(String),
    #[error("hard links not allowed in archive: {0}")]
    HardLink(String),
    #[error("special entries not allowed in archive: {0}")]
    SpecialEntry(String),
    #[error("invalid member path: {0}")]
    InvalidPath(String),
    #[error("disallowed file extension: {0}")]
    DisallowedExtension(String),
    #[error("archive member too large: {name} ({size} bytes)")]
    FileTooLarge { name: String, size: u64 },
    #[error("archive exceeds total size cap ({0} bytes)")]
    TotalTooLarge(u64),
    #[error("archive read error: {0}")]
    Io(#[from] io::Error),
}

/// Validate a tar member name: a plain filename with an allow-listed
/// extension. Anything with separators, traversal components, or a leading
/// dot is rejected.
pub fn validate_member_name(name: &str, kind: UploadKind) -> Result<(), ExtractError> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.starts_with('.')
        || name.contains('\0')
    {
        return Err(ExtractError::InvalidPath(name.to_string()));
    }

    let extension = name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    if !kind
        .allowed_extensions()
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(extension))
    {
        return Err(ExtractError::DisallowedExtension(name.to_string()));
    }

    Ok(())
}

/// Extract a gzipped tar archive into `staging_dir`, enforcing the safety
/// rules. Returns the extracted file names. On any violation the staging
/// directory contents are removed before the error is returned.
///
/// This is synchronous on purpose: the caller runs it under
/// `spawn_blocking` with a wall-clock timeout.
pub fn extract_archive(
    archive_path: &Path,
    staging_dir: &Path,
    kind: UploadKind,
    limits: ExtractLimits,
) -> Result<Vec<PathBuf>, ExtractError> {
    match extract_inner(archive_path, staging_dir, kind, limits) {
        Ok(files) => Ok(files),
        Err(e) => {
            // Drop partial extraction so nothing can be picked up later
            if let Ok(entries) = fs::read_dir(staging_dir) {
                for entry in entries.flatten() {
                    let _ = fs::remove_file(entry.path());
                }
            }
            Err(e)
        }
    }
}

fn extract_inner(
    archive_path: &Path,
    staging_dir: &Path,
    kind: UploadKind,
    limits: ExtractLimits,
) -> Result<Vec<PathBuf>, ExtractError> {
    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));

    let mut extracted = Vec::new();
    let mut total_bytes: u64 = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_path = entry.path()?.to_string_lossy().into_owned();

        match entry.header().entry_type() {
            EntryType::Regular => {}
            EntryType::Symlink => return Err(ExtractError::Symlink(raw_path)),
            EntryType::Link => return Err(ExtractError::HardLink(raw_path)),
            other => {
                return Err(ExtractError::SpecialEntry(format!(
                    "{raw_path} ({other:?})"
                )))
            }
        }

        validate_member_name(&raw_path, kind)?;

        let size = entry.header().size()?;
        if size > limits.max_file_bytes {
            return Err(ExtractError::FileTooLarge {
                name: raw_path,
                size,
            });
        }
        total_bytes = total_bytes.saturating_add(size);
        if total_bytes > limits.max_total_bytes {
            return Err(ExtractError::TotalTooLarge(total_bytes));
        }

        let dest = staging_dir.join(&raw_path);
        let mut out = File::create(&dest)?;
        // Cap the copy at the declared size; a lying header cannot exceed it
        let written = io::copy(&mut (&mut entry).take(limits.max_file_bytes + 1), &mut out)?;
        if written > limits.max_file_bytes {
            let _ = fs::remove_file(&dest);
            return Err(ExtractError::FileTooLarge {
                name: raw_path,
                size: written,
            });
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dest, fs::Permissions::from_mode(0o644))?;
        }

        extracted.push(PathBuf::from(raw_path));
    }

    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tar::{Builder, Header};

    const LIMITS: ExtractLimits = ExtractLimits {
        max_file_bytes: 1024 * 1024,
        max_total_bytes: 8 * 1024 * 1024,
    };

    fn build_archive(path: &Path, build: impl FnOnce(&mut Builder<GzEncoder<File>>)) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::fast());
        let mut builder = Builder::new(encoder);
        build(&mut builder);
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn add_file(builder: &mut Builder<GzEncoder<File>>, name: &str, content: &[u8]) {
        let mut header = Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o777);
        // Write the raw name bytes directly: `Header::set_path`/`Builder::append_data`
        // reject ".." components, but some tests need to build archives containing
        // them to verify that `extract_archive` itself rejects such entries.
        let name_bytes = name.as_bytes();
        header.as_old_mut().name[..name_bytes.len()].copy_from_slice(name_bytes);
        header.set_cksum();
        builder.append(&header, content).unwrap();
    }

    #[test]
    fn test_valid_quality_archive_extracts() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("upload.tar.gz");
        let staging = dir.path().join("staging");
        fs::create_dir(&staging).unwrap();

        build_archive(&archive, |b| {
            add_file(b, "720p.m3u8", b"#EXTM3U\n#EXTINF:6.0,\n720p_0000.ts\n#EXT-X-ENDLIST\n");
            add_file(b, "720p_0000.ts", b"segment-bytes");
        });

        let files = extract_archive(&archive, &staging, UploadKind::Quality, LIMITS).unwrap();
        assert_eq!(files.len(), 2);
        assert!(staging.join("720p.m3u8").is_file());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(staging.join("720p_0000.ts"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o644);
        }
    }

    #[test]
    fn test_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("upload.tar.gz");
        let staging = dir.path().join("staging");
        fs::create_dir(&staging).unwrap();

        build_archive(&archive, |b| {
            add_file(b, "../../etc/passwd", b"root:x:0:0");
        });

        let err = extract_archive(&archive, &staging, UploadKind::Quality, LIMITS).unwrap_err();
        assert!(matches!(err, ExtractError::InvalidPath(_)));
        assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[test]
    fn test_rejects_symlink_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("upload.tar.gz");
        let staging = dir.path().join("staging");
        fs::create_dir(&staging).unwrap();

        build_archive(&archive, |b| {
            add_file(b, "720p.m3u8", b"#EXTM3U");
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            header.set_cksum();
            b.append_link(&mut header, "evil.ts", "/etc/passwd").unwrap();
        });

        let err = extract_archive(&archive, &staging, UploadKind::Quality, LIMITS).unwrap_err();
        assert!(matches!(err, ExtractError::Symlink(_)));
        // The valid file extracted before the symlink must be cleaned up too
        assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[test]
    fn test_rejects_disallowed_extension() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("upload.tar.gz");
        let staging = dir.path().join("staging");
        fs::create_dir(&staging).unwrap();

        build_archive(&archive, |b| {
            add_file(b, "install.sh", b"#!/bin/sh\n");
        });

        let err = extract_archive(&archive, &staging, UploadKind::Quality, LIMITS).unwrap_err();
        assert!(matches!(err, ExtractError::DisallowedExtension(_)));
    }

    #[test]
    fn test_finalize_allows_only_playlist_and_thumbnail() {
        assert!(validate_member_name("master.m3u8", UploadKind::Finalize).is_ok());
        assert!(validate_member_name("thumbnail.jpg", UploadKind::Finalize).is_ok());
        assert!(validate_member_name("720p_0000.ts", UploadKind::Finalize).is_err());
        assert!(validate_member_name("init.mp4", UploadKind::Finalize).is_err());
    }

    #[test]
    fn test_quality_allows_cmaf_artifacts() {
        assert!(validate_member_name("stream.m3u8", UploadKind::Quality).is_ok());
        assert!(validate_member_name("init.mp4", UploadKind::Quality).is_ok());
        assert!(validate_member_name("seg_0001.m4s", UploadKind::Quality).is_ok());
    }

    #[test]
    fn test_invalid_member_names() {
        for name in [
            "",
            "a/b.ts",
            "..",
            "..m3u8",
            ".hidden.m3u8",
            "a\\b.ts",
            "dir/../x.ts",
        ] {
            assert!(
                validate_member_name(name, UploadKind::Quality).is_err(),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_rejects_oversized_file() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("upload.tar.gz");
        let staging = dir.path().join("staging");
        fs::create_dir(&staging).unwrap();

        build_archive(&archive, |b| {
            add_file(b, "huge.ts", &vec![0u8; 4096]);
        });

        let limits = ExtractLimits {
            max_file_bytes: 1024,
            max_total_bytes: 8 * 1024,
        };
        let err = extract_archive(&archive, &staging, UploadKind::Quality, limits).unwrap_err();
        assert!(matches!(err, ExtractError::FileTooLarge { .. }));
    }

    #[test]
    fn test_rejects_oversized_total() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("upload.tar.gz");
        let staging = dir.path().join("staging");
        fs::create_dir(&staging).unwrap();

        build_archive(&archive, |b| {
            add_file(b, "a_0000.ts", &vec![0u8; 700]);
            add_file(b, "a_0001.ts", &vec![0u8; 700]);
        });

        let limits = ExtractLimits {
            max_file_bytes: 1024,
            max_total_bytes: 1000,
        };
        let err = extract_archive(&archive, &staging, UploadKind::Quality, limits).unwrap_err();
        assert!(matches!(err, ExtractError::TotalTooLarge(_)));
    }
}
