use crate::types::CompressionType;
use kiln_core::{Error, Result};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const ZSTD_LEVEL: i32 = 3;

/// Create an archive from paths relative to `base_dir`. Missing paths are
/// skipped.
pub fn create_archive<W: Write>(
    writer: W,
    paths: &[PathBuf],
    base_dir: &Path,
    compression: CompressionType,
) -> Result<()> {
    match compression {
        CompressionType::Zstd => {
            let mut encoder = zstd::stream::write::Encoder::new(writer, ZSTD_LEVEL)
                .map_err(|e| Error::Cache(format!("Zstd init failed: {}", e)))?;
            append_paths(&mut encoder, paths, base_dir)?;
            encoder
                .finish()
                .map_err(|e| Error::Cache(format!("Zstd finish failed: {}", e)))?;
        }
        CompressionType::None => {
            let mut writer = writer;
            append_paths(&mut writer, paths, base_dir)?;
        }
    }
    Ok(())
}

fn append_paths<W: Write>(writer: W, paths: &[PathBuf], base_dir: &Path) -> Result<()> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    for p in paths {
        let (abs_path, name) = if p.is_absolute() {
            let name = p.strip_prefix(base_dir).map_err(|_| {
                Error::Cache(format!("{} is outside {}", p.display(), base_dir.display()))
            })?;
            (p.clone(), name.to_path_buf())
        } else {
            (base_dir.join(p), p.clone())
        };

        if !abs_path.exists() {
            debug!(path = %abs_path.display(), "Cache path does not exist, skipping");
            continue;
        }

        if abs_path.is_dir() {
            builder
                .append_dir_all(&name, &abs_path)
                .map_err(|e| Error::Cache(format!("Failed to pack dir: {}", e)))?;
        } else {
            builder
                .append_path_with_name(&abs_path, &name)
                .map_err(|e| Error::Cache(format!("Failed to pack file: {}", e)))?;
        }
    }

    builder
        .finish()
        .map_err(|e| Error::Cache(format!("Failed to finish tar: {}", e)))
}

/// Extract an archive to a destination, overwriting existing files.
pub fn extract_archive<R: Read>(
    reader: R,
    dest: &Path,
    compression: CompressionType,
) -> Result<()> {
    match compression {
        CompressionType::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(reader)
                .map_err(|e| Error::Cache(format!("Failed to create decoder: {}", e)))?;
            unpack(tar::Archive::new(decoder), dest)
        }
        CompressionType::None => unpack(tar::Archive::new(reader), dest),
    }
}

fn unpack<R: Read>(mut archive: tar::Archive<R>, dest: &Path) -> Result<()> {
    archive.set_overwrite(true);
    archive
        .unpack(dest)
        .map_err(|e| Error::Cache(format!("Failed to unpack archive: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_directory_and_file() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("target/debug")).unwrap();
        std::fs::write(src.path().join("target/debug/app"), b"binary").unwrap();
        std::fs::write(src.path().join("notes.txt"), b"hello").unwrap();

        let mut buf = Vec::new();
        create_archive(
            &mut buf,
            &[
                PathBuf::from("target"),
                PathBuf::from("notes.txt"),
                PathBuf::from("missing"),
            ],
            src.path(),
            CompressionType::Zstd,
        )
        .unwrap();

        let dest = tempfile::tempdir().unwrap();
        extract_archive(buf.as_slice(), dest.path(), CompressionType::Zstd).unwrap();

        assert_eq!(
            std::fs::read(dest.path().join("target/debug/app")).unwrap(),
            b"binary"
        );
        assert_eq!(std::fs::read(dest.path().join("notes.txt")).unwrap(), b"hello");
        assert!(!dest.path().join("missing").exists());
    }

    #[test]
    fn test_absolute_path_outside_base_is_rejected() {
        let base = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let err = create_archive(
            Vec::new(),
            &[other.path().to_path_buf()],
            base.path(),
            CompressionType::None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Cache(_)));
    }
}
