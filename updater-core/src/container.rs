//! Package container access.
//!
//! Update packages are zip archives. Only the central directory and the one
//! requested entry are read; other entries are never decompressed.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use tracing::{debug, error};
use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::{ImportError, Result};

/// Location of the OTA metadata entry inside a package.
pub const METADATA_PATH: &str = "META-INF/com/android/metadata";

/// Upper bound on the size of a text entry read into memory (1 MiB).
const MAX_ENTRY_SIZE: u64 = 1024 * 1024;

/// Read a single archive entry as UTF-8 text.
///
/// Returns `NotFound` if the archive has no such entry and `Io` if the archive
/// cannot be opened, is not a valid zip, or the entry cannot be streamed.
/// All handles are dropped on return, whichever path is taken.
pub fn read_entry(package: &Path, entry: &str) -> Result<String> {
    let archive_name = package
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| package.display().to_string());

    let file = File::open(package)
        .map_err(|e| ImportError::io(format!("Failed to open {}", package.display()), e))?;

    let mut archive = ZipArchive::new(BufReader::new(file))
        .map_err(|e| zip_error(&archive_name, e))?;

    let zipped = match archive.by_name(entry) {
        Ok(zipped) => zipped,
        Err(ZipError::FileNotFound) => {
            return Err(ImportError::NotFound {
                entry: entry.to_string(),
                archive: archive_name,
            });
        }
        Err(e) => return Err(zip_error(&archive_name, e)),
    };

    debug!(
        entry = %entry,
        size = zipped.size(),
        compressed = zipped.compressed_size(),
        "Streaming archive entry"
    );

    if zipped.size() > MAX_ENTRY_SIZE {
        return Err(ImportError::io(
            format!("Entry {} in {}", entry, archive_name),
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("entry is {} bytes, limit is {}", zipped.size(), MAX_ENTRY_SIZE),
            ),
        ));
    }

    let mut content = String::new();
    zipped
        .take(MAX_ENTRY_SIZE)
        .read_to_string(&mut content)
        .map_err(|e| {
            error!(entry = %entry, archive = %archive_name, error = %e, "Failed to read file from zip package");
            ImportError::io(format!("Failed to read {} from {}", entry, archive_name), e)
        })?;

    Ok(content)
}

fn zip_error(archive: &str, e: ZipError) -> ImportError {
    match e {
        ZipError::Io(io) => ImportError::io(format!("Failed to read archive {}", archive), io),
        other => ImportError::io(
            format!("Invalid archive {}", archive),
            io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, data) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_reads_named_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        write_zip(
            &path,
            &[
                ("payload.bin", &[0u8; 4096]),
                (METADATA_PATH, b"ota-type=AB\npost-timestamp=1700000000000\n"),
            ],
        );

        let content = read_entry(&path, METADATA_PATH).unwrap();
        assert!(content.contains("post-timestamp=1700000000000"));
    }

    #[test]
    fn test_missing_entry_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        write_zip(&path, &[("payload.bin", b"data")]);

        let err = read_entry(&path, METADATA_PATH).unwrap_err();
        assert!(matches!(err, ImportError::NotFound { .. }));
    }

    #[test]
    fn test_non_zip_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        std::fs::write(&path, b"definitely not a zip archive").unwrap();

        let err = read_entry(&path, METADATA_PATH).unwrap_err();
        assert!(matches!(err, ImportError::Io { .. }));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_entry(&dir.path().join("absent.zip"), METADATA_PATH).unwrap_err();
        assert!(matches!(err, ImportError::Io { .. }));
    }
}
