use crate::database::MAIN_DB_NAME;
use crate::errors::{DomainError, DomainResult, SyncError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Packs the MAIN store's on-disk files into a gzip-compressed tar archive
/// and reverses the operation when applying a remote snapshot.
///
/// Archive entries carry base names only; the store file must be present
/// under its canonical name for the archive to be loadable anywhere.
pub struct FileArchiver;

impl FileArchiver {
    /// Pack each regular file under its base name, gzip the tar stream.
    pub fn archive(paths: &[PathBuf]) -> DomainResult<Vec<u8>> {
        let gz = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(gz);

        for path in paths {
            let base_name = path
                .file_name()
                .ok_or_else(|| DomainError::File(format!("no base name: {}", path.display())))?;
            let mut file = File::open(path)
                .map_err(|e| DomainError::File(format!("open {}: {}", path.display(), e)))?;
            builder
                .append_file(base_name, &mut file)
                .map_err(|e| DomainError::File(format!("archive {}: {}", path.display(), e)))?;
        }

        let gz = builder
            .into_inner()
            .map_err(|e| DomainError::File(format!("finish tar stream: {}", e)))?;
        gz.finish()
            .map_err(|e| DomainError::File(format!("finish gzip stream: {}", e)))
    }

    /// Unpack an archive into `dir` and return the path of the entry whose
    /// base name is the canonical store file name. Entry names that would
    /// escape `dir` are rejected.
    pub fn extract(bytes: &[u8], dir: &Path) -> DomainResult<PathBuf> {
        let mut archive = tar::Archive::new(GzDecoder::new(bytes));
        let mut db_path: Option<PathBuf> = None;

        let entries = archive
            .entries()
            .map_err(|e| corrupt(format!("read tar entries: {}", e)))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| corrupt(format!("read tar entry: {}", e)))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let base_name = {
                let path = entry
                    .path()
                    .map_err(|e| corrupt(format!("tar entry path: {}", e)))?;
                match path.file_name() {
                    Some(name) => name.to_os_string(),
                    None => continue,
                }
            };
            let target = dir.join(&base_name);
            entry
                .unpack(&target)
                .map_err(|e| DomainError::File(format!("unpack {:?}: {}", base_name, e)))?;
            if base_name == MAIN_DB_NAME {
                db_path = Some(target);
            }
        }

        db_path.ok_or_else(|| corrupt(format!("{} not found in the archive", MAIN_DB_NAME)))
    }
}

fn corrupt(msg: String) -> DomainError {
    DomainError::Sync(SyncError::CorruptBlob(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SyncError;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn archive_then_extract_round_trips_store_files() {
        let src = TempDir::new().unwrap();
        let db = src.path().join(MAIN_DB_NAME);
        let wal = src.path().join(format!("{}-wal", MAIN_DB_NAME));
        fs::write(&db, b"main store bytes").unwrap();
        fs::write(&wal, b"wal bytes").unwrap();

        let bytes = FileArchiver::archive(&[db, wal]).unwrap();

        let dst = TempDir::new().unwrap();
        let extracted = FileArchiver::extract(&bytes, dst.path()).unwrap();
        assert_eq!(extracted, dst.path().join(MAIN_DB_NAME));
        assert_eq!(fs::read(&extracted).unwrap(), b"main store bytes");
        assert_eq!(
            fs::read(dst.path().join(format!("{}-wal", MAIN_DB_NAME))).unwrap(),
            b"wal bytes"
        );
    }

    #[test]
    fn extract_rejects_archives_without_the_store_file() {
        let src = TempDir::new().unwrap();
        let stray = src.path().join("notes.txt");
        fs::write(&stray, b"not a database").unwrap();
        let bytes = FileArchiver::archive(&[stray]).unwrap();

        let dst = TempDir::new().unwrap();
        let err = FileArchiver::extract(&bytes, dst.path()).unwrap_err();
        assert!(matches!(
            err,
            DomainError::Sync(SyncError::CorruptBlob(_))
        ));
    }

    #[test]
    fn extract_rejects_garbage_bytes() {
        let dst = TempDir::new().unwrap();
        let err = FileArchiver::extract(b"definitely not gzip", dst.path()).unwrap_err();
        assert!(matches!(err, DomainError::Sync(SyncError::CorruptBlob(_))));
    }
}
