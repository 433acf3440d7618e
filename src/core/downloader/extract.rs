use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::core::error::{FetchError, FetchResult};

/// Unpacks a committed archive into a target directory.
#[async_trait]
pub trait ArchiveExtractor: Send + Sync {
    /// Extract `archive` into `target`, skipping entries whose name starts with any
    /// prefix in `exclude`. Returns the number of files written.
    async fn extract(&self, archive: &Path, target: &Path, exclude: &[String])
        -> FetchResult<usize>;
}

/// Zip/jar extraction on the blocking pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipExtractor;

#[async_trait]
impl ArchiveExtractor for ZipExtractor {
    async fn extract(
        &self,
        archive: &Path,
        target: &Path,
        exclude: &[String],
    ) -> FetchResult<usize> {
        let archive = archive.to_path_buf();
        let target = target.to_path_buf();
        let exclude = exclude.to_vec();
        tokio::task::spawn_blocking(move || extract_zip_file(&archive, &target, &exclude))
            .await
            .map_err(|e| FetchError::Other(format!("Task join error: {e}")))?
    }
}

pub fn extract_zip_file(zip_path: &Path, target: &Path, exclude: &[String]) -> FetchResult<usize> {
    let zip_file = std::fs::File::open(zip_path).map_err(|source| FetchError::Io {
        path: zip_path.to_path_buf(),
        source,
    })?;
    let mut archive = zip::ZipArchive::new(zip_file)?;

    std::fs::create_dir_all(target).map_err(|source| FetchError::Io {
        path: target.to_path_buf(),
        source,
    })?;

    let mut written = 0_usize;
    for index in 0..archive.len() {
        let mut zipped = archive.by_index(index)?;
        let name = zipped.name().to_string();

        if exclude.iter().any(|prefix| name.starts_with(prefix.as_str())) {
            continue;
        }

        let rel_path: PathBuf = zipped.enclosed_name().ok_or_else(|| FetchError::Extraction {
            path: zip_path.to_path_buf(),
            message: format!("unsafe entry path {name:?}"),
        })?;
        if rel_path.as_os_str().is_empty() {
            continue;
        }

        let out_path = target.join(rel_path);
        if zipped.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|source| FetchError::Io {
                path: out_path,
                source,
            })?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| FetchError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut out = std::fs::File::create(&out_path).map_err(|source| FetchError::Io {
            path: out_path.clone(),
            source,
        })?;
        std::io::copy(&mut zipped, &mut out).map_err(|source| FetchError::Io {
            path: out_path,
            source,
        })?;
        written += 1;
    }

    debug!("Extracted {} files from {:?} into {:?}", written, zip_path, target);
    Ok(written)
}

#[cfg(test)]
pub(crate) fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, data) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
        }
        writer.finish().unwrap();
    }
    cursor.into_inner()
}
