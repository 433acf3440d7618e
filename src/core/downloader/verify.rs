use std::fmt;
use std::path::Path;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::core::error::{FetchError, FetchResult};

const READ_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha512,
    Md5,
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DigestAlgorithm::Sha1 => "SHA-1",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha512 => "SHA-512",
            DigestAlgorithm::Md5 => "MD5",
        };
        f.write_str(name)
    }
}

/// Hash the final bytes of an item must match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedDigest {
    pub algorithm: DigestAlgorithm,
    pub hex: String,
}

impl ExpectedDigest {
    pub fn new(algorithm: DigestAlgorithm, hex: impl Into<String>) -> Self {
        Self {
            algorithm,
            hex: hex.into(),
        }
    }

    pub fn sha1(hex: impl Into<String>) -> Self {
        Self::new(DigestAlgorithm::Sha1, hex)
    }

    pub fn sha256(hex: impl Into<String>) -> Self {
        Self::new(DigestAlgorithm::Sha256, hex)
    }

    pub fn sha512(hex: impl Into<String>) -> Self {
        Self::new(DigestAlgorithm::Sha512, hex)
    }

    pub fn md5(hex: impl Into<String>) -> Self {
        Self::new(DigestAlgorithm::Md5, hex)
    }

    pub fn matches(&self, actual_hex: &str) -> bool {
        self.hex.trim().eq_ignore_ascii_case(actual_hex)
    }
}

/// Incremental hasher over one of the supported algorithms.
pub enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Sha512),
    Md5(Md5),
}

impl Hasher {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            DigestAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
            DigestAlgorithm::Md5 => Hasher::Md5(Md5::new()),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(bytes),
            Hasher::Sha256(h) => h.update(bytes),
            Hasher::Sha512(h) => h.update(bytes),
            Hasher::Md5(h) => h.update(bytes),
        }
    }

    /// Lowercase hex of the accumulated digest.
    pub fn finalize_hex(self) -> String {
        match self {
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
            Hasher::Md5(h) => hex::encode(h.finalize()),
        }
    }
}

/// Digest a byte stream with constant memory.
pub async fn digest_reader<R>(mut reader: R, algorithm: DigestAlgorithm) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0_u8; READ_BUFFER];
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize_hex())
}

pub async fn digest_file(path: &Path, algorithm: DigestAlgorithm) -> FetchResult<String> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|source| FetchError::io(path, source))?;
    digest_reader(file, algorithm)
        .await
        .map_err(|source| FetchError::io(path, source))
}

/// Whether `path` already holds the expected content.
///
/// Returns the on-disk size when the file exists, at least one expectation is given,
/// and every given expectation matches. Without expectations nothing is trusted.
pub async fn file_matches(
    path: &Path,
    expected_digest: Option<&ExpectedDigest>,
    expected_size: Option<u64>,
) -> FetchResult<Option<u64>> {
    if expected_digest.is_none() && expected_size.is_none() {
        return Ok(None);
    }

    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(FetchError::io(path, source)),
    };

    let size = metadata.len();
    if let Some(expected) = expected_size {
        if size != expected {
            return Ok(None);
        }
    }

    if let Some(expected) = expected_digest {
        let actual = digest_file(path, expected.algorithm).await?;
        if !expected.matches(&actual) {
            return Ok(None);
        }
    }

    Ok(Some(size))
}
