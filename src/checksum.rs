//! `Upload-Checksum` 分片校验。

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use md5::Md5;
use sha2::{Digest, Sha256};

use crate::error::TusError;

/// 通过 `Tus-Checksum-Algorithm` 公布的算法。
pub const SUPPORTED_ALGORITHMS: &str = "sha256,md5";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
    Md5,
}

impl ChecksumAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Md5 => "md5",
        }
    }

    fn digest(self, bytes: &[u8]) -> Vec<u8> {
        match self {
            ChecksumAlgorithm::Sha256 => Sha256::digest(bytes).to_vec(),
            ChecksumAlgorithm::Md5 => Md5::digest(bytes).to_vec(),
        }
    }
}

/// 单个分片的期望摘要。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    digest: Vec<u8>,
}

impl Checksum {
    /// 解析 `<algorithm> <base64 digest>`。
    pub fn parse(value: &str) -> Result<Self, TusError> {
        let (name, encoded) = value
            .trim()
            .split_once(' ')
            .ok_or_else(|| TusError::UnsupportedChecksum(value.to_string()))?;
        let algorithm = match name.to_ascii_lowercase().as_str() {
            "sha256" => ChecksumAlgorithm::Sha256,
            "md5" => ChecksumAlgorithm::Md5,
            other => return Err(TusError::UnsupportedChecksum(other.to_string())),
        };
        let digest = STANDARD
            .decode(encoded.trim())
            .map_err(|_| TusError::UnsupportedChecksum("digest is not base64".into()))?;
        Ok(Self { algorithm, digest })
    }

    pub fn of(algorithm: ChecksumAlgorithm, bytes: &[u8]) -> Self {
        Self {
            algorithm,
            digest: algorithm.digest(bytes),
        }
    }

    pub fn verify(&self, bytes: &[u8]) -> Result<(), TusError> {
        if self.algorithm.digest(bytes) != self.digest {
            return Err(TusError::ChecksumMismatch {
                algorithm: self.algorithm.name(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_verifies_sha256() {
        // sha256("hello world")
        let checksum =
            Checksum::parse("sha256 uU0nuZNNPgilLlLX2n2r+sSE7+N6U4DukIj3rOLvzek=").expect("parse");
        assert_eq!(checksum.algorithm, ChecksumAlgorithm::Sha256);
        checksum.verify(b"hello world").expect("matches");
        assert!(matches!(
            checksum.verify(b"hello there"),
            Err(TusError::ChecksumMismatch { algorithm: "sha256" })
        ));
    }

    #[test]
    fn rejects_unknown_algorithms_and_bad_digests() {
        assert!(matches!(
            Checksum::parse("crc32 AAAA"),
            Err(TusError::UnsupportedChecksum(_))
        ));
        assert!(matches!(
            Checksum::parse("sha256"),
            Err(TusError::UnsupportedChecksum(_))
        ));
        assert!(matches!(
            Checksum::parse("md5 !!!"),
            Err(TusError::UnsupportedChecksum(_))
        ));
    }
}
