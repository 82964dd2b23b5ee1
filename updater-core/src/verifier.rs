//! Package signature verification.
//!
//! A signed package is a zip archive whose archive comment carries an ed25519
//! signature, located through a fixed footer at the very end of the file:
//!
//! ```text
//! ┌──────────────────────────┬────────────┬──────────────┬───────────┬───────────┬──────────────┐
//! │ signed region            │ comment    │ signature    │ sig start │ 0xFF 0xFF │ comment size │
//! │ (entries, central dir,   │ length     │ (64 bytes)   │ (u16 LE)  │           │ (u16 LE)     │
//! │  EOCD minus comment len) │ (u16 LE)   │              │           │           │              │
//! └──────────────────────────┴────────────┴──────────────┴───────────┴───────────┴──────────────┘
//! ```
//!
//! The signature covers the SHA-256 digest of the signed region, which is
//! hashed while streaming so large packages are never held in memory.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{ImportError, Result};

const FOOTER_LEN: u64 = 6;
const SIGNATURE_LEN: usize = 64;
/// Comment written by [`sign_package`]: signature followed by the footer.
const SIGNED_COMMENT_LEN: u16 = SIGNATURE_LEN as u16 + FOOTER_LEN as u16;
/// End of central directory record without its comment.
const EOCD_LEN: u64 = 22;
const EOCD_MAGIC: [u8; 4] = [0x50, 0x4b, 0x05, 0x06];
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Whole-package integrity check.
///
/// Implementations may be slow; callers run them on a blocking worker.
pub trait PackageVerifier: Send + Sync {
    /// Verify the package at `path`. The file is left untouched either way.
    fn verify(&self, path: &Path) -> Result<()>;
}

/// Verifies the ed25519 signature embedded in the package comment.
pub struct SignatureVerifier {
    trusted_keys: Vec<VerifyingKey>,
}

impl SignatureVerifier {
    /// Create a verifier trusting the given keys.
    pub fn new(trusted_keys: Vec<VerifyingKey>) -> Self {
        Self { trusted_keys }
    }

    /// Create a verifier from hex-encoded 32-byte public keys.
    pub fn from_hex_keys<S: AsRef<str>>(keys: &[S]) -> Result<Self> {
        let trusted_keys = keys
            .iter()
            .map(|k| parse_public_key(k.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(trusted_keys))
    }

    pub fn trusted_key_count(&self) -> usize {
        self.trusted_keys.len()
    }
}

impl PackageVerifier for SignatureVerifier {
    fn verify(&self, path: &Path) -> Result<()> {
        if self.trusted_keys.is_empty() {
            return Err(ImportError::VerificationFailed(
                "no trusted keys configured".to_string(),
            ));
        }

        let mut file = File::open(path)
            .map_err(|e| ImportError::io(format!("Failed to open {}", path.display()), e))?;
        let len = file
            .metadata()
            .map_err(|e| ImportError::io("Failed to stat package", e))?
            .len();

        let footer = SignatureFooter::read(&mut file, len)?;
        let signature = footer.read_signature(&mut file, len)?;
        let digest = digest_prefix(&mut file, footer.signed_len(len))?;

        let matched = self
            .trusted_keys
            .iter()
            .any(|key| key.verify(&digest, &signature).is_ok());

        if !matched {
            return Err(ImportError::VerificationFailed(
                "signature does not match any trusted key".to_string(),
            ));
        }

        debug!(path = %path.display(), "Package signature verified");
        Ok(())
    }
}

/// Parse a hex-encoded ed25519 public key.
pub fn parse_public_key(hex_key: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| ImportError::VerificationFailed(format!("invalid public key hex: {}", e)))?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
        ImportError::VerificationFailed("public key must be 32 bytes".to_string())
    })?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| ImportError::VerificationFailed(format!("invalid public key: {}", e)))
}

/// Run `verifier` and delete the package if it is rejected.
///
/// The error message tells apart a file that was deleted after failing from
/// one that was already gone.
pub fn verify_or_discard(verifier: &dyn PackageVerifier, path: &Path) -> Result<()> {
    let err = match verifier.verify(path) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to delete rejected package");
        }
        warn!(path = %path.display(), error = %err, "Verification failed, file has been deleted");
        Err(ImportError::VerificationFailed(format!(
            "{}; file has been deleted",
            err
        )))
    } else {
        warn!(path = %path.display(), error = %err, "Verification failed, file already missing");
        Err(ImportError::VerificationFailed(format!(
            "{}; file already missing",
            err
        )))
    }
}

/// Sign a zip archive in place.
///
/// The archive must not carry a comment yet. The signature comment is
/// appended and the end-of-central-directory comment length updated.
pub fn sign_package(path: &Path, key: &SigningKey) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| ImportError::io(format!("Failed to open {}", path.display()), e))?;
    let len = file
        .metadata()
        .map_err(|e| ImportError::io("Failed to stat package", e))?
        .len();

    if len < EOCD_LEN {
        return Err(invalid_archive("archive too short"));
    }
    let mut eocd = [0u8; EOCD_LEN as usize];
    file.seek(SeekFrom::Start(len - EOCD_LEN))
        .and_then(|_| file.read_exact(&mut eocd))
        .map_err(|e| ImportError::io("Failed to read end of central directory", e))?;
    if eocd[..4] != EOCD_MAGIC {
        return Err(invalid_archive("end of central directory not found"));
    }
    if eocd[20..22] != [0, 0] {
        return Err(invalid_archive("archive already carries a comment"));
    }

    let digest = digest_prefix(&mut file, len - 2)?;
    let signature = key.sign(&digest);

    let mut tail = Vec::with_capacity(2 + SIGNED_COMMENT_LEN as usize);
    tail.extend_from_slice(&SIGNED_COMMENT_LEN.to_le_bytes());
    tail.extend_from_slice(&signature.to_bytes());
    tail.extend_from_slice(&SIGNED_COMMENT_LEN.to_le_bytes());
    tail.extend_from_slice(&[0xff, 0xff]);
    tail.extend_from_slice(&SIGNED_COMMENT_LEN.to_le_bytes());

    file.seek(SeekFrom::Start(len - 2))
        .and_then(|_| file.write_all(&tail))
        .and_then(|_| file.sync_all())
        .map_err(|e| ImportError::io("Failed to write package signature", e))?;

    info!(path = %path.display(), "Package signed");
    Ok(())
}

fn invalid_archive(reason: &str) -> ImportError {
    ImportError::io(
        "Cannot sign package",
        io::Error::new(io::ErrorKind::InvalidData, reason.to_string()),
    )
}

/// Footer at the end of a signed package.
struct SignatureFooter {
    signature_start: u64,
    comment_size: u64,
}

impl SignatureFooter {
    fn read(file: &mut File, len: u64) -> Result<Self> {
        if len < FOOTER_LEN + EOCD_LEN {
            return Err(ImportError::VerificationFailed("package too short".to_string()));
        }

        let mut footer = [0u8; FOOTER_LEN as usize];
        file.seek(SeekFrom::Start(len - FOOTER_LEN))
            .and_then(|_| file.read_exact(&mut footer))
            .map_err(|e| ImportError::io("Failed to read signature footer", e))?;

        if footer[2] != 0xff || footer[3] != 0xff {
            return Err(ImportError::VerificationFailed("no signature footer".to_string()));
        }

        let signature_start = u16::from_le_bytes([footer[0], footer[1]]) as u64;
        let comment_size = u16::from_le_bytes([footer[4], footer[5]]) as u64;

        if signature_start != SIGNATURE_LEN as u64 + FOOTER_LEN || signature_start > comment_size {
            return Err(ImportError::VerificationFailed(
                "unsupported signature block".to_string(),
            ));
        }
        if comment_size + EOCD_LEN > len {
            return Err(ImportError::VerificationFailed(
                "comment larger than package".to_string(),
            ));
        }

        // The comment must be the archive comment, so the EOCD sits right before it.
        let mut eocd = [0u8; EOCD_LEN as usize];
        file.seek(SeekFrom::Start(len - comment_size - EOCD_LEN))
            .and_then(|_| file.read_exact(&mut eocd))
            .map_err(|e| ImportError::io("Failed to read end of central directory", e))?;
        if eocd[..4] != EOCD_MAGIC
            || u16::from_le_bytes([eocd[20], eocd[21]]) as u64 != comment_size
        {
            return Err(ImportError::VerificationFailed(
                "signature is not the archive comment".to_string(),
            ));
        }

        Ok(Self {
            signature_start,
            comment_size,
        })
    }

    fn read_signature(&self, file: &mut File, len: u64) -> Result<Signature> {
        let mut bytes = [0u8; SIGNATURE_LEN];
        file.seek(SeekFrom::Start(len - self.signature_start))
            .and_then(|_| file.read_exact(&mut bytes))
            .map_err(|e| ImportError::io("Failed to read signature", e))?;
        Ok(Signature::from_bytes(&bytes))
    }

    /// Bytes covered by the signature: everything before the comment length.
    fn signed_len(&self, len: u64) -> u64 {
        len - self.comment_size - 2
    }
}

/// SHA-256 of the first `len` bytes of `file`.
fn digest_prefix(file: &mut File, len: u64) -> Result<[u8; 32]> {
    file.seek(SeekFrom::Start(0))
        .map_err(|e| ImportError::io("Failed to rewind package", e))?;

    let mut reader = BufReader::new(file).take(len);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut hashed = 0u64;

    loop {
        let n = reader
            .read(&mut buffer)
            .map_err(|e| ImportError::io("Failed to hash package", e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        hashed += n as u64;
    }

    if hashed != len {
        return Err(ImportError::io(
            "Failed to hash package",
            io::Error::new(io::ErrorKind::UnexpectedEof, "package shrank while hashing"),
        ));
    }

    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zip::write::SimpleFileOptions;

    fn test_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn write_package(path: &Path) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file("META-INF/com/android/metadata", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"post-timestamp=1700000000000\n").unwrap();
        zip.start_file("payload.bin", SimpleFileOptions::default()).unwrap();
        zip.write_all(&[7u8; 10_000]).unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn test_signed_package_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        write_package(&path);

        let key = test_key(1);
        sign_package(&path, &key).unwrap();

        let verifier = SignatureVerifier::new(vec![test_key(9).verifying_key(), key.verifying_key()]);
        verifier.verify(&path).unwrap();

        // Still a readable archive after signing
        let content = crate::container::read_entry(&path, crate::container::METADATA_PATH).unwrap();
        assert!(content.starts_with("post-timestamp="));
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        write_package(&path);
        sign_package(&path, &test_key(1)).unwrap();

        let verifier = SignatureVerifier::new(vec![test_key(2).verifying_key()]);
        let err = verifier.verify(&path).unwrap_err();
        assert!(matches!(err, ImportError::VerificationFailed(_)));
    }

    #[test]
    fn test_tampered_package_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        write_package(&path);
        let key = test_key(1);
        sign_package(&path, &key).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[40] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let verifier = SignatureVerifier::new(vec![key.verifying_key()]);
        assert!(verifier.verify(&path).is_err());
    }

    #[test]
    fn test_unsigned_package_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        write_package(&path);

        let verifier = SignatureVerifier::new(vec![test_key(1).verifying_key()]);
        let err = verifier.verify(&path).unwrap_err();
        assert!(matches!(err, ImportError::VerificationFailed(_)));
    }

    #[test]
    fn test_no_keys_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        write_package(&path);
        sign_package(&path, &test_key(1)).unwrap();

        let verifier = SignatureVerifier::new(Vec::new());
        assert!(verifier.verify(&path).is_err());
    }

    #[test]
    fn test_signing_twice_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        write_package(&path);
        sign_package(&path, &test_key(1)).unwrap();

        assert!(sign_package(&path, &test_key(1)).is_err());
    }

    #[test]
    fn test_discard_deletes_rejected_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.zip");
        write_package(&path);

        let verifier = SignatureVerifier::new(vec![test_key(1).verifying_key()]);
        let err = verify_or_discard(&verifier, &path).unwrap_err();

        assert!(err.to_string().contains("file has been deleted"));
        assert!(!path.exists());
    }

    #[test]
    fn test_discard_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.zip");

        let verifier = SignatureVerifier::new(vec![test_key(1).verifying_key()]);
        let err = verify_or_discard(&verifier, &path).unwrap_err();

        assert!(err.to_string().contains("file already missing"));
    }

    #[test]
    fn test_public_key_hex_parsing() {
        let key = test_key(3).verifying_key();
        let parsed = parse_public_key(&hex::encode(key.to_bytes())).unwrap();
        assert_eq!(parsed, key);

        assert!(parse_public_key("abcd").is_err());
        assert!(SignatureVerifier::from_hex_keys(&["zz"]).is_err());
    }
}
