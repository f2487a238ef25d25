//! Node identity: Ed25519 keypair generation, on-disk persistence, and the
//! sign/verify primitives every wire message passes through.
//!
//! The public key is the node's permanent cluster identity; the human
//! readable `node_id` label is orthogonal metadata and never participates in
//! authentication. On the wire keys and signatures travel as lowercase hex
//! of the raw bytes. On disk the keypair persists as `keypair.json` holding
//! hex-encoded DER documents (SPKI for the public key, PKCS#8 for the
//! private key), written once and reloaded verbatim on every restart.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Filename for the persisted keypair under the node storage directory.
const KEYPAIR_FILENAME: &str = "keypair.json";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("keypair I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("keypair file is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("keypair encode error: {0}")]
    Encode(String),

    #[error("keypair decode error: {0}")]
    Decode(String),

    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Serialized form of `keypair.json`.
///
/// Both fields are lowercase hex over DER documents so the file stays
/// greppable and diffable without being mistaken for raw key material.
#[derive(Debug, Serialize, Deserialize)]
struct KeypairFile {
    /// Hex of the DER-encoded SPKI public key document.
    public_key: String,
    /// Hex of the DER-encoded PKCS#8 private key document.
    private_key: String,
}

/// The node's signing identity. Read-only after initialization; the signing
/// key is never exposed through any public method and `Debug` redacts it.
pub struct NodeIdentity {
    signing: SigningKey,
    public_hex: String,
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("public_key", &self.public_hex)
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

impl NodeIdentity {
    /// Generate a fresh identity from OS entropy. Persist it yourself via
    /// [`NodeIdentity::load_or_generate`] when it should survive restarts.
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let signing = SigningKey::generate(&mut rng);
        Self::from_signing_key(signing)
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let public_hex = hex::encode(signing.verifying_key().to_bytes());
        Self { signing, public_hex }
    }

    /// Load the keypair from `<dir>/keypair.json`, generating and writing it
    /// once if the file does not exist. A present-but-unreadable file is a
    /// hard error: corruption must be resolved manually, never silently
    /// regenerated into a new cluster identity.
    pub fn load_or_generate(dir: &Path) -> Result<Self, IdentityError> {
        let path = dir.join(KEYPAIR_FILENAME);
        if path.exists() {
            return Self::load(&path);
        }

        let identity = Self::generate();
        identity.persist(dir, &path)?;
        Ok(identity)
    }

    fn load(path: &Path) -> Result<Self, IdentityError> {
        let raw = fs::read_to_string(path).map_err(|source| IdentityError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: KeypairFile = serde_json::from_str(&raw)?;

        let der = hex::decode(file.private_key.trim())?;
        let signing = SigningKey::from_pkcs8_der(&der)
            .map_err(|e| IdentityError::Decode(format!("PKCS#8 private key: {}", e)))?;

        Ok(Self::from_signing_key(signing))
    }

    fn persist(&self, dir: &Path, path: &Path) -> Result<(), IdentityError> {
        fs::create_dir_all(dir).map_err(|source| IdentityError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let private_der = self
            .signing
            .to_pkcs8_der()
            .map_err(|e| IdentityError::Encode(format!("PKCS#8 private key: {}", e)))?;
        let public_der = self
            .signing
            .verifying_key()
            .to_public_key_der()
            .map_err(|e| IdentityError::Encode(format!("SPKI public key: {}", e)))?;

        let file = KeypairFile {
            public_key: hex::encode(public_der.as_bytes()),
            private_key: hex::encode(private_der.as_bytes()),
        };
        let body = serde_json::to_vec_pretty(&file)?;

        let io_err = |source| IdentityError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(io_err)?;
        f.write_all(&body).map_err(io_err)?;
        f.flush().map_err(io_err)?;
        f.sync_all().map_err(io_err)?;

        // Owner read/write only; the file holds private key material.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(io_err)?;
        }

        Ok(())
    }

    /// Lowercase hex of the raw 32-byte public key: the node's wire identity.
    pub fn public_key_hex(&self) -> &str {
        &self.public_hex
    }

    /// Sign a message, returning the 64-byte signature as lowercase hex.
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing.sign(message).to_bytes())
    }
}

/// Verify a hex signature over `message` against a hex-encoded raw public
/// key. Any malformed input verifies as `false`; callers treat all failure
/// modes identically (drop the message).
pub fn verify(message: &[u8], signature_hex: &str, public_key_hex: &str) -> bool {
    let Ok(pk_bytes) = hex::decode(public_key_hex) else {
        return false;
    };
    let Ok(pk_arr) = <[u8; 32]>::try_from(pk_bytes.as_slice()) else {
        return false;
    };
    let Ok(vk) = VerifyingKey::from_bytes(&pk_arr) else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(sig_arr) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let sig = Signature::from_bytes(&sig_arr);

    vk.verify(message, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let id = NodeIdentity::generate();
        let msg = b"hello swarm";
        let sig = id.sign(msg);

        assert!(verify(msg, &sig, id.public_key_hex()));
        assert!(!verify(b"hello swarm!", &sig, id.public_key_hex()));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let signer = NodeIdentity::generate();
        let other = NodeIdentity::generate();
        let sig = signer.sign(b"payload");

        assert!(!verify(b"payload", &sig, other.public_key_hex()));
    }

    #[test]
    fn test_verify_rejects_garbage_inputs() {
        let id = NodeIdentity::generate();
        assert!(!verify(b"m", "zz-not-hex", id.public_key_hex()));
        assert!(!verify(b"m", &id.sign(b"m"), "abcd"));
        assert!(!verify(b"m", "abcd", id.public_key_hex()));
    }

    #[test]
    fn test_load_or_generate_is_stable_across_restarts() {
        let dir = tempfile::tempdir().expect("tempdir");

        let first = NodeIdentity::load_or_generate(dir.path()).expect("generate");
        let second = NodeIdentity::load_or_generate(dir.path()).expect("reload");

        assert_eq!(first.public_key_hex(), second.public_key_hex());

        // Signatures from the reloaded key verify against the original key.
        let sig = second.sign(b"restart");
        assert!(verify(b"restart", &sig, first.public_key_hex()));
    }

    #[test]
    fn test_corrupt_keypair_file_is_a_hard_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("keypair.json"), b"{ not json").expect("write");

        assert!(NodeIdentity::load_or_generate(dir.path()).is_err());
    }
}
