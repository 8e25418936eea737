//! Server signing key: Ed25519 key persistence, signing and verification.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;

/// Key the server signs verification reports with.
pub struct ServerKey {
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl ServerKey {
    /// Generate a fresh keypair using the OS RNG.
    pub fn generate() -> Self {
        Self::from_signing(SigningKey::generate(&mut OsRng))
    }

    pub fn from_signing(signing: SigningKey) -> Self {
        let verifying = signing.verifying_key();
        Self { signing, verifying }
    }

    /// Load the key seed at `path`, creating and saving a new one if absent.
    pub fn load_or_create(path: &Path) -> io::Result<Self> {
        if let Some(signing) = load_key(path)? {
            tracing::info!(path = %path.display(), "loaded server key");
            return Ok(Self::from_signing(signing));
        }
        tracing::info!(path = %path.display(), "no server key on disk; generating a new one");
        let key = Self::generate();
        save_key(path, &key.signing)?;
        Ok(key)
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.verifying.to_bytes())
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing.sign(msg)
    }
}

/// Verify a hex signature over `msg`.
pub fn verify_hex(verifying: &VerifyingKey, msg: &[u8], signature_hex: &str) -> bool {
    let Ok(bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(&bytes) else {
        return false;
    };
    verifying.verify(msg, &sig).is_ok()
}

/// Parse a hex-encoded public key as served by `GET /pubkey`.
pub fn parse_public_key(public_hex: &str) -> Option<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(public_hex).ok()?.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

/// Save (overwrite) the private key seed (32 bytes) to disk.
fn save_key(path: &Path, signing: &SigningKey) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = File::create(path)?;
    f.write_all(&signing.to_bytes())?;
    f.sync_all()
}

/// Load the private key seed if present.
///
/// A file of the wrong length is an error: regenerating would silently
/// invalidate every attestation already handed out.
fn load_key(path: &Path) -> io::Result<Option<SigningKey>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut buf = Vec::new();
    File::open(path)?.read_to_end(&mut buf)?;
    let seed: [u8; 32] = buf.as_slice().try_into().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("key file {} is {} bytes, expected 32", path.display(), buf.len()),
        )
    })?;
    Ok(Some(SigningKey::from_bytes(&seed)))
}
