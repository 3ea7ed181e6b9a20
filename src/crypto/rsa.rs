// RSA signing for cell ownership and entry payloads
//
// PKCS#1 v1.5 over SHA-256. Public keys travel as PKCS#1 PEM text (they double
// as the `owner` field of mined cells); signatures travel base64-encoded.
use std::path::Path;

use data_encoding::BASE64;
use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding,
};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

pub const RSA_BITS: usize = 2048;

const PRIVATE_KEY_FILE: &str = "private.pem";
const PUBLIC_KEY_FILE: &str = "public.pem";

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key generation failed: {0}")]
    Generate(#[from] rsa::Error),
    #[error("PEM encoding failed: {0}")]
    Pem(#[from] rsa::pkcs1::Error),
    #[error("key file I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// A 2048-bit keypair with its public half pre-rendered as PEM.
#[derive(Clone)]
pub struct Keypair {
    pub private: RsaPrivateKey,
    pub public_pem: String,
}

pub fn generate_keys() -> Result<Keypair, KeyError> {
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, RSA_BITS)?;
    let public_pem = RsaPublicKey::from(&private).to_pkcs1_pem(LineEnding::LF)?;
    Ok(Keypair {
        private,
        public_pem,
    })
}

/// Load the node keypair from `private.pem`/`public.pem`, generating and
/// persisting a fresh pair on first start.
pub fn load_or_generate(data_dir: &Path) -> Result<Keypair, KeyError> {
    let private_path = data_dir.join(PRIVATE_KEY_FILE);
    let public_path = data_dir.join(PUBLIC_KEY_FILE);

    if private_path.exists() {
        let private = RsaPrivateKey::read_pkcs1_pem_file(&private_path)?;
        let public_pem = RsaPublicKey::from(&private).to_pkcs1_pem(LineEnding::LF)?;
        return Ok(Keypair {
            private,
            public_pem,
        });
    }

    let pair = generate_keys()?;
    pair.private
        .write_pkcs1_pem_file(&private_path, LineEnding::LF)?;
    std::fs::write(&public_path, &pair.public_pem)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = std::fs::metadata(&private_path) {
            let mut perms = meta.permissions();
            perms.set_mode(0o600);
            let _ = std::fs::set_permissions(&private_path, perms);
        }
    }

    Ok(pair)
}

/// Sign `data`, returning the base64 signature text used on the wire.
pub fn sign_b64(private: &RsaPrivateKey, data: &[u8]) -> String {
    let key = SigningKey::<Sha256>::new(private.clone());
    BASE64.encode(&key.sign(data).to_vec())
}

/// Verify a raw signature against a PEM public key. Total: malformed keys or
/// signatures verify as false rather than erroring.
pub fn verify(public_pem: &str, data: &[u8], signature: &[u8]) -> bool {
    let Ok(public) = RsaPublicKey::from_pkcs1_pem(public_pem) else {
        return false;
    };
    let Ok(sig) = Signature::try_from(signature) else {
        return false;
    };
    VerifyingKey::<Sha256>::new(public).verify(data, &sig).is_ok()
}

/// Verify a base64 wire signature.
pub fn verify_b64(public_pem: &str, data: &[u8], signature_b64: &str) -> bool {
    match BASE64.decode(signature_b64.as_bytes()) {
        Ok(raw) => verify(public_pem, data, &raw),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let pair = generate_keys().unwrap();
        let sig = sign_b64(&pair.private, b"hello there");
        assert!(verify_b64(&pair.public_pem, b"hello there", &sig));
        assert!(!verify_b64(&pair.public_pem, b"general kenobi", &sig));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let pair = generate_keys().unwrap();
        let other = generate_keys().unwrap();
        let sig = sign_b64(&pair.private, b"payload");
        assert!(!verify_b64(&other.public_pem, b"payload", &sig));
    }

    #[test]
    fn test_verify_is_total_on_garbage() {
        assert!(!verify("not a pem", b"data", b"not a signature"));
        assert!(!verify_b64("not a pem", b"data", "!!!not base64!!!"));
    }

    #[test]
    fn test_keypair_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_generate(dir.path()).unwrap();
        let second = load_or_generate(dir.path()).unwrap();
        assert_eq!(first.public_pem, second.public_pem);

        let sig = sign_b64(&first.private, b"stable identity");
        assert!(verify_b64(&second.public_pem, b"stable identity", &sig));
    }
}
