use std::path::Path;

use base64::Engine;
use md5::Md5;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use russh::keys::{
    PrivateKey, PublicKey, decode_secret_key,
    ssh_key::{LineEnding, private::Ed25519Keypair},
};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::TunnelError;

// Generate an Ed25519 host key. A seed makes the key deterministic, so a
// server restarted with the same seed keeps its fingerprint.
pub(crate) fn generate_key(seed: Option<&str>) -> PrivateKey {
    let secret: [u8; 32] = match seed {
        Some(seed) => {
            let mut rng = ChaCha20Rng::from_seed(Sha256::digest(seed.as_bytes()).into());
            rng.random()
        }
        None => ChaCha20Rng::from_os_rng().random(),
    };
    PrivateKey::from(Ed25519Keypair::from_seed(&secret))
}

// Read the host key from a PEM file, creating one when it doesn't exist.
pub(crate) async fn load_or_create_key(path: &Path) -> color_eyre::Result<PrivateKey> {
    match tokio::fs::read_to_string(path).await {
        Ok(pem) => Ok(decode_secret_key(&pem, None)?),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            let key = generate_key(None);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, key.to_openssh(LineEnding::LF)?.as_bytes()).await?;
            info!(path = %path.display(), "Created a new server key.");
            Ok(key)
        }
        Err(error) => Err(error.into()),
    }
}

// SHA-256 digest of the key's SSH wire encoding, base64-encoded with
// padding. 44 characters including the trailing `=`.
pub(crate) fn fingerprint(key: &PublicKey) -> String {
    let encoded = key.to_bytes().expect("public key encoding cannot fail");
    base64::engine::general_purpose::STANDARD.encode(Sha256::digest(&encoded))
}

// Colon-separated hex MD5 digest, the format of legacy fingerprints.
fn legacy_fingerprint(key: &PublicKey) -> String {
    let encoded = key.to_bytes().expect("public key encoding cannot fail");
    let digest = Md5::digest(&encoded);
    digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

// Verify the server's public key against the configured fingerprint. An
// empty expectation accepts any key; a base64 string requires exact
// equality; anything else is matched as a case-sensitive prefix of the
// legacy MD5 fingerprint.
pub(crate) fn verify_fingerprint(expected: &str, key: &PublicKey) -> Result<(), TunnelError> {
    if expected.is_empty() {
        return Ok(());
    }
    let got = fingerprint(key);
    if base64::engine::general_purpose::STANDARD
        .decode(expected)
        .is_err()
    {
        info!(
            deprecated = %expected, current = %got,
            "Specified a deprecated MD5 fingerprint, please update to the new SHA256 fingerprint."
        );
        let legacy = legacy_fingerprint(key);
        if legacy.starts_with(expected) {
            return Ok(());
        }
        return Err(TunnelError::FingerprintMismatch(legacy));
    }
    if got != expected {
        return Err(TunnelError::FingerprintMismatch(got));
    }
    Ok(())
}

#[cfg(test)]
mod keys_tests {
    use super::{fingerprint, generate_key, legacy_fingerprint, verify_fingerprint};

    #[test]
    fn seeded_keys_are_deterministic() {
        let one = generate_key(Some("some seed"));
        let two = generate_key(Some("some seed"));
        let other = generate_key(Some("another seed"));
        assert_eq!(
            fingerprint(one.public_key()),
            fingerprint(two.public_key())
        );
        assert_ne!(
            fingerprint(one.public_key()),
            fingerprint(other.public_key())
        );
    }

    #[test]
    fn fingerprint_is_padded_base64() {
        let key = generate_key(Some("fingerprint format"));
        let print = fingerprint(key.public_key());
        assert_eq!(print.len(), 44);
        assert!(print.ends_with('='));
    }

    #[test]
    fn empty_expectation_accepts_any_key() {
        let key = generate_key(None);
        assert!(verify_fingerprint("", key.public_key()).is_ok());
    }

    #[test]
    fn exact_match_required_for_sha256() {
        let key = generate_key(Some("exact"));
        let print = fingerprint(key.public_key());
        assert!(verify_fingerprint(&print, key.public_key()).is_ok());
        let other = generate_key(Some("other"));
        assert!(verify_fingerprint(&print, other.public_key()).is_err());
    }

    #[test]
    fn legacy_md5_prefix_matches() {
        let key = generate_key(Some("legacy"));
        let legacy = legacy_fingerprint(key.public_key());
        assert!(verify_fingerprint(&legacy[..8], key.public_key()).is_ok());
        assert!(verify_fingerprint("ff:ff", key.public_key()).is_err());
    }
}
