//! # Cryptographic Primitives
//!
//! - **Secrets**: SHA-256 of the passphrase is the 32-byte signing secret
//! - **Frame signatures**: truncated SHA-256 over secret and signed frame bytes
//! - **Timestamps**: signing clock in 10µs units since 2015-01-01
//! - **TLS**: PEM identity loading for the secure WebSocket transport
//!
//! ## Signature Construction
//!
//! ```text
//! signature = SHA-256(secret || frame[..len - 6])[..6]
//! ```
//!
//! The hashed region covers the whole signed frame up to the signature itself:
//! header (from STX), payload, CRC, link id and the 6-byte timestamp.
//!
//! ## SECURITY
//!
//! Signatures are compared in constant time. Only 48 bits survive truncation,
//! so the replay window in `signing` is what keeps brute force impractical.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio_rustls::TlsAcceptor;

use crate::record::SECRET_KEY_LEN;

// ============================================================================
// Constants
// ============================================================================

/// Length of the truncated frame signature.
pub const SIGNATURE_LEN: usize = 6;

/// Seconds from the Unix epoch to 2015-01-01T00:00:00Z.
pub const SIGNING_EPOCH_OFFSET_SECS: u64 = 1_420_070_400;

/// Signing timestamp ticks per second (10µs units).
pub const SIGNING_TICKS_PER_SEC: u64 = 100_000;

/// Lazily-initialized crypto provider for rustls.
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

// ============================================================================
// Hashing
// ============================================================================

pub fn digest(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Derive the shared signing secret from a passphrase.
pub fn derive_secret(passphrase: &str) -> [u8; SECRET_KEY_LEN] {
    digest(passphrase.as_bytes())
}

// ============================================================================
// Frame Signatures
// ============================================================================

/// Compute the signature over `signed`, the frame bytes preceding the
/// signature field.
pub fn compute_signature(secret: &[u8; SECRET_KEY_LEN], signed: &[u8]) -> [u8; SIGNATURE_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(signed);
    let full = hasher.finalize();
    let mut out = [0u8; SIGNATURE_LEN];
    out.copy_from_slice(&full[..SIGNATURE_LEN]);
    out
}

/// Constant-time signature check.
pub fn verify_signature(secret: &[u8; SECRET_KEY_LEN], signed: &[u8], signature: &[u8]) -> bool {
    let expected = compute_signature(secret, signed);
    signature.len() == SIGNATURE_LEN && bool::from(expected.ct_eq(signature))
}

/// Current wall-clock time on the signing clock.
pub fn signing_timestamp_now() -> u64 {
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = since_unix.as_secs().saturating_sub(SIGNING_EPOCH_OFFSET_SECS);
    secs * SIGNING_TICKS_PER_SEC + u64::from(since_unix.subsec_micros() / 10)
}

// ============================================================================
// TLS
// ============================================================================

/// Build a TLS acceptor from PEM certificate chain and private key files.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = CertificateDer::pem_file_iter(cert_path)
        .with_context(|| format!("failed to read certificate {}", cert_path.display()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("invalid certificate PEM in {}", cert_path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", cert_path.display());
    }
    let key = PrivateKeyDer::from_pem_file(key_path)
        .with_context(|| format!("failed to read private key {}", key_path.display()))?;
    tls_acceptor(certs, key)
}

pub fn tls_acceptor(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<TlsAcceptor> {
    let config = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()
        .context("failed to select TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_secret_is_sha256() {
        assert_eq!(
            hex::encode(derive_secret("abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_signature_depends_on_secret_and_data() {
        let secret = derive_secret("one");
        let sig = compute_signature(&secret, b"frame bytes");
        assert!(verify_signature(&secret, b"frame bytes", &sig));
        assert!(!verify_signature(&secret, b"frame bytez", &sig));
        assert!(!verify_signature(&derive_secret("two"), b"frame bytes", &sig));
        assert!(!verify_signature(&secret, b"frame bytes", &sig[..5]));
    }

    #[test]
    fn test_signing_clock_is_after_epoch() {
        // 2024-01-01 is ~9 years past the signing epoch.
        assert!(signing_timestamp_now() > 9 * 365 * 86_400 * SIGNING_TICKS_PER_SEC);
    }
}
