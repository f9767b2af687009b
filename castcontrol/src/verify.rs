//! Certificate trust decisions for the control channel.
//!
//! The TLS handshake accepts any server certificate; trust is decided here,
//! against the recorded peer certificate, before a registration completes.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use tracing::debug;
use x509_parser::prelude::*;

use crate::errors::ControlError;

/// Trust decision over a peer certificate and an optional pinned public key.
pub trait CertVerifier: Send + Sync {
    /// `pinned_key` is the base64 SPKI recorded at first pairing, if any.
    fn verify(&self, cert_der: &[u8], pinned_key: Option<&str>) -> Result<(), ControlError>;
}

/// A certificate is trusted when its self-signature checks out, or failing
/// that, when its public key matches the pinned key AND its validity window
/// covers the present.
pub fn verification_outcome(self_signed: bool, key_match: bool, valid_now: bool) -> bool {
    self_signed || (key_match && valid_now)
}

/// Production verifier backed by x509 parsing.
#[derive(Debug, Default)]
pub struct PinnedCertVerifier;

impl CertVerifier for PinnedCertVerifier {
    fn verify(&self, cert_der: &[u8], pinned_key: Option<&str>) -> Result<(), ControlError> {
        let (_, cert) = X509Certificate::from_der(cert_der)
            .map_err(|e| ControlError::Trust(format!("unparseable certificate: {}", e)))?;

        let self_signed = cert.verify_signature(None).is_ok();
        let key_match = match pinned_key {
            Some(pinned) => BASE64.encode(cert.public_key().raw) == pinned,
            None => false,
        };
        let valid_now = cert.validity().is_valid();

        debug!(
            "Certificate check: self_signed={} key_match={} valid_now={}",
            self_signed, key_match, valid_now
        );

        if verification_outcome(self_signed, key_match, valid_now) {
            Ok(())
        } else {
            Err(ControlError::Trust(
                "certificate is neither self-consistent nor pinned".to_string(),
            ))
        }
    }
}

/// Base64 SPKI of a certificate, as stored for pinning.
pub fn spki_b64(cert_der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    Some(BASE64.encode(cert.public_key().raw))
}
