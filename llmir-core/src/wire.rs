//! Signed-artifact wire format — spec §3 "Signed artifact (on-wire)", §6.
//!
//! `magic(4B="LLMI") || format-version(1B) || payload-length(4B BE) ||
//!  payload(N bytes) || sig-length-marker(1B=0x40) || ed25519-sig(64B)`
//!
//! Full Ed25519 signature verification over the sealed payload, using
//! `ed25519-dalek`, satisfying the testable properties §8.1 requires.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;

pub const MAGIC: [u8; 4] = *b"LLMI";
pub const SIG_MARKER: u8 = 0x40;
pub const SIG_LEN: usize = 64;
const HEADER_LEN: usize = 4 + 1 + 4;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("artifact too short: {0} bytes")]
    TooShort(usize),
    #[error("bad magic bytes")]
    BadMagic,
    #[error("payload length mismatch: header says {expected}, buffer has {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("missing or malformed signature marker")]
    BadSignatureMarker,
    #[error("Ed25519 signature verification failed")]
    SignatureInvalid,
    #[error("IR major version mismatch: artifact={artifact_major} accepted={accepted_major}")]
    VersionMismatch { artifact_major: u8, accepted_major: u8 },
}

pub struct SignedArtifact {
    pub format_version: u8,
    pub payload: Vec<u8>,
    pub signature: [u8; SIG_LEN],
}

/// Seal a payload: build the header, sign `header||payload`, append the signature.
pub fn seal(payload: &[u8], format_version: u8, signing_key: &SigningKey) -> Vec<u8> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.extend_from_slice(&MAGIC);
    header.push(format_version);
    header.extend_from_slice(&(payload.len() as u32).to_be_bytes());

    let mut signed_region = Vec::with_capacity(header.len() + payload.len());
    signed_region.extend_from_slice(&header);
    signed_region.extend_from_slice(payload);

    let signature: Signature = signing_key.sign(&signed_region);

    let mut out = signed_region;
    out.push(SIG_MARKER);
    out.extend_from_slice(&signature.to_bytes());
    out
}

/// Parse and verify an artifact buffer. Deserialization must not proceed
/// without this succeeding (spec §4.E "Deserialisation requires prior
/// successful verification").
pub fn verify(buf: &[u8], verifying_key: &VerifyingKey) -> Result<SignedArtifact, WireError> {
    if buf.len() < HEADER_LEN + 1 + SIG_LEN {
        return Err(WireError::TooShort(buf.len()));
    }
    if buf[0..4] != MAGIC {
        return Err(WireError::BadMagic);
    }
    let format_version = buf[4];
    let payload_len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;

    let expected_total = HEADER_LEN + payload_len + 1 + SIG_LEN;
    if buf.len() != expected_total {
        return Err(WireError::LengthMismatch { expected: expected_total, actual: buf.len() });
    }

    let payload = &buf[HEADER_LEN..HEADER_LEN + payload_len];
    let marker_idx = HEADER_LEN + payload_len;
    if buf[marker_idx] != SIG_MARKER {
        return Err(WireError::BadSignatureMarker);
    }
    let sig_bytes = &buf[marker_idx + 1..marker_idx + 1 + SIG_LEN];
    let mut signature_arr = [0u8; SIG_LEN];
    signature_arr.copy_from_slice(sig_bytes);
    let signature = Signature::from_bytes(&signature_arr);

    let signed_region = &buf[0..marker_idx];
    verifying_key
        .verify(signed_region, &signature)
        .map_err(|_| WireError::SignatureInvalid)?;

    Ok(SignedArtifact { format_version, payload: payload.to_vec(), signature: signature_arr })
}

/// IR major-version compatibility gate (spec §4.E, §4.G "Entry").
/// Same major/different minor -> Ok(true) meaning "execute with warning".
/// Different major -> refusal.
pub fn check_ir_version(artifact_format_version: u8, accepted_major: u8) -> Result<bool, WireError> {
    if artifact_format_version == accepted_major {
        Ok(false)
    } else {
        Err(WireError::VersionMismatch { artifact_major: artifact_format_version, accepted_major })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn keypair() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    #[test]
    fn round_trip_seal_verify() {
        let key = keypair();
        let payload = b"hello artifact".to_vec();
        let sealed = seal(&payload, 1, &key);
        let parsed = verify(&sealed, &key.verifying_key()).unwrap();
        assert_eq!(parsed.payload, payload);
        assert_eq!(parsed.format_version, 1);
    }

    #[test]
    fn tamper_in_payload_fails_verification() {
        let key = keypair();
        let payload = b"hello artifact".to_vec();
        let mut sealed = seal(&payload, 1, &key);
        let payload_region_start = HEADER_LEN;
        sealed[payload_region_start] ^= 0xFF;
        let result = verify(&sealed, &key.verifying_key());
        assert!(matches!(result, Err(WireError::SignatureInvalid)));
        // spec §8 example E6: the error message is exactly this string.
        assert_eq!(result.unwrap_err().to_string(), "Ed25519 signature verification failed");
    }

    #[test]
    fn tamper_in_signature_fails_verification() {
        let key = keypair();
        let payload = b"hello artifact".to_vec();
        let mut sealed = seal(&payload, 1, &key);
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        let result = verify(&sealed, &key.verifying_key());
        assert!(matches!(result, Err(WireError::SignatureInvalid)));
    }

    #[test]
    fn deterministic_seal_same_bytes() {
        let key = keypair();
        let payload = b"deterministic payload".to_vec();
        let a = seal(&payload, 1, &key);
        let b = seal(&payload, 1, &key);
        assert_eq!(a, b, "Ed25519 signing is deterministic for a fixed key+message");
    }

    #[test]
    fn version_gate() {
        assert_eq!(check_ir_version(1, 1).unwrap(), false);
        assert!(check_ir_version(2, 1).is_err());
    }
}
