//! Webhook signature verification

use hex::decode as hex_decode;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use tracing::debug;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// Header carrying the `sha256=<hex>` signature
pub const SIGNATURE_256_HEADER: &str = "X-Hub-Signature-256";
/// Legacy header carrying the `sha1=<hex>` signature
pub const SIGNATURE_1_HEADER: &str = "X-Hub-Signature";

/// Verifies a webhook signature of the form `<algo>=<hex>` against the raw
/// request body. The body must be the exact bytes received on the wire.
///
/// Returns `false` on a missing or empty secret, a missing signature, an
/// unknown algorithm tag, malformed hex, or a mismatch.
pub fn verify(payload: &[u8], provided_signature: Option<&str>, secret: Option<&str>) -> bool {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        debug!("No webhook secret configured, rejecting");
        return false;
    };
    let Some(provided) = provided_signature else {
        debug!("No signature header supplied");
        return false;
    };
    let Some((algorithm, hex_digest)) = provided.trim().split_once('=') else {
        return false;
    };
    let Ok(expected) = hex_decode(hex_digest) else {
        debug!("Signature is not valid hex");
        return false;
    };

    match algorithm {
        "sha256" => check::<HmacSha256>(secret, payload, &expected),
        "sha1" => check::<HmacSha1>(secret, payload, &expected),
        other => {
            debug!("Unsupported signature algorithm '{}'", other);
            false
        }
    }
}

/// Computes the header value a sender would attach for `payload`.
pub fn sign_sha256(secret: &str, payload: &[u8]) -> String {
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(payload);
            format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
        }
        Err(_) => String::new(),
    }
}

/// `sha1=` flavour of [`sign_sha256`].
pub fn sign_sha1(secret: &str, payload: &[u8]) -> String {
    match HmacSha1::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(payload);
            format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
        }
        Err(_) => String::new(),
    }
}

fn check<M: Mac + hmac::digest::KeyInit>(secret: &str, payload: &[u8], expected: &[u8]) -> bool {
    let Ok(mut mac) = <M as hmac::digest::KeyInit>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    // verify_slice compares in constant time
    mac.verify_slice(expected).is_ok()
}
