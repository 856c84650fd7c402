use crate::error::Error;
use anyhow::Result;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const PREFIX: &str = "sha256=";

/// Signature header value for a request body: `sha256=<hex hmac>`
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Delivery(format!("invalid signing secret: {}", e)))?;
    mac.update(body);
    Ok(format!("{}{}", PREFIX, hex::encode(mac.finalize().into_bytes())))
}

/// Check a signature header produced by [`sign`]
pub fn verify(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(expected) = header.strip_prefix(PREFIX).and_then(|h| hex::decode(h).ok()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() -> Result<()> {
        // RFC 4231 test case 2
        let signature = sign("Jefe", b"what do ya want for nothing?")?;
        assert_eq!(
            signature,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
        Ok(())
    }

    #[test]
    fn verify_round_trip() -> Result<()> {
        let body = br#"{"event_type":"incident.created"}"#;
        let signature = sign("s3cret", body)?;
        assert!(verify("s3cret", body, &signature));
        assert!(!verify("other", body, &signature));
        assert!(!verify("s3cret", b"tampered", &signature));
        assert!(!verify("s3cret", body, "md5=abc"));
        Ok(())
    }
}
