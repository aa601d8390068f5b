//! HMAC-SHA256 signing of outgoing webhook bodies (spec §4.I step 4).

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// `hex(HMAC-SHA256(secret, body))`, the value sent in
/// `x-flyback-signature`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_secret_and_body_signs_deterministically() {
        let a = sign("shh", b"{\"seq\":1}");
        let b = sign("shh", b"{\"seq\":1}");
        assert_eq!(a, b);
    }

    #[test]
    fn different_bodies_sign_differently() {
        let a = sign("shh", b"{\"seq\":1}");
        let b = sign("shh", b"{\"seq\":2}");
        assert_ne!(a, b);
    }
}
