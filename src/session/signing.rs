//! HMAC-SHA256 signatures for session cookie values.
//!
//! A signed value is `<value>.<mac>` where `mac` is the URL-safe, unpadded
//! base64 HMAC of `<cookie name>=<value>`. Binding the cookie name stops a
//! value signed for one cookie from being replayed in another.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &[u8], name: &str, value: &str) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(name.as_bytes());
    mac.update(b"=");
    mac.update(value.as_bytes());
    mac
}

pub(crate) fn sign(secret: &[u8], name: &str, value: &str) -> String {
    let tag = mac(secret, name, value).finalize().into_bytes();
    format!("{value}.{}", URL_SAFE_NO_PAD.encode(tag))
}

/// The unsigned value if `signed` carries a valid signature. Comparison is
/// constant time.
pub(crate) fn verify(secret: &[u8], name: &str, signed: &str) -> Option<String> {
    let (value, tag) = signed.rsplit_once('.')?;
    let tag = URL_SAFE_NO_PAD.decode(tag).ok()?;
    mac(secret, name, value).verify_slice(&tag).ok()?;
    Some(value.to_owned())
}
