//! HMAC-SHA256 upload signatures.
//!
//! An upload is signed over a newline-separated canonical string:
//!
//! ```text
//! hex(key) \n site \n group \n decimal(id) \n hex(image bytes)
//! ```
//!
//! keyed by the site's secret, and the MAC is sent as lowercase hex.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::constants::SIGNING_FIELD_SEPARATOR;
use crate::error::AuthError;
use crate::upload::ImageUpload;

type HmacSha256 = Hmac<Sha256>;

/// Build the canonical string an upload signature covers.
pub fn signing_string(key: &[u8], site: &str, group: &str, id: i64, image: &[u8]) -> String {
    let sep = SIGNING_FIELD_SEPARATOR;
    format!(
        "{}{sep}{}{sep}{}{sep}{}{sep}{}",
        hex::encode(key),
        site,
        group,
        id,
        hex::encode(image)
    )
}

/// Lowercase hex HMAC-SHA256 of `message` under `secret`.
pub fn sign(secret: &[u8], message: &str) -> Result<String, AuthError> {
    // HMAC accepts keys of any length; the error arm is unreachable in practice.
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| AuthError::AuthenticationFailed)?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Authenticate an upload against the stored credentials of `site_name`.
///
/// The signing string is rebuilt from the *stored* key and site name, not
/// from the claimed values. Both the key and the signature comparison run in
/// constant time and both are always evaluated.
pub fn verify_upload(
    site_name: &str,
    stored_key: &[u8],
    stored_secret: &[u8],
    upload: &ImageUpload,
) -> Result<(), AuthError> {
    if stored_key.is_empty() || stored_secret.is_empty() {
        return Err(AuthError::AuthenticationFailed);
    }

    let message = signing_string(stored_key, site_name, &upload.group, upload.id, &upload.image);
    let expected = sign(stored_secret, &message)?;

    let key_ok = stored_key.ct_eq(&upload.key);
    let sig_ok = expected.as_bytes().ct_eq(upload.signature.as_bytes());

    if bool::from(key_ok & sig_ok) {
        Ok(())
    } else {
        Err(AuthError::AuthenticationFailed)
    }
}
