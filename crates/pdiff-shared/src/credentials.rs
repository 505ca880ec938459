use rand::RngCore;

use crate::constants::{CREDENTIAL_DRAW_SIZE, KEY_SIZE, SECRET_SIZE};
use crate::error::CredentialError;

/// A freshly issued site credential pair.
///
/// The key travels with every upload; the secret only keys the HMAC.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub key: [u8; KEY_SIZE],
    pub secret: [u8; SECRET_SIZE],
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &hex::encode(self.key))
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Issue a key/secret pair from the OS CSPRNG.
pub fn issue_credentials() -> Result<Credentials, CredentialError> {
    issue_credentials_from(&mut rand::rngs::OsRng)
}

// One draw, split in half: first half is the key, second half the secret.
// A short or failed read is surfaced to the caller and never retried here.
pub fn issue_credentials_from<R: RngCore + ?Sized>(
    rng: &mut R,
) -> Result<Credentials, CredentialError> {
    let mut draw = [0u8; CREDENTIAL_DRAW_SIZE];
    rng.try_fill_bytes(&mut draw)
        .map_err(|e| CredentialError::Randomness(e.to_string()))?;

    let (key_half, secret_half) = draw.split_at(KEY_SIZE);
    if key_half == secret_half {
        return Err(CredentialError::Degenerate);
    }

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(key_half);
    let mut secret = [0u8; SECRET_SIZE];
    secret.copy_from_slice(secret_half);

    Ok(Credentials { key, secret })
}
