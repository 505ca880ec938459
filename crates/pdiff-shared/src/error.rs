use thiserror::Error;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Entropy source failed: {0}")]
    Randomness(String),

    #[error("Entropy source produced identical key and secret")]
    Degenerate,
}

/// Authentication failure for an upload.
///
/// A key mismatch and a signature mismatch are deliberately indistinguishable.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authentication failed")]
    AuthenticationFailed,
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Malformed upload body: {0}")]
    Malformed(#[from] serde_json::Error),
}
