//! # pdiff-shared
//!
//! Types and primitives shared between the pdiff store, the server and
//! upload clients: site credential issuance, the HMAC upload signature and
//! the JSON wire format of an image upload.

pub mod constants;
pub mod credentials;
pub mod encoding;
pub mod error;
pub mod signature;
pub mod upload;

pub use credentials::{issue_credentials, Credentials};
pub use error::{AuthError, CredentialError, UploadError};
pub use signature::{sign, signing_string, verify_upload};
pub use upload::ImageUpload;
