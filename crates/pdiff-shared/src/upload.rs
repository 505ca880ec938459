use serde::{Deserialize, Serialize};

use crate::error::{AuthError, UploadError};
use crate::signature::{sign, signing_string};

/// JSON body of an image upload.
///
/// `key` and `image` are standard base64 on the wire, `signature` is the
/// lowercase hex HMAC described in [`crate::signature`]. `id` orders images
/// inside a group (build number or timestamp), independent of submission
/// time. Missing fields decode to empty values and fail authentication.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ImageUpload {
    #[serde(with = "crate::encoding::base64_bytes")]
    pub key: Vec<u8>,
    pub site: String,
    pub group: String,
    pub id: i64,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub image: Vec<u8>,
    pub signature: String,
}

impl ImageUpload {
    /// Build and sign an upload the way a client does.
    pub fn signed(
        key: &[u8],
        secret: &[u8],
        site: &str,
        group: &str,
        id: i64,
        image: Vec<u8>,
    ) -> Result<Self, AuthError> {
        let signature = sign(secret, &signing_string(key, site, group, id, &image))?;
        Ok(Self {
            key: key.to_vec(),
            site: site.to_string(),
            group: group.to_string(),
            id,
            image,
            signature,
        })
    }

    pub fn from_json(body: &[u8]) -> Result<Self, UploadError> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, UploadError> {
        Ok(serde_json::to_vec(self)?)
    }
}
