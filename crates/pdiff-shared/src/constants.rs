/// Public site key size in bytes
pub const KEY_SIZE: usize = 32;

/// Private site secret size in bytes
pub const SECRET_SIZE: usize = 32;

/// Bytes drawn from the OS RNG per issued credential pair
pub const CREDENTIAL_DRAW_SIZE: usize = KEY_SIZE + SECRET_SIZE;

/// Separator between fields of the upload signing string
pub const SIGNING_FIELD_SEPARATOR: char = '\n';

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Maximum accepted upload image size in bytes (20 MiB)
pub const MAX_IMAGE_SIZE: usize = 20 * 1024 * 1024;

/// Maximum stored PNG blob size in bytes; re-encoding can grow an upload
pub const MAX_BLOB_SIZE: usize = 8 * MAX_IMAGE_SIZE;
