use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{RngCore, rngs::OsRng};

/// Number of random bytes behind each session token.
pub const SESSION_TOKEN_BYTES: usize = 32;

/// Generates an unguessable, URL-safe token from the OS random source.
///
/// `byte_len` random bytes are drawn and encoded as base64url without
/// padding, so 32 bytes yield a 43 character token.
///
/// # Examples
///
/// ```ignore
/// let token = generate_random_token(32);
/// assert_eq!(token.len(), 43);
/// ```
pub fn generate_random_token(byte_len: usize) -> String {
    let mut bytes = vec![0u8; byte_len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
