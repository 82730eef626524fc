//! Identifier hash shared by every participant
//!
//! Each input is framed as its UTF-8 byte length in decimal followed by the
//! bytes themselves, then the SHA-256 digest is encoded as padded URL-safe
//! base64. Any implementation must reproduce this byte for byte, since
//! message ids and consensus instance ids are derived from it.

use sha2::{Digest, Sha256};

use crate::base64url;

/// Hash a sequence of strings into a base64url identifier
pub fn hash<I>(parts: I) -> String
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref().as_bytes();
        hasher.update(bytes.len().to_string().as_bytes());
        hasher.update(bytes);
    }
    base64url::encode(hasher.finalize())
}
