//! URL-safe base64 helpers
//!
//! Everything on the wire is encoded with the URL-safe alphabet and padding.
//! Decoding accepts both padded and unpadded input since some servers strip it.

use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, URL_SAFE};
use base64::engine::DecodePaddingMode;

use crate::error::ProtocolResult;

const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Encode bytes as padded URL-safe base64
pub fn encode(bytes: impl AsRef<[u8]>) -> String {
    URL_SAFE.encode(bytes)
}

/// Decode URL-safe base64, with or without padding
pub fn decode(encoded: &str) -> ProtocolResult<Vec<u8>> {
    Ok(LENIENT.decode(encoded)?)
}
