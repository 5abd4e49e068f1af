// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Song metadata records and charset decoding

use crate::identifier::Identifier;
use chrono::{DateTime, Utc};
use encoding_rs::{Encoding, SHIFT_JIS};
use serde::{Deserialize, Serialize};

/// Charset assumed when the encoder does not send one
pub const DEFAULT_CHARSET: &str = "latin1";

/// One metadata update as received from an encoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub mount: String,
    pub value: String,
    pub username: String,
    pub identifier: Identifier,
    pub address: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unknown charset: {0}")]
    UnknownCharset(String),

    #[error("Input is not valid {charset}")]
    Malformed { charset: &'static str },
}

/// Decode raw song bytes into UTF-8
///
/// `latin1` is treated as "unknown": valid UTF-8 is kept, then Shift_JIS is
/// tried, and ISO-8859-1 is the fallback. Any other label is looked up in the
/// WHATWG registry and must decode without replacement characters.
pub fn to_utf8(charset: &str, raw: &[u8]) -> Result<String, DecodeError> {
    if charset.eq_ignore_ascii_case(DEFAULT_CHARSET) {
        return Ok(decode_unknown(raw));
    }

    let encoding = Encoding::for_label(charset.trim().as_bytes())
        .ok_or_else(|| DecodeError::UnknownCharset(charset.to_string()))?;
    encoding
        .decode_without_bom_handling_and_without_replacement(raw)
        .map(|text| text.into_owned())
        .ok_or(DecodeError::Malformed {
            charset: encoding.name(),
        })
}

fn decode_unknown(raw: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(raw) {
        return text.to_string();
    }

    if let Some(text) = SHIFT_JIS.decode_without_bom_handling_and_without_replacement(raw) {
        if !text.contains(char::REPLACEMENT_CHARACTER) {
            return text.into_owned();
        }
    }

    // ISO-8859-1 maps every byte to the code point of the same value
    raw.iter().map(|&b| char::from(b)).collect()
}
