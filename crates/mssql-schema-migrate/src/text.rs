//! Decoding of generated definition files.
//!
//! Export tools write whatever encoding the host defaults to, so readers try
//! a fixed list of decoders in order. A decoder "succeeds" only when it yields
//! plausible text: NUL and C1 control characters mark a wrong guess, which is
//! what lets a UTF-16 file fall through the single-byte decoders.

use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, WINDOWS_1252};
use serde::Serialize;
use std::borrow::Cow;
use std::path::Path;

use crate::error::{MigrateError, Result};

/// Encoding a file was successfully decoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TextEncoding {
    Utf8,
    Latin1,
    Windows1252,
    Utf16Le,
    Utf16Be,
}

/// Decoders tried when scanning for cross-database references.
pub const ROUTER_ENCODINGS: &[TextEncoding] = &[
    TextEncoding::Utf8,
    TextEncoding::Latin1,
    TextEncoding::Windows1252,
    TextEncoding::Utf16Le,
];

/// Decoders tried when rewriting definitions.
pub const REWRITER_ENCODINGS: &[TextEncoding] = &[TextEncoding::Utf8, TextEncoding::Windows1252];

/// Decode `bytes` with the first encoding in `order` that yields plausible text.
///
/// `Utf16Le` in the list stands for "UTF-16": a byte-order mark picks the
/// endianness, little-endian otherwise.
pub fn decode(bytes: &[u8], order: &[TextEncoding]) -> Option<(String, TextEncoding)> {
    order.iter().find_map(|&encoding| {
        let decoded = match encoding {
            TextEncoding::Utf8 => decode_utf8(bytes),
            TextEncoding::Latin1 => decode_latin1(bytes),
            TextEncoding::Windows1252 => decode_strict(WINDOWS_1252, bytes),
            TextEncoding::Utf16Le | TextEncoding::Utf16Be => return decode_utf16(bytes),
        }?;
        plausible(&decoded).then(|| (decoded, encoding))
    })
}

/// Read and decode a file, failing with `FileEncodingUnreadable` when no decoder fits.
pub fn read_file(path: &Path, order: &[TextEncoding]) -> Result<(String, TextEncoding)> {
    let bytes = std::fs::read(path)?;
    decode(&bytes, order).ok_or_else(|| MigrateError::FileEncodingUnreadable(path.to_path_buf()))
}

fn decode_utf8(bytes: &[u8]) -> Option<String> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    std::str::from_utf8(bytes).ok().map(str::to_owned)
}

fn decode_latin1(bytes: &[u8]) -> Option<String> {
    Some(bytes.iter().map(|&b| char::from(b)).collect())
}

fn decode_strict(encoding: &'static Encoding, bytes: &[u8]) -> Option<String> {
    encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(Cow::into_owned)
}

fn decode_utf16(bytes: &[u8]) -> Option<(String, TextEncoding)> {
    let (encoding, tag, body) = match bytes {
        [0xFE, 0xFF, rest @ ..] => (UTF_16BE, TextEncoding::Utf16Be, rest),
        [0xFF, 0xFE, rest @ ..] => (UTF_16LE, TextEncoding::Utf16Le, rest),
        _ => (UTF_16LE, TextEncoding::Utf16Le, bytes),
    };
    let text = decode_strict(encoding, body)?;
    plausible(&text).then_some((text, tag))
}

fn plausible(text: &str) -> bool {
    !text
        .chars()
        .any(|c| c == '\0' || ('\u{80}'..='\u{9f}').contains(&c))
}
