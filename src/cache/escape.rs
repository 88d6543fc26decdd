//! Percent-escaping of names in cache files.
//!
//! Fields are separated by whitespace, so every ASCII whitespace or control
//! byte in a name is written as `%XX`, as is `%` itself. Bytes that are not
//! part of valid UTF-8 are escaped too, so any name the filesystem returns
//! survives byte for byte. Other non-ASCII UTF-8 is written as is.

use std::ffi::{OsStr, OsString};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EscapeError {
    #[error("truncated or invalid percent escape")]
    InvalidPercent,

    #[error("escaped name is not valid UTF-8")]
    InvalidUtf8,
}

fn needs_escape(c: char) -> bool {
    c == '%' || c.is_ascii_whitespace() || c.is_ascii_control()
}

#[cfg(unix)]
fn name_bytes(name: &OsStr) -> std::borrow::Cow<'_, [u8]> {
    use std::os::unix::ffi::OsStrExt;
    std::borrow::Cow::Borrowed(name.as_bytes())
}

#[cfg(not(unix))]
fn name_bytes(name: &OsStr) -> std::borrow::Cow<'_, [u8]> {
    match name.to_string_lossy() {
        std::borrow::Cow::Borrowed(s) => std::borrow::Cow::Borrowed(s.as_bytes()),
        std::borrow::Cow::Owned(s) => std::borrow::Cow::Owned(s.into_bytes()),
    }
}

#[cfg(unix)]
fn name_from_bytes(bytes: Vec<u8>) -> Result<OsString, EscapeError> {
    use std::os::unix::ffi::OsStringExt;
    Ok(OsString::from_vec(bytes))
}

#[cfg(not(unix))]
fn name_from_bytes(bytes: Vec<u8>) -> Result<OsString, EscapeError> {
    String::from_utf8(bytes)
        .map(OsString::from)
        .map_err(|_| EscapeError::InvalidUtf8)
}

pub fn encode_name(name: &OsStr) -> String {
    let bytes = name_bytes(name);
    let mut out = String::with_capacity(bytes.len() + 8);
    for chunk in bytes.utf8_chunks() {
        for c in chunk.valid().chars() {
            if needs_escape(c) {
                out.push_str(&format!("%{:02X}", c as u32));
            } else {
                out.push(c);
            }
        }
        for byte in chunk.invalid() {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

pub fn decode_name(input: &str) -> Result<OsString, EscapeError> {
    if !input.contains('%') {
        return Ok(OsString::from(input));
    }

    let mut decoded = Vec::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'%' {
            if index + 2 >= bytes.len() {
                return Err(EscapeError::InvalidPercent);
            }
            match (hex_value(bytes[index + 1]), hex_value(bytes[index + 2])) {
                (Some(hi), Some(lo)) => {
                    decoded.push((hi << 4) | lo);
                    index += 3;
                    continue;
                }
                _ => return Err(EscapeError::InvalidPercent),
            }
        }
        decoded.push(bytes[index]);
        index += 1;
    }

    name_from_bytes(decoded)
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(10 + byte - b'a'),
        b'A'..=b'F' => Some(10 + byte - b'A'),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(name: &str) -> String {
        encode_name(OsStr::new(name))
    }

    #[test]
    fn separators_and_percent_are_escaped() {
        assert_eq!(encode("my file.txt"), "my%20file.txt");
        assert_eq!(encode("100%"), "100%25");
        assert_eq!(encode("tab\there\n"), "tab%09here%0A");
        assert_eq!(encode("plain"), "plain");
        assert_eq!(encode("Grüße"), "Grüße");
    }

    #[test]
    fn awkward_names_survive() {
        for name in ["a b  c", "%41", "x\u{7f}y", "/abs/path with space", "ünï cödé %"] {
            assert_eq!(decode_name(&encode(name)), Ok(OsString::from(name)));
        }
    }

    #[cfg(unix)]
    #[test]
    fn names_that_are_not_utf8_survive() {
        use std::os::unix::ffi::OsStrExt;

        let raw = OsStr::from_bytes(b"caf\xE9 \xFF\xFEx");
        let encoded = encode_name(raw);
        assert_eq!(encoded, "caf%E9%20%FF%FEx");
        assert_eq!(decode_name(&encoded).as_deref(), Ok(raw));
    }

    #[test]
    fn bad_escapes_are_rejected() {
        assert_eq!(decode_name("abc%4"), Err(EscapeError::InvalidPercent));
        assert_eq!(decode_name("abc%zz"), Err(EscapeError::InvalidPercent));
        assert_eq!(decode_name("lower%2fcase"), Ok(OsString::from("lower/case")));
    }
}
