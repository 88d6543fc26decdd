//! Parsing of cache file lines.

use std::ffi::OsString;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use thiserror::Error;

use super::escape::{decode_name, EscapeError};
use super::{is_gzip_path, CacheError, CACHE_FORMAT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Dir,
    File,
    Symlink,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordFlags {
    pub read_error: bool,
    pub excluded: bool,
    pub aborted: bool,
    pub mount_point: bool,
    /// A file record that stands for a device, FIFO or socket
    pub special: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub kind: RecordKind,
    /// Decoded name; the absolute path for the toplevel directory
    pub name: OsString,
    pub size: u64,
    pub mtime: i64,
    pub allocated: Option<u64>,
    pub links: u64,
    pub uid: u32,
    pub gid: u32,
    pub flags: RecordFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Entry(EntryRecord),
    /// `<`: the innermost open directory is complete
    Close,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("unknown record type '{0}'")]
    UnknownType(String),

    #[error("missing {0} field")]
    MissingField(&'static str),

    #[error("invalid {field} '{value}'")]
    BadNumber { field: &'static str, value: String },

    #[error("invalid name: {0}")]
    BadName(#[from] EscapeError),
}

/// Whether `line` is a cache header this version can read (major version 1).
pub fn is_header(line: &str) -> bool {
    let Some(inner) = line.trim().strip_prefix('[').and_then(|l| l.strip_suffix(']')) else {
        return false;
    };
    let mut words = inner.split_ascii_whitespace();
    let (Some(format), Some(version)) = (words.next(), words.next()) else {
        return false;
    };
    format == CACHE_FORMAT
        && version.split('.').next() == Some("1")
        && words.collect::<Vec<_>>() == ["cache", "file"]
}

/// Parse one line. Blank lines and `#` comments yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Record>, RecordError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut fields = line.split_ascii_whitespace();
    let kind = match fields.next() {
        Some("<") => return Ok(Some(Record::Close)),
        Some("D") => RecordKind::Dir,
        Some("F") => RecordKind::File,
        Some("L") => RecordKind::Symlink,
        Some(other) => return Err(RecordError::UnknownType(other.to_string())),
        None => return Ok(None),
    };

    let name = decode_name(fields.next().ok_or(RecordError::MissingField("name"))?)?;
    let size = parse_number("size", fields.next().ok_or(RecordError::MissingField("size"))?)?;
    let mtime_field = fields.next().ok_or(RecordError::MissingField("mtime"))?;
    let mtime = parse_mtime(mtime_field).ok_or_else(|| RecordError::BadNumber {
        field: "mtime",
        value: mtime_field.to_string(),
    })?;

    let mut record = EntryRecord {
        kind,
        name,
        size,
        mtime,
        allocated: None,
        links: 1,
        uid: 0,
        gid: 0,
        flags: RecordFlags::default(),
    };

    for token in fields {
        match token.split_once(':') {
            Some(("alloc", value)) => record.allocated = Some(parse_number("alloc", value)?),
            Some(("links", value)) => record.links = parse_number("links", value)?,
            Some(("uid", value)) => record.uid = parse_id("uid", value)?,
            Some(("gid", value)) => record.gid = parse_id("gid", value)?,
            Some(_) => tracing::debug!("Ignoring unknown cache token '{}'", token),
            None => match token {
                "err" => record.flags.read_error = true,
                "excl" => record.flags.excluded = true,
                "aborted" => record.flags.aborted = true,
                "mount" => record.flags.mount_point = true,
                "special" => record.flags.special = true,
                _ => tracing::debug!("Ignoring unknown cache flag '{}'", token),
            },
        }
    }
    Ok(Some(Record::Entry(record)))
}

fn parse_number(field: &'static str, value: &str) -> Result<u64, RecordError> {
    value.parse().map_err(|_| RecordError::BadNumber {
        field,
        value: value.to_string(),
    })
}

fn parse_id(field: &'static str, value: &str) -> Result<u32, RecordError> {
    value.parse().map_err(|_| RecordError::BadNumber {
        field,
        value: value.to_string(),
    })
}

/// Modification times are hex seconds since the epoch, e.g. `0x6512a3c1`.
pub fn format_mtime(mtime: i64) -> String {
    if mtime < 0 {
        format!("-0x{:x}", mtime.unsigned_abs())
    } else {
        format!("0x{:x}", mtime)
    }
}

pub fn parse_mtime(value: &str) -> Option<i64> {
    let (negative, digits) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value),
    };
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);
    let magnitude = i64::try_from(u64::from_str_radix(digits, 16).ok()?).ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

/// An opened cache file positioned just after its header line.
pub struct CacheInput {
    pub path: PathBuf,
    pub lines: Box<dyn BufRead + Send>,
    /// Number of the last line consumed
    pub line_no: usize,
}

/// Open a cache file, decompressing `.gz` files, and check its header.
pub fn open(path: &Path) -> Result<CacheInput, CacheError> {
    let file = File::open(path).map_err(|e| CacheError::io(path, e))?;
    let mut lines: Box<dyn BufRead + Send> = if is_gzip_path(path) {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let mut line_no = 0;
    let mut line = String::new();
    loop {
        line.clear();
        let read = lines.read_line(&mut line).map_err(|e| CacheError::io(path, e))?;
        line_no += 1;
        if read == 0 || !line.trim().is_empty() {
            break;
        }
    }
    if !is_header(&line) {
        return Err(CacheError::BadHeader {
            path: path.to_path_buf(),
            found: line.trim().to_string(),
        });
    }

    Ok(CacheInput {
        path: path.to_path_buf(),
        lines,
        line_no,
    })
}
