//! `image.cfg`: the text form of the main header and the file records.
//!
//! ```text
//! [IMAGE_CFG]
//! magic="IMAGEWTY";
//! header_version=0x00000100;
//! number_of_files=0x00000001;
//!
//! [FILELIST]
//! file_1 {
//! filename="boot.fex";
//! offset=0x00000800;
//! }
//! ```

use std::fmt::Write as _;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{IoContext, Result, WtyError};
use crate::header::{FileEntry, FixedStr, ImageHeader};

pub const MANIFEST_NAME: &str = "image.cfg";

/// How to treat a document whose file blocks do not match its declared count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ManifestStrictness {
    /// Missing blocks become zeroed entries; a warning is recorded.
    #[default]
    Lenient,
    /// Missing or unterminated blocks are a format error.
    Strict,
}

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub header: ImageHeader,
    /// Exactly `header.num_files` entries, in declaration order.
    pub entries: Vec<FileEntry>,
    /// Tolerated irregularities found while parsing.
    pub warnings: Vec<String>,
}

enum Field<T> {
    U32 { name: &'static str, get: fn(&T) -> u32, set: fn(&mut T, u32) },
    Str { name: &'static str, get: fn(&T) -> String, set: fn(&mut T, &str) },
}

impl<T> Field<T> {
    fn name(&self) -> &'static str {
        match self {
            Field::U32 { name, .. } | Field::Str { name, .. } => *name,
        }
    }

    fn render(&self, item: &T, out: &mut String) {
        // Writing to a String cannot fail.
        let _ = match self {
            Field::U32 { name, get, .. } => writeln!(out, "{name}=0x{:08X};", get(item)),
            Field::Str { name, get, .. } => writeln!(out, "{name}=\"{}\";", get(item)),
        };
    }

    fn apply(&self, item: &mut T, value: &str, line_no: usize) -> Result<()> {
        match self {
            Field::U32 { name, set, .. } => {
                let v = parse_u32(value).ok_or_else(|| {
                    WtyError::Format(format!(
                        "line {line_no}: `{name}` expects a number, got {value:?}"
                    ))
                })?;
                set(item, v);
            }
            Field::Str { set, .. } => set(item, value),
        }
        Ok(())
    }
}

macro_rules! u32_field {
    ($name:literal, $f:ident) => {
        Field::U32 { name: $name, get: |s| s.$f, set: |s, v| s.$f = v }
    };
}

macro_rules! str_field {
    ($name:literal, $f:ident) => {
        Field::Str {
            name: $name,
            get: |s| s.$f.to_string_lossy(),
            set: |s, v| s.$f = FixedStr::from_str_truncate(v),
        }
    };
}

/// Global keys in render order. `number_of_files` is handled separately.
static HEADER_FIELDS: &[Field<ImageHeader>] = &[
    str_field!("magic", magic),
    u32_field!("header_version", header_version),
    u32_field!("header_size", header_size),
    u32_field!("base_ram", base_ram),
    u32_field!("format_version", format_version),
    u32_field!("total_image_size", total_image_size),
    u32_field!("header_size_including_alignment", header_size_aligned),
    u32_field!("file_header_length", file_header_length),
    u32_field!("usb_product_id", usb_product_id),
    u32_field!("usb_vendor_id", usb_vendor_id),
    u32_field!("hardware_id", hardware_id),
    u32_field!("firmware_id", firmware_id),
    u32_field!("unknown_field_1", unknown1),
    u32_field!("unknown_field_2", unknown2),
    u32_field!("unknown_field_3", unknown3),
];

/// Per-entry keys in render order.
static ENTRY_FIELDS: &[Field<FileEntry>] = &[
    u32_field!("filename_length", filename_length),
    u32_field!("file_header_size", header_size),
    str_field!("maintype", maintype),
    str_field!("subtype", subtype),
    u32_field!("unknown0", unknown0),
    str_field!("filename", filename),
    u32_field!("stored_length", stored_length),
    u32_field!("pad1", pad1),
    u32_field!("original_length", original_length),
    u32_field!("pad2", pad2),
    u32_field!("offset", offset),
];

const NUMBER_OF_FILES: &str = "number_of_files";

/// Most missing blocks a lenient parse will stand in for with zeroed entries.
const MAX_ZERO_FILL: usize = 4096;

fn lookup<'a, T>(table: &'a [Field<T>], key: &str) -> Option<&'a Field<T>> {
    table.iter().find(|f| f.name() == key)
}

fn entry_field(key: &str) -> Option<&'static Field<FileEntry>> {
    // Older manifests spell the record size the same as the global key.
    let key = if key == "header_size" { "file_header_size" } else { key };
    lookup(ENTRY_FIELDS, key)
}

/// `0x`-prefixed hex or plain decimal.
pub fn parse_u32(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Trim, drop one trailing `;`, then strip one layer of double quotes.
fn clean_value(raw: &str) -> &str {
    let mut v = raw.trim();
    if let Some(s) = v.strip_suffix(';') {
        v = s.trim_end();
    }
    if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') {
        v = &v[1..v.len() - 1];
    }
    v
}

fn split_kv(line: &str) -> Option<(&str, &str)> {
    let (k, v) = line.split_once('=')?;
    Some((k.trim(), clean_value(v)))
}

fn is_block_open(line: &str) -> bool {
    line.starts_with("file_") && line.contains('{')
}

pub fn parse(text: &str, strictness: ManifestStrictness) -> Result<Manifest> {
    let mut header = ImageHeader::default();
    let mut declared: u32 = 0;
    let mut blocks: Vec<FileEntry> = Vec::new();
    let mut current: Option<FileEntry> = None;
    let mut warnings = Vec::new();

    let note = |msg: String, warnings: &mut Vec<String>| -> Result<()> {
        if strictness == ManifestStrictness::Strict {
            return Err(WtyError::Format(msg));
        }
        warn!("{msg}");
        warnings.push(msg);
        Ok(())
    };

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(fe) = current.as_mut() {
            if is_block_open(line) {
                note(
                    format!("line {line_no}: file block opened before the previous one closed"),
                    &mut warnings,
                )?;
                blocks.push(std::mem::take(fe));
                continue;
            }
            if !line.contains('=') {
                if line.contains('}') {
                    blocks.extend(current.take());
                }
                continue;
            }
            if let Some((key, val)) = split_kv(line) {
                match entry_field(key) {
                    Some(f) => f.apply(fe, val, line_no)?,
                    None => debug!(key, line_no, "unknown file key ignored"),
                }
            }
            continue;
        }

        if is_block_open(line) {
            current = Some(FileEntry::default());
            continue;
        }
        if line.starts_with('[') {
            continue;
        }
        let Some((key, val)) = split_kv(line) else {
            continue;
        };
        if key == NUMBER_OF_FILES {
            declared = parse_u32(val).ok_or_else(|| {
                WtyError::Format(format!(
                    "line {line_no}: `{NUMBER_OF_FILES}` expects a number, got {val:?}"
                ))
            })?;
            continue;
        }
        match lookup(HEADER_FIELDS, key) {
            Some(f) => f.apply(&mut header, val, line_no)?,
            None => debug!(key, line_no, "unknown global key ignored"),
        }
    }

    if let Some(fe) = current.take() {
        note("file block not closed before end of document".to_string(), &mut warnings)?;
        blocks.push(fe);
    }

    let declared_n = declared as usize;
    if blocks.len() > declared_n {
        debug!(found = blocks.len(), declared, "extra file blocks ignored");
        blocks.truncate(declared_n);
    } else if blocks.len() < declared_n {
        let missing = declared_n - blocks.len();
        if missing > MAX_ZERO_FILL {
            return Err(WtyError::Format(format!(
                "{NUMBER_OF_FILES} declares {declared} entries but only {} file blocks are \
                 present; refusing to zero-fill {missing} entries",
                blocks.len()
            )));
        }
        note(
            format!(
                "{NUMBER_OF_FILES} declares {declared} entries but only {} file blocks are present",
                blocks.len()
            ),
            &mut warnings,
        )?;
        blocks.resize_with(declared_n, FileEntry::default);
    }

    header.num_files = declared;
    Ok(Manifest { header, entries: blocks, warnings })
}

/// Render the header and entries. `number_of_files` is the entry count.
pub fn render(header: &ImageHeader, entries: &[FileEntry]) -> String {
    let mut out = String::from("[IMAGE_CFG]\n");
    for f in HEADER_FIELDS {
        f.render(header, &mut out);
    }
    let _ = writeln!(out, "{NUMBER_OF_FILES}=0x{:08X};", entries.len());

    if !entries.is_empty() {
        out.push_str("\n[FILELIST]\n");
        for (i, fe) in entries.iter().enumerate() {
            let _ = writeln!(out, "file_{} {{", i + 1);
            for f in ENTRY_FIELDS {
                f.render(fe, &mut out);
            }
            out.push_str("}\n");
        }
    }
    out
}

pub fn load_manifest(path: &Path, strictness: ManifestStrictness) -> Result<Manifest> {
    let bytes = std::fs::read(path).at(path)?;
    parse(&String::from_utf8_lossy(&bytes), strictness)
}

pub fn write_manifest(path: &Path, header: &ImageHeader, entries: &[FileEntry]) -> Result<()> {
    std::fs::write(path, render(header, entries)).at(path)
}
