//! Binary layout of an IMAGEWTY container.
//!
//! ```text
//! [main header, 1024 bytes][file records: count x record_len @ 0x400][payloads]
//! ```
//!
//! All integers are little-endian u32. String fields are fixed-width byte
//! arrays, conventionally NUL-terminated.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};

use serde::{Serialize, Serializer};
use tracing::debug;

use crate::error::{Result, WtyError};

pub const MAGIC: &[u8; 8] = b"IMAGEWTY";
/// Size of the zero-padded block holding the main header.
pub const MAIN_HEADER_SIZE: u64 = 1024;
/// Offset of the first file record.
pub const FILE_HEADERS_START: u64 = 0x400;
/// Record length written when a manifest leaves it unset.
pub const DEFAULT_RECORD_LEN: u32 = 0x400;
/// Bytes a record must hold to fit every field (end of `offset`).
pub const MIN_RECORD_LEN: u32 = 0x138;
/// Payload blocks are padded to this multiple.
pub const PAYLOAD_ALIGN: u32 = 16;

pub const MAINTYPE_LEN: usize = 8;
pub const SUBTYPE_LEN: usize = 16;
pub const FILENAME_LEN: usize = 256;

// Record field offsets.
const OFF_FILENAME_LEN: usize = 0x00;
const OFF_HEADER_SIZE: usize = 0x04;
const OFF_MAINTYPE: usize = 0x08;
const OFF_SUBTYPE: usize = 0x10;
const OFF_UNKNOWN0: usize = 0x20;
const OFF_FILENAME: usize = 0x24;
const OFF_STORED_LEN: usize = 0x124;
const OFF_PAD1: usize = 0x128;
const OFF_ORIGINAL_LEN: usize = 0x12C;
const OFF_PAD2: usize = 0x130;
const OFF_OFFSET: usize = 0x134;

/// Fixed-width, NUL-padded byte string. Keeps every stored byte so a
/// decoded record re-encodes identically.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedStr<const N: usize>(pub [u8; N]);

impl<const N: usize> FixedStr<N> {
    /// Copy `s` in, truncated to at most `N` bytes on a char boundary.
    pub fn from_str_truncate(s: &str) -> Self {
        let mut n = s.len().min(N);
        while !s.is_char_boundary(n) {
            n -= 1;
        }
        Self::from_bytes(&s.as_bytes()[..n])
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        let mut out = [0u8; N];
        let n = b.len().min(N);
        out[..n].copy_from_slice(&b[..n]);
        Self(out)
    }

    /// Bytes up to the first NUL.
    pub fn as_bytes(&self) -> &[u8] {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(N);
        &self.0[..end]
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl<const N: usize> Default for FixedStr<N> {
    fn default() -> Self {
        Self([0u8; N])
    }
}

impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

impl<const N: usize> fmt::Display for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.to_string_lossy())
    }
}

impl<const N: usize> Serialize for FixedStr<N> {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string_lossy())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImageHeader {
    pub magic: FixedStr<8>,
    pub header_version: u32,
    pub header_size: u32,
    pub base_ram: u32,
    pub format_version: u32,
    pub total_image_size: u32,
    pub header_size_aligned: u32,
    pub file_header_length: u32,
    pub usb_product_id: u32,
    pub usb_vendor_id: u32,
    pub hardware_id: u32,
    pub firmware_id: u32,
    pub unknown1: u32,
    pub unknown2: u32,
    pub num_files: u32,
    pub unknown3: u32,
}

impl ImageHeader {
    pub fn has_valid_magic(&self) -> bool {
        &self.magic.0 == MAGIC
    }

    /// Record stride, falling back to the default when unset.
    pub fn record_len(&self) -> u32 {
        if self.file_header_length == 0 {
            DEFAULT_RECORD_LEN
        } else {
            self.file_header_length
        }
    }

    /// End of the main header plus the record array.
    pub fn headers_end(&self, entry_count: usize) -> u64 {
        FILE_HEADERS_START + entry_count as u64 * self.record_len() as u64
    }

    fn words(&self) -> [u32; 15] {
        [
            self.header_version,
            self.header_size,
            self.base_ram,
            self.format_version,
            self.total_image_size,
            self.header_size_aligned,
            self.file_header_length,
            self.usb_product_id,
            self.usb_vendor_id,
            self.hardware_id,
            self.firmware_id,
            self.unknown1,
            self.unknown2,
            self.num_files,
            self.unknown3,
        ]
    }

    /// Serialize into the zero-padded 1024-byte block.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; MAIN_HEADER_SIZE as usize];
        buf[..8].copy_from_slice(&self.magic.0);
        for (i, w) in self.words().iter().enumerate() {
            put_u32(&mut buf, 8 + i * 4, *w);
        }
        buf
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub filename_length: u32,
    pub header_size: u32,
    pub maintype: FixedStr<MAINTYPE_LEN>,
    pub subtype: FixedStr<SUBTYPE_LEN>,
    pub unknown0: u32,
    pub filename: FixedStr<FILENAME_LEN>,
    pub stored_length: u32,
    pub pad1: u32,
    pub original_length: u32,
    pub pad2: u32,
    pub offset: u32,
}

impl FileEntry {
    pub fn name(&self) -> String {
        self.filename.to_string_lossy()
    }

    /// Serialize into a zero-padded record of `record_len` bytes.
    pub fn encode(&self, record_len: u32) -> Result<Vec<u8>> {
        if record_len < MIN_RECORD_LEN {
            return Err(WtyError::Format(format!(
                "file record length {record_len:#x} is below the minimum {MIN_RECORD_LEN:#x}"
            )));
        }
        let mut buf = vec![0u8; record_len as usize];
        put_u32(&mut buf, OFF_FILENAME_LEN, self.filename_length);
        put_u32(&mut buf, OFF_HEADER_SIZE, self.header_size);
        buf[OFF_MAINTYPE..OFF_MAINTYPE + MAINTYPE_LEN].copy_from_slice(&self.maintype.0);
        buf[OFF_SUBTYPE..OFF_SUBTYPE + SUBTYPE_LEN].copy_from_slice(&self.subtype.0);
        put_u32(&mut buf, OFF_UNKNOWN0, self.unknown0);
        buf[OFF_FILENAME..OFF_FILENAME + FILENAME_LEN].copy_from_slice(&self.filename.0);
        put_u32(&mut buf, OFF_STORED_LEN, self.stored_length);
        put_u32(&mut buf, OFF_PAD1, self.pad1);
        put_u32(&mut buf, OFF_ORIGINAL_LEN, self.original_length);
        put_u32(&mut buf, OFF_PAD2, self.pad2);
        put_u32(&mut buf, OFF_OFFSET, self.offset);
        Ok(buf)
    }

    pub fn end(&self) -> u64 {
        self.offset as u64 + self.stored_length as u64
    }
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_array<R: Read, const N: usize>(r: &mut R) -> io::Result<[u8; N]> {
    let mut b = [0u8; N];
    r.read_exact(&mut b)?;
    Ok(b)
}

/// Read the magic and the fifteen header words. The magic is not checked.
pub fn read_main_header<R: Read>(r: &mut R) -> io::Result<ImageHeader> {
    let magic = FixedStr(read_array::<_, 8>(r)?);
    let mut w = [0u32; 15];
    for slot in w.iter_mut() {
        *slot = read_u32(r)?;
    }
    Ok(ImageHeader {
        magic,
        header_version: w[0],
        header_size: w[1],
        base_ram: w[2],
        format_version: w[3],
        total_image_size: w[4],
        header_size_aligned: w[5],
        file_header_length: w[6],
        usb_product_id: w[7],
        usb_vendor_id: w[8],
        hardware_id: w[9],
        firmware_id: w[10],
        unknown1: w[11],
        unknown2: w[12],
        num_files: w[13],
        unknown3: w[14],
    })
}

/// Read one record starting at the current position and consume the rest of
/// `record_len`, so longer records from newer revisions are tolerated.
pub fn read_file_entry<R: Read>(r: &mut R, record_len: u32) -> io::Result<FileEntry> {
    let filename_length = read_u32(r)?;
    let header_size = read_u32(r)?;
    let maintype = FixedStr(read_array::<_, MAINTYPE_LEN>(r)?);
    let subtype = FixedStr(read_array::<_, SUBTYPE_LEN>(r)?);
    let unknown0 = read_u32(r)?;

    // A corrupt length must not run past the fixed field.
    let name_len = (filename_length as usize).min(FILENAME_LEN);
    let mut name = [0u8; FILENAME_LEN];
    r.read_exact(&mut name[..name_len])?;
    skip(r, (FILENAME_LEN - name_len) as u64)?;

    let stored_length = read_u32(r)?;
    let pad1 = read_u32(r)?;
    let original_length = read_u32(r)?;
    let pad2 = read_u32(r)?;
    let offset = read_u32(r)?;

    if record_len > MIN_RECORD_LEN {
        skip(r, (record_len - MIN_RECORD_LEN) as u64)?;
    }

    Ok(FileEntry {
        filename_length,
        header_size,
        maintype,
        subtype,
        unknown0,
        filename: FixedStr(name),
        stored_length,
        pad1,
        original_length,
        pad2,
        offset,
    })
}

fn skip<R: Read>(r: &mut R, n: u64) -> io::Result<()> {
    let got = io::copy(&mut r.by_ref().take(n), &mut io::sink())?;
    if got != n {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "record truncated"));
    }
    Ok(())
}

/// Read `count` records at `0x400 + i * record_len`. Each slot is addressed
/// positionally; the record length is authoritative.
pub fn read_all_file_entries<R: Read + Seek>(
    r: &mut R,
    count: u32,
    record_len: u32,
) -> io::Result<Vec<FileEntry>> {
    let mut out = Vec::with_capacity(count.min(4096) as usize);
    for i in 0..count as u64 {
        r.seek(SeekFrom::Start(FILE_HEADERS_START + i * record_len as u64))?;
        out.push(read_file_entry(r, record_len)?);
    }
    Ok(out)
}

/// Where `write_container` gets each entry's payload bytes from.
pub trait PayloadSource {
    /// A reader positioned at the start of the entry's payload. At least
    /// `original_length` bytes must be available.
    fn open_payload(&mut self, index: usize, entry: &FileEntry) -> Result<Box<dyn Read + '_>>;
}

/// Payloads taken from an existing container at their recorded offsets.
pub struct ImagePayloads<R> {
    inner: R,
}

impl<R: Read + Seek> ImagePayloads<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read + Seek> PayloadSource for ImagePayloads<R> {
    fn open_payload(&mut self, index: usize, entry: &FileEntry) -> Result<Box<dyn Read + '_>> {
        self.inner.seek(SeekFrom::Start(entry.offset as u64)).map_err(|e| {
            WtyError::Format(format!("entry {index}: cannot seek to payload: {e}"))
        })?;
        Ok(Box::new((&mut self.inner).take(entry.original_length as u64)))
    }
}

/// Write the header block, every record at its slot, and every payload at
/// its declared offset followed by zero padding up to `stored_length`.
/// Bytes not covered by any block are zero. The output is extended with
/// zeros to `total_image_size` when that lies past the last payload.
/// Returns the resulting container length.
pub fn write_container<W: Write + Seek, P: PayloadSource + ?Sized>(
    w: &mut W,
    header: &ImageHeader,
    entries: &[FileEntry],
    payloads: &mut P,
) -> Result<u64> {
    let record_len = header.record_len();
    let wio = |e: io::Error| WtyError::Format(format!("cannot write container: {e}"));

    w.seek(SeekFrom::Start(0)).map_err(wio)?;
    w.write_all(&header.encode()).map_err(wio)?;
    let mut end = MAIN_HEADER_SIZE;

    for (i, fe) in entries.iter().enumerate() {
        let at = FILE_HEADERS_START + i as u64 * record_len as u64;
        w.seek(SeekFrom::Start(at)).map_err(wio)?;
        w.write_all(&fe.encode(record_len)?).map_err(wio)?;
        end = end.max(at + record_len as u64);
    }

    let mut buf = vec![0u8; 0x10000];
    for (i, fe) in entries.iter().enumerate() {
        if fe.stored_length < fe.original_length {
            return Err(WtyError::Format(format!(
                "entry {i} ({}): stored length {} is below original length {}",
                fe.name(),
                fe.stored_length,
                fe.original_length
            )));
        }
        w.seek(SeekFrom::Start(fe.offset as u64)).map_err(wio)?;
        let mut src = payloads.open_payload(i, fe)?;
        let mut left = fe.original_length as u64;
        while left > 0 {
            let want = left.min(buf.len() as u64) as usize;
            let n = match src.read(&mut buf[..want]) {
                Ok(0) => {
                    return Err(WtyError::Format(format!(
                        "entry {i} ({}): payload ended {left} bytes short of {}",
                        fe.name(),
                        fe.original_length
                    )))
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(WtyError::Format(format!(
                        "entry {i} ({}): cannot read payload: {e}",
                        fe.name()
                    )))
                }
            };
            w.write_all(&buf[..n]).map_err(wio)?;
            left -= n as u64;
        }
        drop(src);
        write_zeros(w, (fe.stored_length - fe.original_length) as u64).map_err(wio)?;
        end = end.max(fe.end());
        debug!(index = i, offset = fe.offset, stored = fe.stored_length, "payload written");
    }

    let total = header.total_image_size as u64;
    if total > end {
        w.seek(SeekFrom::Start(end)).map_err(wio)?;
        write_zeros(w, total - end).map_err(wio)?;
        end = total;
    }
    w.flush().map_err(wio)?;
    Ok(end)
}

fn write_zeros<W: Write>(w: &mut W, mut n: u64) -> io::Result<()> {
    const ZEROS: [u8; 4096] = [0u8; 4096];
    while n > 0 {
        let k = n.min(ZEROS.len() as u64) as usize;
        w.write_all(&ZEROS[..k])?;
        n -= k as u64;
    }
    Ok(())
}

/// `len` rounded up to the payload alignment.
pub fn align_up(len: u32) -> u32 {
    len.div_ceil(PAYLOAD_ALIGN) * PAYLOAD_ALIGN
}
