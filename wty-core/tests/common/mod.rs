#![allow(dead_code)]

use std::io::{Cursor, Read};
use wty_core::header::{self, FileEntry, FixedStr, ImageHeader, PayloadSource, MAGIC};
use wty_core::repack::plan_layout;

/// Payloads held in memory, one buffer per entry.
pub struct MemPayloads(pub Vec<Vec<u8>>);

impl PayloadSource for MemPayloads {
    fn open_payload(
        &mut self,
        index: usize,
        _entry: &FileEntry,
    ) -> wty_core::Result<Box<dyn Read + '_>> {
        Ok(Box::new(&self.0[index][..]))
    }
}

pub fn sample_header() -> ImageHeader {
    ImageHeader {
        magic: FixedStr(*MAGIC),
        header_version: 0x100,
        header_size: 0x50,
        base_ram: 0x04D0_0000,
        format_version: 0x0010_0234,
        header_size_aligned: 0x60,
        file_header_length: 0x400,
        usb_product_id: 0x1234,
        usb_vendor_id: 0x8743,
        hardware_id: 0x100,
        firmware_id: 0x100,
        unknown1: 1,
        unknown2: 0x04,
        ..Default::default()
    }
}

pub fn entry(name: &str) -> FileEntry {
    FileEntry {
        filename_length: 256,
        header_size: 0x400,
        maintype: FixedStr::from_str_truncate("RFSFAT16"),
        subtype: FixedStr::from_str_truncate("BOOT_FEX00000000"),
        filename: FixedStr::from_str_truncate(name),
        ..Default::default()
    }
}

/// A freshly laid-out container holding `files` in order.
pub fn build_image(files: &[(&str, Vec<u8>)]) -> (ImageHeader, Vec<FileEntry>, Vec<u8>) {
    let entries: Vec<FileEntry> = files.iter().map(|(n, _)| entry(n)).collect();
    let sizes: Vec<u64> = files.iter().map(|(_, d)| d.len() as u64).collect();
    let (hdr, entries) = plan_layout(&sample_header(), &entries, &sizes).unwrap();
    let mut cur = Cursor::new(Vec::new());
    let mut src = MemPayloads(files.iter().map(|(_, d)| d.clone()).collect());
    header::write_container(&mut cur, &hdr, &entries, &mut src).unwrap();
    (hdr, entries, cur.into_inner())
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
