mod common;

use common::{build_image, pattern, sample_header, MemPayloads};
use std::io::Cursor;
use wty_core::header::{
    self, ImagePayloads, FILE_HEADERS_START, MAIN_HEADER_SIZE, MIN_RECORD_LEN,
};
use wty_core::WtyError;

#[test]
fn headers_read_back_and_payloads_sit_at_offsets() {
    let files = vec![
        ("boot.fex", vec![1u8, 2, 3, 4, 5]),
        ("sys_config.fex", pattern(16, 7)),
        ("empty.fex", Vec::new()),
        ("u-boot.fex", pattern(1000, 3)),
    ];
    let (hdr, entries, img) = build_image(&files);

    let mut cur = Cursor::new(&img);
    let hdr2 = header::read_main_header(&mut cur).unwrap();
    assert!(hdr2.has_valid_magic());
    assert_eq!(hdr2, hdr);
    assert_eq!(hdr2.num_files, 4);
    let entries2 =
        header::read_all_file_entries(&mut cur, hdr2.num_files, hdr2.file_header_length).unwrap();
    assert_eq!(entries2, entries);

    for (fe, (name, data)) in entries2.iter().zip(&files) {
        assert_eq!(&fe.name(), name);
        let start = fe.offset as usize;
        assert_eq!(&img[start..start + data.len()], &data[..]);
        // pad tail is zero
        assert!(img[start + data.len()..fe.end() as usize].iter().all(|&b| b == 0));
    }
    assert_eq!(img.len() as u64, hdr.total_image_size as u64);
}

#[test]
fn rewrite_from_parsed_headers_is_byte_exact() {
    let files = vec![
        ("a.fex", pattern(5, 1)),
        ("Va.fex", 0x0403_0206u32.to_le_bytes().to_vec()),
        ("rootfs.fex", pattern(4097, 9)),
    ];
    let (_, _, img) = build_image(&files);

    let mut cur = Cursor::new(&img);
    let hdr = header::read_main_header(&mut cur).unwrap();
    let entries =
        header::read_all_file_entries(&mut cur, hdr.num_files, hdr.file_header_length).unwrap();

    let mut out = Cursor::new(Vec::new());
    let mut src = ImagePayloads::new(Cursor::new(&img));
    let n = header::write_container(&mut out, &hdr, &entries, &mut src).unwrap();
    assert_eq!(n, img.len() as u64);
    assert_eq!(out.into_inner(), img);
}

#[test]
fn longer_records_are_stepped_over() {
    let mut hdr = sample_header();
    hdr.file_header_length = 0x500;
    hdr.num_files = 2;
    let mut a = common::entry("a.fex");
    let mut b = common::entry("b.fex");
    let base = FILE_HEADERS_START as u32 + 2 * 0x500;
    a.offset = base;
    a.original_length = 3;
    a.stored_length = 16;
    b.offset = base + 16;
    b.original_length = 2;
    b.stored_length = 16;
    let entries = vec![a, b];

    let mut out = Cursor::new(Vec::new());
    let mut src = MemPayloads(vec![vec![1, 2, 3], vec![4, 5]]);
    header::write_container(&mut out, &hdr, &entries, &mut src).unwrap();
    let img = out.into_inner();
    assert_eq!(img.len() as u32, base + 32);

    let mut cur = Cursor::new(&img);
    let back = header::read_all_file_entries(&mut cur, 2, 0x500).unwrap();
    assert_eq!(back, entries);
    // the second record starts one stride in
    assert_eq!(&img[0x400 + 0x500 + 0x24..0x400 + 0x500 + 0x29], b"b.fex");
}

#[test]
fn magic_is_not_checked_by_the_reader() {
    let mut raw = vec![0u8; MAIN_HEADER_SIZE as usize];
    raw[..8].copy_from_slice(b"NOTANIMG");
    let hdr = header::read_main_header(&mut Cursor::new(&raw)).unwrap();
    assert!(!hdr.has_valid_magic());
}

#[test]
fn short_payload_is_a_format_error() {
    let mut hdr = sample_header();
    hdr.num_files = 1;
    let mut fe = common::entry("a.fex");
    fe.offset = 0x800;
    fe.original_length = 10;
    fe.stored_length = 16;

    let mut out = Cursor::new(Vec::new());
    let mut src = MemPayloads(vec![vec![0xAA; 4]]);
    let err = header::write_container(&mut out, &hdr, &[fe], &mut src).unwrap_err();
    assert!(matches!(err, WtyError::Format(_)), "{err}");
}

#[test]
fn record_length_below_field_span_is_rejected() {
    let mut hdr = sample_header();
    hdr.file_header_length = MIN_RECORD_LEN - 4;
    let fe = common::entry("a.fex");
    let mut out = Cursor::new(Vec::new());
    let mut src = MemPayloads(vec![Vec::new()]);
    let err = header::write_container(&mut out, &hdr, &[fe], &mut src).unwrap_err();
    assert!(matches!(err, WtyError::Format(_)));
}

#[test]
fn total_image_size_past_last_payload_is_zero_filled() {
    let files = vec![("a.fex", vec![9u8; 3])];
    let (mut hdr, entries, img) = build_image(&files);
    hdr.total_image_size += 64;
    let mut out = Cursor::new(Vec::new());
    let mut src = MemPayloads(vec![vec![9u8; 3]]);
    let n = header::write_container(&mut out, &hdr, &entries, &mut src).unwrap();
    let out = out.into_inner();
    assert_eq!(n as usize, img.len() + 64);
    assert_eq!(out.len(), img.len() + 64);
    assert!(out[img.len()..].iter().all(|&b| b == 0));
}
