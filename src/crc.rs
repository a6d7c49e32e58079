//! CRC-32/MPEG-2, used to validate inbound PSI sections and to recompute the trailing CRC
//! after rewriting a section in place (EIT `transport_stream_id` rewrite, spec §4.7).
//!
//! Grounded on the CRC stage the teacher names but doesn't inline
//! (`psi::CrcCheckWholeSectionSyntaxPayloadParser` in `demultiplex.rs`) and on
//! `original_source/util.c`'s table-driven CRC for the exact polynomial.

use byteorder::{BigEndian, ByteOrder};

const POLY: u32 = 0x04C1_1DB7;

fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

thread_local! {
    static TABLE: [u32; 256] = build_table();
}

/// CRC-32/MPEG-2 over `data`, seeded at `0xFFFF_FFFF` with no final XOR, matching the
/// algorithm used throughout DVB/MPEG-2 PSI/SI.
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    TABLE.with(|table| {
        data.iter().fold(0xFFFF_FFFFu32, |crc, &byte| {
            let idx = (((crc >> 24) ^ u32::from(byte)) & 0xFF) as usize;
            (crc << 8) ^ table[idx]
        })
    })
}

/// Returns `true` if `section` (including its trailing 4-byte CRC) is internally consistent.
pub fn check(section: &[u8]) -> bool {
    if section.len() < 4 {
        return false;
    }
    let (body, trailer) = section.split_at(section.len() - 4);
    crc32_mpeg2(body) == BigEndian::read_u32(trailer)
}

/// Recomputes and overwrites the trailing 4-byte CRC of `section` in place.
pub fn restamp(section: &mut [u8]) {
    let len = section.len();
    assert!(len >= 4, "section too short to carry a CRC");
    let crc = crc32_mpeg2(&section[..len - 4]);
    BigEndian::write_u32(&mut section[len - 4..], crc);
}
