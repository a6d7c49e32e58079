//! EIT (Event Information Table): never cached (spec §3), forwarded section-by-section with
//! `transport_stream_id` rewritten to the output's TSID and the CRC recomputed.
//!
//! Grounded on `original_source/demux.c` `HandleEIT`/`SendEIT`/`FlushEIT` (spec §4.7).

use crate::psi::{SectionCommonHeader, TableSyntaxHeader};
use byteorder::{BigEndian, ByteOrder};

/// present/following, actual TS (ETSI EN 300 468).
pub const TABLE_ID_PRESENT_FOLLOWING_ACTUAL: u8 = 0x4E;
/// schedule, actual TS: 0x50..=0x5F.
pub const TABLE_ID_SCHEDULE_ACTUAL_START: u8 = 0x50;
pub const TABLE_ID_SCHEDULE_ACTUAL_END: u8 = 0x5F;

pub fn is_schedule(table_id: u8) -> bool {
    (TABLE_ID_SCHEDULE_ACTUAL_START..=TABLE_ID_SCHEDULE_ACTUAL_END).contains(&table_id)
}

/// `service_id` is the EIT's `table_id_extension`.
pub fn service_id(syntax: &TableSyntaxHeader) -> u16 {
    syntax.table_id_extension()
}

/// The upstream `transport_stream_id`, the first field of the EIT body after the syntax
/// header.
pub fn transport_stream_id(section: &[u8]) -> u16 {
    let offset = SectionCommonHeader::SIZE + TableSyntaxHeader::SIZE;
    BigEndian::read_u16(&section[offset..offset + 2])
}

/// Rewrites `transport_stream_id` to `new_tsid` in place and recomputes the CRC (spec §4.7:
/// "rewrite the `transport_stream_id` to the output's TSID (re-CRC)").
pub fn rewrite_tsid(section: &mut [u8], new_tsid: u16) {
    let offset = SectionCommonHeader::SIZE + TableSyntaxHeader::SIZE;
    BigEndian::write_u16(&mut section[offset..offset + 2], new_tsid);
    crate::crc::restamp(section);
}
