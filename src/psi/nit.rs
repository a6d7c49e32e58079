//! NIT (Network Information Table): minimal synthesis of an output-specific NIT carrying
//! exactly one transport-stream entry, and enough upstream parsing to log version changes.
//!
//! Grounded on `original_source/demux.c` `NewNIT`/`HandleNIT`/`HandleNITSection` (spec §4.7:
//! "a minimal rewrite... The upstream NIT is parsed only enough to detect version changes
//! for logging").

use byteorder::BigEndian;
use byteorder::ByteOrder;

pub const TABLE_ID: u8 = 0x40;
/// Network name descriptor tag (ETSI EN 300 468).
const NETWORK_NAME_DESCRIPTOR_TAG: u8 = 0x40;

/// Builds a single-section NIT-actual advertising one transport stream (this output's TSID)
/// under `network_id`/`network_name` (spec §4.7).
pub fn build(version: u8, network_id: u16, network_name: &str, tsid: u16) -> Vec<u8> {
    let name_bytes = network_name.as_bytes();
    let mut network_desc = Vec::new();
    network_desc.push(NETWORK_NAME_DESCRIPTOR_TAG);
    network_desc.push(name_bytes.len() as u8);
    network_desc.extend_from_slice(name_bytes);

    // one TS-loop entry: transport_stream_id, original_network_id, no descriptors.
    let mut ts_loop = Vec::new();
    let mut buf = [0u8; 2];
    BigEndian::write_u16(&mut buf, tsid);
    ts_loop.extend_from_slice(&buf);
    BigEndian::write_u16(&mut buf, network_id);
    ts_loop.extend_from_slice(&buf);
    ts_loop.push(0xF0); // reserved + transport_descriptors_length=0 high bits
    ts_loop.push(0x00);

    let body_len = 5 + 2 + network_desc.len() + 2 + ts_loop.len() + 4;
    let mut out = Vec::with_capacity(3 + body_len);
    out.push(TABLE_ID);
    out.push(0x80 | 0x30 | ((body_len >> 8) as u8 & 0x0F));
    out.push((body_len & 0xFF) as u8);
    let mut nid_buf = [0u8; 2];
    BigEndian::write_u16(&mut nid_buf, network_id);
    out.extend_from_slice(&nid_buf);
    out.push(0xC0 | ((version & 0x1F) << 1) | 0x01);
    out.push(0);
    out.push(0);
    let ndl = network_desc.len() as u16;
    out.push(0xF0 | ((ndl >> 8) as u8 & 0x0F));
    out.push((ndl & 0xFF) as u8);
    out.extend_from_slice(&network_desc);
    let tsl = ts_loop.len() as u16;
    out.push(0xF0 | ((tsl >> 8) as u8 & 0x0F));
    out.push((tsl & 0xFF) as u8);
    out.extend_from_slice(&ts_loop);
    out.extend_from_slice(&[0, 0, 0, 0]);
    crate::crc::restamp(&mut out);
    out
}

/// Reads just enough of an upstream NIT section to report its version (spec §4.7); returns
/// `None` if the section isn't long enough to contain a syntax header.
pub fn upstream_version(section: &[u8]) -> Option<u8> {
    if section.len() < crate::psi::SectionCommonHeader::SIZE + crate::psi::TableSyntaxHeader::SIZE {
        return None;
    }
    let syntax = crate::psi::TableSyntaxHeader::new(&section[crate::psi::SectionCommonHeader::SIZE..]);
    Some(syntax.version())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builds_valid_section() {
        let section = build(0, 42, "Test Network", 7);
        assert!(crate::crc::check(&section));
        assert_eq!(upstream_version(&section), Some(0));
    }
}
