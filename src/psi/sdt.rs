//! SDT (Service Description Table) parsing and single-service output construction.
//!
//! Grounded on field layout in `other_examples/toshipp-tstools__src-psi-sdt.rs` and
//! `other_examples/dholroyd-en-300-468-reader__src-sdt.rs`; diff/versioning semantics from
//! `original_source/demux.c` `HandleSDT`/`NewSDT` (spec §4.6, §4.8).

use crate::descriptor::{self, DescriptorIter};
use crate::psi::{SectionCommonHeader, TableSyntaxHeader};
use byteorder::{BigEndian, ByteOrder};

/// `table_id` for the "actual transport stream" SDT (the only variant this relay rewrites).
pub const TABLE_ID: u8 = 0x42;

pub struct ServiceEntry<'buf> {
    data: &'buf [u8],
}

impl<'buf> ServiceEntry<'buf> {
    const HEADER_SIZE: usize = 5;

    fn from_bytes(data: &'buf [u8]) -> Option<(ServiceEntry<'buf>, usize)> {
        if data.len() < Self::HEADER_SIZE {
            return None;
        }
        let entry = ServiceEntry { data };
        let end = Self::HEADER_SIZE + entry.descriptors_loop_length() as usize;
        if end > data.len() {
            return None;
        }
        Some((entry, end))
    }

    pub fn service_id(&self) -> u16 {
        BigEndian::read_u16(&self.data[0..2])
    }

    pub fn eit_schedule_flag(&self) -> bool {
        self.data[2] & 0x02 != 0
    }

    pub fn eit_present_following_flag(&self) -> bool {
        self.data[2] & 0x01 != 0
    }

    pub fn running_status(&self) -> u8 {
        self.data[3] >> 5
    }

    pub fn free_ca_mode(&self) -> bool {
        self.data[3] & 0x10 != 0
    }

    fn descriptors_loop_length(&self) -> u16 {
        (u16::from(self.data[3] & 0x0F) << 8) | u16::from(self.data[4])
    }

    pub fn descriptors_raw(&self) -> &'buf [u8] {
        let end = Self::HEADER_SIZE + self.descriptors_loop_length() as usize;
        &self.data[Self::HEADER_SIZE..end]
    }

    pub fn descriptors(&self) -> DescriptorIter<'buf> {
        DescriptorIter::new(self.descriptors_raw())
    }
}

pub struct ServiceIter<'buf> {
    buf: &'buf [u8],
}

impl<'buf> Iterator for ServiceIter<'buf> {
    type Item = ServiceEntry<'buf>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        let (entry, len) = ServiceEntry::from_bytes(self.buf)?;
        self.buf = &self.buf[len..];
        Some(entry)
    }
}

pub struct SdtSection<'buf> {
    data: &'buf [u8],
}

impl<'buf> SdtSection<'buf> {
    /// `original_network_id` (2 bytes) + reserved (1 byte) precede the service loop.
    const HEADER_SIZE: usize = 3;

    pub fn new(data: &'buf [u8]) -> SdtSection<'buf> {
        SdtSection { data }
    }

    pub fn original_network_id(&self) -> u16 {
        BigEndian::read_u16(&self.data[0..2])
    }

    pub fn services(&self) -> ServiceIter<'buf> {
        ServiceIter { buf: &self.data[Self::HEADER_SIZE..] }
    }

    pub fn find(&self, sid: u16) -> Option<ServiceEntry<'buf>> {
        self.services().find(|s| s.service_id() == sid)
    }
}

pub fn body(section: &[u8]) -> SdtSection<'_> {
    let start = SectionCommonHeader::SIZE + TableSyntaxHeader::SIZE;
    let end = section.len() - 4;
    SdtSection::new(&section[start..end])
}

/// Builds a single-section SDT naming exactly one service. `free_ca_mode` is always cleared
/// on output (spec §4.8: "never setting `free_CA_mode`").
pub fn build(
    tsid: u16,
    original_network_id: u16,
    version: u8,
    sid: u16,
    eit_schedule_flag: bool,
    eit_present_following_flag: bool,
    running_status: u8,
    descriptors: &[u8],
) -> Vec<u8> {
    let mut desc_buf = Vec::new();
    descriptor::copy_descriptors(descriptors, false, &mut desc_buf);

    let service_len = 5 + desc_buf.len();
    let body_len = 5 + 3 + service_len + 4;
    let mut out = Vec::with_capacity(3 + body_len);
    out.push(TABLE_ID);
    out.push(0x80 | 0x30 | ((body_len >> 8) as u8 & 0x0F));
    out.push((body_len & 0xFF) as u8);
    let mut tsid_buf = [0u8; 2];
    BigEndian::write_u16(&mut tsid_buf, tsid);
    out.extend_from_slice(&tsid_buf);
    out.push(0xC0 | ((version & 0x1F) << 1) | 0x01);
    out.push(0);
    out.push(0);
    let mut onid_buf = [0u8; 2];
    BigEndian::write_u16(&mut onid_buf, original_network_id);
    out.extend_from_slice(&onid_buf);
    out.push(0xFF); // reserved_future_use
    let mut sid_buf = [0u8; 2];
    BigEndian::write_u16(&mut sid_buf, sid);
    out.extend_from_slice(&sid_buf);
    out.push(
        0xFC | if eit_schedule_flag { 0x02 } else { 0 }
            | if eit_present_following_flag { 0x01 } else { 0 },
    );
    let dll = desc_buf.len() as u16;
    out.push(((running_status & 0x07) << 5) | ((dll >> 8) as u8 & 0x0F)); // free_CA_mode=0
    out.push((dll & 0xFF) as u8);
    out.extend_from_slice(&desc_buf);
    out.extend_from_slice(&[0, 0, 0, 0]);
    crate::crc::restamp(&mut out);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn build_and_parse_roundtrip() {
        let section = build(42, 7, 0, 1, true, true, 4, &[]);
        assert!(crate::crc::check(&section));
        let parsed = body(&section);
        assert_eq!(parsed.original_network_id(), 7);
        let svc = parsed.find(1).unwrap();
        assert!(svc.eit_schedule_flag());
        assert!(svc.eit_present_following_flag());
        assert_eq!(svc.running_status(), 4);
        assert!(!svc.free_ca_mode());
    }
}
