//! PMT (Program Map Table) parsing, stream-type selection rules, and output construction.
//!
//! Grounded on the teacher's `PmtSection`/`StreamInfo`/`StreamInfoIter` in
//! `demultiplex.rs`; diff/CA/PCR semantics from `original_source/demux.c` `HandlePMT`/
//! `PIDWouldBeSelected`/`PIDCarriesPES`/`PMTNeedsDescrambling` (spec §4.5, §4.9).

use crate::descriptor::{self, DescriptorIter};
use crate::psi::{SectionCommonHeader, TableSyntaxHeader};
use byteorder::{BigEndian, ByteOrder};

pub const TABLE_ID: u8 = 0x02;

/// Stream types selected by default when an output has no explicit `pid_list` (spec §4.9).
const AUTO_SELECTED_TYPES: [u8; 6] = [0x01, 0x02, 0x03, 0x04, 0x0F, 0x1B];
/// Stream types presumed to carry PES (spec §4.9, `carries_pes`).
const PES_TYPES: [u8; 7] = [0x01, 0x02, 0x03, 0x04, 0x06, 0x0F, 0x1B];

/// spec §4.9 `would_be_selected`.
pub fn would_be_selected(stream_type: u8, descriptors: &[u8]) -> bool {
    if AUTO_SELECTED_TYPES.contains(&stream_type) {
        return true;
    }
    if stream_type == 0x06 {
        return DescriptorIter::new(descriptors).any(|d| {
            matches!(
                d.tag,
                descriptor::TELETEXT_DESCRIPTOR_TAG
                    | descriptor::SUBTITLE_DESCRIPTOR_TAG
                    | descriptor::AC3_DESCRIPTOR_TAG
            )
        });
    }
    false
}

/// spec §4.9 `carries_pes`.
pub fn carries_pes(stream_type: u8) -> bool {
    PES_TYPES.contains(&stream_type)
}

pub struct StreamInfo<'buf> {
    data: &'buf [u8],
}

impl<'buf> StreamInfo<'buf> {
    const HEADER_SIZE: usize = 5;

    fn from_bytes(data: &'buf [u8]) -> Option<(StreamInfo<'buf>, usize)> {
        if data.len() < Self::HEADER_SIZE {
            return None;
        }
        let info = StreamInfo { data };
        let end = Self::HEADER_SIZE + info.es_info_length() as usize;
        if end > data.len() {
            return None;
        }
        Some((info, end))
    }

    pub fn stream_type(&self) -> u8 {
        self.data[0]
    }

    pub fn elementary_pid(&self) -> u16 {
        (u16::from(self.data[1] & 0x1F) << 8) | u16::from(self.data[2])
    }

    pub fn es_info_length(&self) -> u16 {
        (u16::from(self.data[3] & 0x0F) << 8) | u16::from(self.data[4])
    }

    pub fn descriptors_raw(&self) -> &'buf [u8] {
        let end = Self::HEADER_SIZE + self.es_info_length() as usize;
        &self.data[Self::HEADER_SIZE..end]
    }

    pub fn descriptors(&self) -> DescriptorIter<'buf> {
        DescriptorIter::new(self.descriptors_raw())
    }

    pub fn would_be_selected(&self) -> bool {
        would_be_selected(self.stream_type(), self.descriptors_raw())
    }

    pub fn carries_pes(&self) -> bool {
        carries_pes(self.stream_type())
    }
}

pub struct StreamInfoIter<'buf> {
    buf: &'buf [u8],
}

impl<'buf> Iterator for StreamInfoIter<'buf> {
    type Item = StreamInfo<'buf>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        let (info, len) = StreamInfo::from_bytes(self.buf)?;
        self.buf = &self.buf[len..];
        Some(info)
    }
}

pub struct PmtSection<'buf> {
    data: &'buf [u8],
}

impl<'buf> PmtSection<'buf> {
    const HEADER_SIZE: usize = 4;

    pub fn new(data: &'buf [u8]) -> PmtSection<'buf> {
        PmtSection { data }
    }

    pub fn pcr_pid(&self) -> u16 {
        (u16::from(self.data[0] & 0x1F) << 8) | u16::from(self.data[1])
    }

    pub fn program_info_length(&self) -> u16 {
        (u16::from(self.data[2] & 0x0F) << 8) | u16::from(self.data[3])
    }

    pub fn descriptors_raw(&self) -> &'buf [u8] {
        let end = Self::HEADER_SIZE + self.program_info_length() as usize;
        &self.data[Self::HEADER_SIZE..end]
    }

    pub fn descriptors(&self) -> DescriptorIter<'buf> {
        DescriptorIter::new(self.descriptors_raw())
    }

    pub fn streams(&self) -> StreamInfoIter<'buf> {
        let start = Self::HEADER_SIZE + self.program_info_length() as usize;
        StreamInfoIter { buf: &self.data[start..] }
    }

    /// Whether any program- or ES-level descriptor is a CA descriptor (spec §4.5).
    pub fn needs_descrambling(&self) -> bool {
        descriptor::has_ca_descriptor(self.descriptors_raw())
            || self.streams().any(|s| descriptor::has_ca_descriptor(s.descriptors_raw()))
    }
}

/// `program_number` from a PMT's syntax header (`table_id_extension`).
pub fn program_number(syntax: &TableSyntaxHeader) -> u16 {
    syntax.table_id_extension()
}

/// Extracts the PMT body (after the 3+5-byte headers, before the trailing CRC).
pub fn body(section: &[u8]) -> PmtSection<'_> {
    let start = SectionCommonHeader::SIZE + TableSyntaxHeader::SIZE;
    let end = section.len() - 4;
    PmtSection::new(&section[start..end])
}

/// One ES entry to emit in a built PMT (spec §4.8).
pub struct BuiltStream<'a> {
    pub stream_type: u8,
    pub pid: u16,
    pub descriptors: &'a [u8],
}

/// Builds a single-section PMT for `program_number`, stripping CA descriptors from both the
/// program-level and per-ES descriptor loops when `strip_ca` is set (spec §4.8).
pub fn build(
    program_number: u16,
    version: u8,
    pcr_pid: u16,
    program_descriptors: &[u8],
    streams: &[BuiltStream],
    strip_ca: bool,
) -> Vec<u8> {
    let mut program_desc_buf = Vec::new();
    descriptor::copy_descriptors(program_descriptors, strip_ca, &mut program_desc_buf);

    let mut stream_section = Vec::new();
    for s in streams {
        let mut desc_buf = Vec::new();
        descriptor::copy_descriptors(s.descriptors, strip_ca, &mut desc_buf);
        stream_section.push(s.stream_type);
        let mut pid_buf = [0u8; 2];
        pid_buf[0] = 0xE0 | ((s.pid >> 8) as u8 & 0x1F);
        pid_buf[1] = (s.pid & 0xFF) as u8;
        stream_section.extend_from_slice(&pid_buf);
        let len = desc_buf.len() as u16;
        stream_section.push(0xF0 | ((len >> 8) as u8 & 0x0F));
        stream_section.push((len & 0xFF) as u8);
        stream_section.extend_from_slice(&desc_buf);
    }

    let body_len = 5 + 4 + program_desc_buf.len() + stream_section.len() + 4;
    let mut out = Vec::with_capacity(3 + body_len);
    out.push(TABLE_ID);
    out.push(0x80 | 0x30 | ((body_len >> 8) as u8 & 0x0F));
    out.push((body_len & 0xFF) as u8);
    let mut pn_buf = [0u8; 2];
    BigEndian::write_u16(&mut pn_buf, program_number);
    out.extend_from_slice(&pn_buf);
    out.push(0xC0 | ((version & 0x1F) << 1) | 0x01);
    out.push(0);
    out.push(0);
    out.push(0xE0 | ((pcr_pid >> 8) as u8 & 0x1F));
    out.push((pcr_pid & 0xFF) as u8);
    let pil = program_desc_buf.len() as u16;
    out.push(0xF0 | ((pil >> 8) as u8 & 0x0F));
    out.push((pil & 0xFF) as u8);
    out.extend_from_slice(&program_desc_buf);
    out.extend_from_slice(&stream_section);
    out.extend_from_slice(&[0, 0, 0, 0]);
    crate::crc::restamp(&mut out);
    out
}
