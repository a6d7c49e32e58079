//! MPEg-2 TS packet header parsing: sync byte, PID, continuity counter, adaptation field,
//! and PCR extraction.
//!
//! Grounded on `packet::Packet` as referenced throughout the teacher's `demultiplex.rs`
//! (`Packet::is_sync_byte`, `pk.pid()`); PCR semantics and the per-packet processing order
//! (PSI reassembly, then PCR anchor update, then output forwarding) from
//! `original_source/demux.c` `HandlePSIPacket`/`demux_Handle` (spec §4.10, §5).

use bitreader::BitReader;

/// Fixed MPEG-2 TS packet size in bytes (spec §6).
pub const PACKET_SIZE: usize = 188;

const SYNC_BYTE: u8 = 0x47;

/// A borrowed, parsed view over one 188-byte TS packet.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'buf> {
    buf: &'buf [u8],
}

impl<'buf> Packet<'buf> {
    pub fn is_sync_byte(b: u8) -> bool {
        b == SYNC_BYTE
    }

    /// Wraps `buf`, which must be exactly [`PACKET_SIZE`] bytes starting with the sync byte.
    pub fn new(buf: &'buf [u8]) -> Packet<'buf> {
        debug_assert_eq!(buf.len(), PACKET_SIZE);
        debug_assert!(Self::is_sync_byte(buf[0]));
        Packet { buf }
    }

    pub fn transport_error_indicator(&self) -> bool {
        self.buf[1] & 0x80 != 0
    }

    pub fn payload_unit_start_indicator(&self) -> bool {
        self.buf[1] & 0x40 != 0
    }

    pub fn pid(&self) -> u16 {
        (u16::from(self.buf[1] & 0x1F) << 8) | u16::from(self.buf[2])
    }

    pub fn scrambling_control(&self) -> u8 {
        self.buf[3] >> 6
    }

    pub fn is_scrambled(&self) -> bool {
        self.scrambling_control() != 0
    }

    pub fn has_adaptation_field(&self) -> bool {
        self.buf[3] & 0x20 != 0
    }

    pub fn has_payload(&self) -> bool {
        self.buf[3] & 0x10 != 0
    }

    pub fn continuity_counter(&self) -> u8 {
        self.buf[3] & 0x0F
    }

    fn adaptation_field_length(&self) -> usize {
        if self.has_adaptation_field() {
            self.buf[4] as usize
        } else {
            0
        }
    }

    /// Offset of `pointer_field`/section bytes within the 188-byte packet, i.e. just past the
    /// 4-byte header and any adaptation field.
    fn payload_offset(&self) -> usize {
        4 + if self.has_adaptation_field() {
            1 + self.adaptation_field_length()
        } else {
            0
        }
    }

    /// The packet's payload bytes, or `None` if `adaptation_field_control` indicates no
    /// payload (spec §4.2: "If packet has no payload -> ignore").
    pub fn payload(&self) -> Option<&'buf [u8]> {
        if !self.has_payload() {
            return None;
        }
        let offset = self.payload_offset();
        if offset >= self.buf.len() {
            return None;
        }
        Some(&self.buf[offset..])
    }

    /// PCR value in 27MHz clock ticks (`base * 300 + extension`), if the adaptation field
    /// carries one.
    pub fn pcr(&self) -> Option<u64> {
        if !self.has_adaptation_field() || self.adaptation_field_length() < 1 {
            return None;
        }
        let flags = self.buf[5];
        let pcr_flag = flags & 0x10 != 0;
        if !pcr_flag || self.adaptation_field_length() < 7 {
            return None;
        }
        let pcr_bytes = &self.buf[6..12];
        let mut reader = BitReader::new(pcr_bytes);
        let base = reader.read_u64(33).ok()?;
        let _reserved = reader.read_u8(6).ok()?;
        let extension = reader.read_u16(9).ok()?;
        Some(base * 300 + u64::from(extension))
    }

    pub fn discontinuity_indicator(&self) -> bool {
        self.has_adaptation_field()
            && self.adaptation_field_length() >= 1
            && self.buf[5] & 0x80 != 0
    }

    pub fn raw(&self) -> &'buf [u8] {
        self.buf
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn make_packet(pid: u16, cc: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; PACKET_SIZE];
        buf[0] = SYNC_BYTE;
        buf[1] = (pid >> 8) as u8 & 0x1F;
        buf[2] = (pid & 0xFF) as u8;
        buf[3] = 0x10 | (cc & 0x0F); // payload present, no adaptation field
        buf[4..4 + payload.len()].copy_from_slice(payload);
        buf
    }

    #[test]
    fn parses_header_fields() {
        let buf = make_packet(0x100, 7, &[0xAA, 0xBB]);
        let pk = Packet::new(&buf);
        assert_eq!(pk.pid(), 0x100);
        assert_eq!(pk.continuity_counter(), 7);
        assert!(!pk.has_adaptation_field());
        assert_eq!(&pk.payload().unwrap()[..2], &[0xAA, 0xBB]);
    }

    #[test]
    fn extracts_pcr() {
        use bitstream_io::{BigEndian as BitBigEndian, BitWrite, BitWriter};

        let mut pcr_field = Vec::new();
        {
            let mut writer = BitWriter::endian(&mut pcr_field, BitBigEndian);
            writer.write(33, 1u64).unwrap(); // program_clock_reference_base
            writer.write(6, 0u8).unwrap(); // reserved
            writer.write(9, 0u16).unwrap(); // program_clock_reference_extension
        }

        let mut buf = vec![0u8; PACKET_SIZE];
        buf[0] = SYNC_BYTE;
        buf[1] = 0x01;
        buf[2] = 0x00;
        buf[3] = 0x20; // adaptation field only, no payload
        buf[4] = 7; // adaptation_field_length
        buf[5] = 0x10; // PCR_flag set
        buf[6..12].copy_from_slice(&pcr_field);
        let pk = Packet::new(&buf);
        // base=1, reserved=0, extension=0 -> PCR = 1*300 = 300
        assert_eq!(pk.pcr(), Some(300));
    }

    #[test]
    fn no_payload_returns_none() {
        let mut buf = vec![0u8; PACKET_SIZE];
        buf[0] = SYNC_BYTE;
        buf[3] = 0x20; // adaptation field only
        buf[4] = 0;
        let pk = Packet::new(&buf);
        assert!(pk.payload().is_none());
    }
}
