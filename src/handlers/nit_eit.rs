//! NIT and EIT handling (spec §4.7): the upstream NIT is parsed only enough to log version
//! changes (an output's own NIT is always freshly synthesized, see `gen::update_nit`); EIT is
//! never cached and is forwarded section-by-section with its TSID rewritten.
//!
//! Grounded on `original_source/demux.c` `HandleNIT`/`HandleEIT`/`SendEIT`.

use crate::ca::CaCoordinator;
use crate::config::{EIT_PID, NIT_PID};
use crate::context::DemuxContext;
use crate::output::OutputId;
use crate::psi::eit;
use crate::psi::nit;
use crate::sink::Sink;
use crate::source::Source;

pub fn handle_nit<S: Source, K: Sink, C: CaCoordinator>(ctx: &mut DemuxContext<S, K, C>, cc: u8, payload: &[u8]) {
    let mut sections = Vec::new();
    ctx.pids.slot_mut(NIT_PID).psi_buffer.push_packet(cc, payload, &mut sections);
    for section in &sections {
        let (common, syntax) = match crate::psi::validate_section(NIT_PID, section) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("invalid NIT section: {e}");
                continue;
            }
        };
        if common.table_id() != nit::TABLE_ID {
            continue;
        }
        let version = syntax.version();
        if ctx.nit_upstream_version != Some(version) {
            log::info!("upstream NIT version changed to {version}");
            ctx.nit_upstream_version = Some(version);
        }
    }
}

/// Feeds one EIT-PID packet's payload through reassembly, forwarding each completed section
/// to every output that selects its service, has DVB output enabled, and (for schedule
/// tables) has EPG enabled (spec §4.7).
pub fn handle_eit<S: Source, K: Sink, C: CaCoordinator>(
    ctx: &mut DemuxContext<S, K, C>,
    cc: u8,
    payload: &[u8],
    dts: i64,
) {
    let mut sections = Vec::new();
    ctx.pids.slot_mut(EIT_PID).psi_buffer.push_packet(cc, payload, &mut sections);
    for section in sections {
        handle_section(ctx, section, dts);
    }
}

fn handle_section<S: Source, K: Sink, C: CaCoordinator>(ctx: &mut DemuxContext<S, K, C>, mut section: Vec<u8>, dts: i64) {
    let (common, syntax) = match crate::psi::validate_section(EIT_PID, &section) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("invalid EIT section: {e}");
            return;
        }
    };
    let table_id = common.table_id();
    let is_present_following = table_id == eit::TABLE_ID_PRESENT_FOLLOWING_ACTUAL;
    let is_schedule = eit::is_schedule(table_id);
    if !is_present_following && !is_schedule {
        return; // not an "actual TS" EIT variant this relay forwards.
    }
    let sid = eit::service_id(&syntax);
    if ctx.services.find(sid).is_none() {
        log::debug!("EIT for unknown service_id {sid}");
        return;
    }

    let ids: Vec<OutputId> = ctx
        .output_ids()
        .filter(|&id| {
            let o = ctx.output(id).unwrap();
            o.config.sid == sid && o.config.dvb && (!is_schedule || o.config.epg)
        })
        .collect();
    for id in ids {
        let tsid = ctx.output(id).unwrap().config.tsid;
        eit::rewrite_tsid(&mut section, tsid);
        crate::gen::feed_eit_section(ctx, id, &section, dts);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::DemuxConfig;
    use crate::context::DemuxContext;
    use crate::output::OutputConfig;
    use crate::testutil::{FakeCa, FakeSink, FakeSource};
    use byteorder::{BigEndian, ByteOrder};

    fn new_ctx() -> DemuxContext<FakeSource, FakeSink, FakeCa> {
        let mut ctx = DemuxContext::new(DemuxConfig::default(), FakeSource::default(), FakeSink::default(), FakeCa::default());
        ctx.services.allocate(1, 0x100);
        ctx
    }

    fn make_present_following(sid: u16, tsid: u16) -> Vec<u8> {
        let body_len = 5 + 2 + 4;
        let mut out = vec![0u8; 3 + body_len];
        out[0] = eit::TABLE_ID_PRESENT_FOLLOWING_ACTUAL;
        out[1] = 0x80 | 0x30 | ((body_len >> 8) as u8 & 0x0F);
        out[2] = (body_len & 0xFF) as u8;
        BigEndian::write_u16(&mut out[3..5], sid);
        out[5] = 0x01;
        BigEndian::write_u16(&mut out[8..10], tsid);
        crate::crc::restamp(&mut out);
        out
    }

    #[test]
    fn eit_forwarded_with_tsid_rewritten_for_matching_dvb_output() {
        let mut ctx = new_ctx();
        let id = ctx.add_output(OutputConfig { sid: 1, dvb: true, tsid: 99, fixed_tsid: true, ..Default::default() });
        let section = make_present_following(1, 1);
        let mut payload = vec![0u8];
        payload.extend_from_slice(&section);
        handle_eit(&mut ctx, 0, &payload, 0);
        assert_eq!(ctx.output(id).unwrap().eit_ts_offset, 5 + section.len());
        assert_eq!(eit::transport_stream_id(&ctx.output(id).unwrap().eit_ts_buffer[5..5 + section.len()]), 99);
    }

    #[test]
    fn nit_version_change_is_tracked() {
        let mut ctx = new_ctx();
        assert_eq!(ctx.nit_upstream_version, None);
        let section = nit::build(0, 42, "Test Network", 7);
        let mut payload = vec![0u8];
        payload.extend_from_slice(&section);
        handle_nit(&mut ctx, 0, &payload);
        assert_eq!(ctx.nit_upstream_version, Some(0));

        let section = nit::build(1, 42, "Test Network", 7);
        let mut payload = vec![0u8];
        payload.extend_from_slice(&section);
        handle_nit(&mut ctx, 1, &payload);
        assert_eq!(ctx.nit_upstream_version, Some(1));
    }

    #[test]
    fn eit_skipped_for_non_dvb_output() {
        let mut ctx = new_ctx();
        let id = ctx.add_output(OutputConfig { sid: 1, dvb: false, ..Default::default() });
        let section = make_present_following(1, 1);
        let mut payload = vec![0u8];
        payload.extend_from_slice(&section);
        handle_eit(&mut ctx, 0, &payload, 0);
        assert_eq!(ctx.output(id).unwrap().eit_ts_buffer.len(), 0);
    }
}
