//! SDT handler (spec §4.6): multi-section, version-compared like PAT, diffed per-service.
//!
//! Grounded on `original_source/demux.c` `HandleSDT`.

use crate::ca::CaCoordinator;
use crate::config::SDT_PID;
use crate::context::DemuxContext;
use crate::output::OutputId;
use crate::psi::{sdt, PsiTable};
use crate::sink::Sink;
use crate::source::Source;

pub fn handle<S: Source, K: Sink, C: CaCoordinator>(
    ctx: &mut DemuxContext<S, K, C>,
    cc: u8,
    payload: &[u8],
    dts: i64,
) {
    let mut sections = Vec::new();
    ctx.pids.slot_mut(SDT_PID).psi_buffer.push_packet(cc, payload, &mut sections);
    for section in sections {
        handle_section(ctx, &section, dts);
    }
}

fn handle_section<S: Source, K: Sink, C: CaCoordinator>(ctx: &mut DemuxContext<S, K, C>, section: &[u8], dts: i64) {
    let (common, syntax) = match crate::psi::validate_section(SDT_PID, section) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("invalid SDT section: {e}");
            return;
        }
    };
    if common.table_id() != sdt::TABLE_ID {
        log::warn!("unexpected table_id {:#x} on SDT PID", common.table_id());
        return;
    }
    if !ctx.sdt_cache.next.insert(&syntax, section.to_vec()) {
        return;
    }
    let next = ctx.sdt_cache.next.take();
    apply(ctx, next, dts);
}

fn apply<S: Source, K: Sink, C: CaCoordinator>(ctx: &mut DemuxContext<S, K, C>, next: PsiTable, dts: i64) {
    if !next.byte_equal(&ctx.sdt_cache.current) {
        let old = std::mem::replace(&mut ctx.sdt_cache.current, next);
        diff_services(ctx, &old);
    }
    let ids: Vec<OutputId> = ctx
        .output_ids()
        .filter(|&id| ctx.output(id).map(|o| o.config.dvb && o.config.sid != 0).unwrap_or(false))
        .collect();
    for id in ids {
        crate::gen::send_one(ctx, id, SDT_PID, dts, |o| &mut o.sdt);
    }
}

fn service_ids(table: &PsiTable) -> Vec<u16> {
    table.sections().flat_map(|s| sdt::body(s).services().map(|e| e.service_id())).collect()
}

type ServiceSnapshot = (bool, bool, u8, Vec<u8>);

fn snapshot(table: &PsiTable, sid: u16) -> Option<ServiceSnapshot> {
    table.sections().find_map(|s| {
        sdt::body(s).find(sid).map(|e| {
            (
                e.eit_schedule_flag(),
                e.eit_present_following_flag(),
                e.running_status(),
                e.descriptors_raw().to_vec(),
            )
        })
    })
}

/// Every SID that appeared, disappeared, or whose entry changed between `old` and the now
/// current SDT table (spec §4.6: "On any service appearance, disappearance, or version
/// bump, call UpdateSDT(sid)").
fn diff_services<S: Source, K: Sink, C: CaCoordinator>(ctx: &mut DemuxContext<S, K, C>, old: &PsiTable) {
    let new_ids = service_ids(&ctx.sdt_cache.current);
    let old_ids = service_ids(old);

    let mut changed: Vec<u16> = Vec::new();
    for &sid in &new_ids {
        if !old_ids.contains(&sid) || snapshot(&ctx.sdt_cache.current, sid) != snapshot(old, sid) {
            changed.push(sid);
        }
    }
    for &sid in &old_ids {
        if !new_ids.contains(&sid) {
            changed.push(sid);
        }
    }
    changed.sort_unstable();
    changed.dedup();

    for sid in changed {
        let ids: Vec<OutputId> = ctx.output_ids().filter(|&id| ctx.output(id).unwrap().config.sid == sid).collect();
        for id in ids {
            crate::gen::update_sdt(ctx, id);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::DemuxConfig;
    use crate::context::DemuxContext;
    use crate::output::OutputConfig;
    use crate::testutil::{FakeCa, FakeSink, FakeSource};

    fn new_ctx() -> DemuxContext<FakeSource, FakeSink, FakeCa> {
        DemuxContext::new(DemuxConfig::default(), FakeSource::default(), FakeSink::default(), FakeCa::default())
    }

    fn feed(ctx: &mut DemuxContext<FakeSource, FakeSink, FakeCa>, cc: u8, section: &[u8], dts: i64) {
        let mut payload = vec![0u8];
        payload.extend_from_slice(section);
        handle(ctx, cc, &payload, dts);
    }

    #[test]
    fn new_service_entry_triggers_update_sdt_on_dvb_outputs() {
        let mut ctx = new_ctx();
        let id = ctx.add_output(OutputConfig { sid: 1, dvb: true, ..Default::default() });
        let section = sdt::build(7, 7, 0, 1, true, true, 4, &[]);
        feed(&mut ctx, 0, &section, 0);
        let sdt_bytes = ctx.output(id).unwrap().sdt.bytes.clone().unwrap();
        let body = sdt::body(&sdt_bytes);
        assert!(body.find(1).is_some());
    }

    #[test]
    fn non_dvb_output_is_generated_but_never_sent() {
        let mut ctx = new_ctx();
        let id = ctx.add_output(OutputConfig { sid: 1, dvb: false, ..Default::default() });
        let section = sdt::build(7, 7, 0, 1, true, true, 4, &[]);
        feed(&mut ctx, 0, &section, 0);
        // generated (UpdateSDT ran regardless of the DVB flag)...
        assert!(ctx.output(id).unwrap().sdt.bytes.is_some());
        // ...but `apply`'s send pass only pushes SDT to DVB-flagged outputs.
        assert!(ctx.sink.packets.is_empty());
    }
}
