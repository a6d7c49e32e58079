//! The service (SID) registry (spec §3): maps `sid -> (pmt_pid, current_pmt bytes)`, created
//! from PAT and populated from PMT.
//!
//! Grounded on `sid_t`/`pp_sids` in `original_source/demux.c` (`HandlePAT`'s
//! alloc-or-reuse-free-slot loop).

/// One service record. `sid == 0` marks a free slot (spec §3).
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub sid: u16,
    pub pmt_pid: u16,
    pub current_pmt: Option<Vec<u8>>,
    /// Tracked so the PMT handler can detect a CA-needing -> not-needing transition without
    /// re-parsing the previous PMT bytes (spec §4.5).
    pub needs_descrambling: bool,
}

impl ServiceRecord {
    fn empty() -> ServiceRecord {
        ServiceRecord { sid: 0, pmt_pid: 0, current_pmt: None, needs_descrambling: false }
    }
}

/// Owns every known service. Free slots (`sid == 0`) are reused before the registry grows,
/// mirroring the original's `for (...) if (pp_sids[i]->i_sid == 0) break;` scan.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: Vec<ServiceRecord>,
}

impl ServiceRegistry {
    pub fn new() -> ServiceRegistry {
        ServiceRegistry::default()
    }

    pub fn find(&self, sid: u16) -> Option<&ServiceRecord> {
        if sid == 0 {
            return None;
        }
        self.services.iter().find(|s| s.sid == sid)
    }

    pub fn find_mut(&mut self, sid: u16) -> Option<&mut ServiceRecord> {
        if sid == 0 {
            return None;
        }
        self.services.iter_mut().find(|s| s.sid == sid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.services.iter().filter(|s| s.sid != 0)
    }

    /// Allocates a service for `sid` at `pmt_pid`, reusing a free (`sid == 0`) slot if one
    /// exists (spec §4.4: "Allocate a free service slot (reusing one with sid=0) or grow the
    /// service registry"). Panics if `sid` is already present — callers must `clear` the
    /// old record first via [`ServiceRegistry::clear`].
    pub fn allocate(&mut self, sid: u16, pmt_pid: u16) {
        assert_ne!(sid, 0, "sid 0 is the free-slot sentinel");
        assert!(self.find(sid).is_none(), "sid {sid} already allocated");
        if let Some(slot) = self.services.iter_mut().find(|s| s.sid == 0) {
            slot.sid = sid;
            slot.pmt_pid = pmt_pid;
            slot.current_pmt = None;
            slot.needs_descrambling = false;
        } else {
            let mut rec = ServiceRecord::empty();
            rec.sid = sid;
            rec.pmt_pid = pmt_pid;
            self.services.push(rec);
        }
    }

    /// Clears a service record back to a free slot (spec §3: "slot cleared (sid=0) when PAT
    /// drops the SID").
    pub fn clear(&mut self, sid: u16) {
        if let Some(slot) = self.services.iter_mut().find(|s| s.sid == sid) {
            *slot = ServiceRecord::empty();
        }
    }
}
