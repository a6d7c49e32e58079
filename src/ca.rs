//! The conditional-access (CAM descrambler) coordination contract (spec §1, §6). Out of
//! scope for this crate is the CAM/descrambler itself — only the narrow notification
//! surface the demux core drives.

/// The information a CA coordinator needs about a service's PMT to (de)provision
/// descrambling, mirroring what dvblast's CAM interaction passes as a raw PMT section.
#[derive(Debug, Clone)]
pub struct CaPmtInfo {
    pub sid: u16,
    pub pmt_pid: u16,
    /// The full PMT section bytes, as last accepted (spec §4.5).
    pub pmt_section: Vec<u8>,
}

/// Notified of PMT add/update/delete for services that need descrambling and are currently
/// selected by at least one output (spec §4.4, §4.5).
pub trait CaCoordinator {
    /// A selected service just started needing descrambling.
    fn add_pmt(&mut self, pmt: &CaPmtInfo);

    /// A selected, already-descrambled service's PMT changed in a way CA must re-provision
    /// (ES set, CA descriptor contents).
    fn update_pmt(&mut self, pmt: &CaPmtInfo);

    /// A service stopped needing descrambling, or was dropped from the PAT, or is no longer
    /// selected.
    fn delete_pmt(&mut self, pmt: &CaPmtInfo);

    /// Requested after a per-output descrambling-health watchdog trips (spec §4.10.7, §7
    /// kind 4).
    fn reset(&mut self);
}
