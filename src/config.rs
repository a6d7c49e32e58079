//! Construction-time configuration for a [`crate::context::DemuxContext`].
//!
//! Mirrors the compiled-in constants and process globals of `dvblast.h`
//! (`b_budget_mode`, `i_network_id`, `psz_network_name`, `MAX_ERRORS`, `WATCHDOG_WAIT`,
//! `MAX_EIT_RETENTION`) as a plain, independently-constructible struct rather than statics,
//! so a test can spin up any number of independent contexts (spec §9 DESIGN NOTES).

use std::time::Duration;

/// Reserved PIDs, spec §6.
pub const PAT_PID: u16 = 0x0000;
pub const NIT_PID: u16 = 0x0010;
pub const SDT_PID: u16 = 0x0011;
pub const EIT_PID: u16 = 0x0012;
pub const RST_PID: u16 = 0x0013;
pub const TDT_PID: u16 = 0x0014;
pub const PADDING_PID: u16 = 0x1FFF;
/// Sentinel meaning "no PID" (spec §6: `empty=0x2000`).
pub const EMPTY_PID: u16 = 0x2000;

/// Number of PID slots; PIDs are 13-bit (spec §3).
pub const PID_COUNT: usize = 8192;

#[derive(Debug, Clone)]
pub struct DemuxConfig {
    /// Disables per-PID `SetFilter`/`UnsetFilter` entirely; the source is told once to
    /// capture everything. `filter_refcount` bookkeeping is still maintained (spec §8).
    pub budget_mode: bool,
    /// `network_id` advertised in synthesized NIT sections (spec §4.7).
    pub network_id: u16,
    /// `network_name` descriptor payload for synthesized NIT sections.
    pub network_name: String,
    /// Transport-error-indicator threshold before a source reset is requested (spec §4.10.4).
    pub max_errors: u32,
    /// Window over which `max_errors` is counted, and quiescence period after which the
    /// counter decays (spec §4.10.4).
    pub watchdog_wait: Duration,
    /// Age after which a partially-filled EIT TS buffer is padded and flushed regardless of
    /// fill level (spec §4.7).
    pub max_eit_retention: Duration,
    /// Minimum number of bytes an EIT TS buffer must hold before a section that wouldn't fit
    /// triggers an early flush rather than further accumulation (spec §9 Open Question,
    /// resolved in SPEC_FULL.md as a config knob rather than a literal).
    pub min_section_fragment: usize,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        DemuxConfig {
            budget_mode: false,
            network_id: 0,
            network_name: String::new(),
            max_errors: 1000,
            watchdog_wait: Duration::from_secs(10),
            max_eit_retention: Duration::from_millis(500),
            min_section_fragment: 16,
        }
    }
}
