//! The output record (spec §3): caller-set selection configuration plus the PSI/PCR/error
//! state the demux core owns and mutates.
//!
//! Grounded on `output_t` in `original_source/dvblast.h`.

/// Identifies one output within a [`crate::context::DemuxContext`]; stable across the
/// output's lifetime (an index into the context's output table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(pub usize);

/// Caller-set selection configuration, mutated only through
/// [`crate::context::DemuxContext::change`] (spec §4.11 `demux_Change`).
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// `0` means raw/passthrough mode: all 8192 PIDs pass through unchanged, no PSI
    /// regeneration (spec §8 "On SID==0 output").
    pub sid: u16,
    /// Explicit user-selected PIDs. Empty means auto-select from the service's PMT (spec
    /// §4.1 `SelectPID`/`UnselectPID`: "Outputs with explicit pid_list are untouched").
    pub pid_list: Vec<u16>,
    pub tsid: u16,
    /// If set, `tsid` is pinned and does not follow `UpdateTSID` (spec §4.4).
    pub fixed_tsid: bool,
    /// `OUTPUT_WATCH`: per-output descrambling health monitoring is active (spec §4.10.7).
    pub watch: bool,
    /// `OUTPUT_DVB`: DVB conformance tables (SDT/NIT/EIT) are inserted (spec §4.6, §4.7).
    pub dvb: bool,
    /// `OUTPUT_EPG`: EIT schedule tables (not just present/following) are forwarded (spec
    /// §4.7).
    pub epg: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            sid: 0,
            pid_list: Vec::new(),
            tsid: 0,
            fixed_tsid: false,
            watch: false,
            dvb: false,
            epg: false,
        }
    }
}

/// One output's last-generated section plus its independent version and continuity
/// counters (spec §3: "monotonically increasing version counters and independent continuity
/// counters for each").
#[derive(Debug, Clone, Default)]
pub struct GeneratedSection {
    pub bytes: Option<Vec<u8>>,
    pub version: u8,
    pub cc: u8,
}

impl GeneratedSection {
    /// The version number a freshly-built replacement for this section should carry: `0` if
    /// nothing has been installed yet, otherwise the current version plus one (wrapping at 5
    /// bits, the field width of `version_number` in a PSI syntax header). The caller bakes
    /// this into the section bytes before calling [`GeneratedSection::install`], since the
    /// version is part of the signed/CRC'd wire content, not metadata layered on top of it.
    pub fn next_version(&self) -> u8 {
        if self.bytes.is_none() {
            0
        } else {
            (self.version + 1) & 0x1F
        }
    }

    /// Installs newly-built section bytes already encoded with `version` (spec §4.8: "a small
    /// builder produces a single-section byte buffer with an incremented version counter").
    pub fn install(&mut self, bytes: Vec<u8>, version: u8) {
        self.bytes = Some(bytes);
        self.version = version;
    }

    pub fn clear(&mut self) {
        self.bytes = None;
    }
}

/// `(stream_timestamp, wallclock_timestamp)` last observed on an output's PCR PID (spec §3).
#[derive(Debug, Clone, Copy)]
pub struct PcrAnchor {
    pub stream_timestamp: u64,
    pub wallclock_timestamp: i64,
}

/// The full output record (spec §3). The core mutates only the PSI-related fields,
/// `pcr_anchor`, and the error counters; `config` is mutated only via `demux_Change`.
#[derive(Debug, Clone)]
pub struct Output {
    pub config: OutputConfig,

    pub pat: GeneratedSection,
    pub pmt: GeneratedSection,
    pub nit: GeneratedSection,
    pub sdt: GeneratedSection,

    /// Partially-filled TS packet accumulating EIT section fragments (spec §4.7).
    pub eit_ts_buffer: Vec<u8>,
    pub eit_ts_offset: usize,
    pub eit_cc: u8,
    /// Wallclock time the current `eit_ts_buffer` was first opened, for the
    /// `MAX_EIT_RETENTION` age-out (spec §4.7, §8).
    pub eit_buffer_opened_at: Option<i64>,

    pub pcr_anchor: Option<PcrAnchor>,

    /// Per-output watchdog (spec §3, §4.10.7, §7 kind 4).
    pub error_counter: u32,
    pub last_error_wallclock: Option<i64>,
}

impl Output {
    pub fn new(config: OutputConfig) -> Output {
        Output {
            config,
            pat: GeneratedSection::default(),
            pmt: GeneratedSection::default(),
            nit: GeneratedSection::default(),
            sdt: GeneratedSection::default(),
            eit_ts_buffer: Vec::new(),
            eit_ts_offset: 0,
            eit_cc: 0,
            eit_buffer_opened_at: None,
            pcr_anchor: None,
            error_counter: 0,
            last_error_wallclock: None,
        }
    }

    /// Raw/passthrough mode: spec §3 "`sid` (0 = passthrough/raw)".
    pub fn is_passthrough(&self) -> bool {
        self.config.sid == 0
    }

    /// Auto-selection mode for PID subscription: spec §4.1 "whose explicit pid_list is
    /// empty (auto-selection mode)".
    pub fn is_auto_select(&self) -> bool {
        self.config.pid_list.is_empty()
    }
}
