//! Receiver statistics.
//!
//! Counters are plain relaxed atomics so the demodulation thread, the
//! network ingest tasks and the HTTP snapshot code can all touch them
//! without coordination.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::crc::Fix;
use crate::decoder::ModesMessage;

#[derive(Default)]
pub struct Stats {
    /// Preambles that passed the pattern and quiet-zone gates.
    pub valid_preambles: AtomicU64,
    /// Candidate frames sliced out of the magnitude stream.
    pub demodulated: AtomicU64,
    /// Frames accepted with a clean or repaired checksum.
    pub good_crc: AtomicU64,
    /// Frames dropped on checksum failure.
    pub bad_crc: AtomicU64,
    /// Single-bit CRC repairs.
    pub single_bit_fixed: AtomicU64,
    /// Two-bit CRC repairs (aggressive mode).
    pub two_bit_fixed: AtomicU64,
    /// Frames recovered only after the phase-correction retry.
    pub phase_corrected: AtomicU64,
    /// Candidates discarded for being out of phase beyond repair.
    pub out_of_phase: AtomicU64,
    /// AP-XOR frames accepted via the ICAO cache.
    pub icao_cache_hits: AtomicU64,
    /// AP-XOR frames dropped because the address was unknown.
    pub icao_cache_misses: AtomicU64,

    /// Well-formed RAW lines ingested (heart-beats included).
    pub raw_good: AtomicU64,
    /// Empty or whitespace-only RAW lines.
    pub raw_empty: AtomicU64,
    /// RAW lines that failed the `*hex;` grammar.
    pub raw_unrecognized: AtomicU64,
    /// SBS `MSG,` records parsed.
    pub sbs_msg: AtomicU64,
    /// SBS records of other known types (SEL/ID/AIR/STA/CLK), counted only.
    pub sbs_other: AtomicU64,
    /// SBS lines that matched no known record type.
    pub sbs_unrecognized: AtomicU64,

    /// Total messages that reached the aircraft registry.
    pub messages: AtomicU64,
    /// Network accepts refused by the deny list.
    pub denied_accepts: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Record the CRC outcome of one decoded frame, wherever it came from.
pub fn account_frame(stats: &Stats, mm: &ModesMessage) {
    if mm.crc_ok {
        Stats::bump(&stats.good_crc);
        match mm.fix {
            Fix::None => {}
            Fix::Single(_) => Stats::bump(&stats.single_bit_fixed),
            Fix::Double(..) => Stats::bump(&stats.two_bit_fixed),
        }
        if !mm.address_in_frame() {
            Stats::bump(&stats.icao_cache_hits);
        }
    } else if mm.address_in_frame() {
        Stats::bump(&stats.bad_crc);
    } else {
        Stats::bump(&stats.icao_cache_misses);
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = Stats::get;
        writeln!(f, "Statistics:")?;
        writeln!(f, "  valid preambles     : {}", g(&self.valid_preambles))?;
        writeln!(f, "  demodulated frames  : {}", g(&self.demodulated))?;
        writeln!(f, "  good CRC            : {}", g(&self.good_crc))?;
        writeln!(f, "  bad CRC             : {}", g(&self.bad_crc))?;
        writeln!(f, "  single-bit repairs  : {}", g(&self.single_bit_fixed))?;
        writeln!(f, "  two-bit repairs     : {}", g(&self.two_bit_fixed))?;
        writeln!(f, "  phase corrected     : {}", g(&self.phase_corrected))?;
        writeln!(f, "  out of phase        : {}", g(&self.out_of_phase))?;
        writeln!(f, "  ICAO cache hits     : {}", g(&self.icao_cache_hits))?;
        writeln!(f, "  ICAO cache misses   : {}", g(&self.icao_cache_misses))?;
        writeln!(f, "  RAW lines good      : {}", g(&self.raw_good))?;
        writeln!(f, "  RAW lines empty     : {}", g(&self.raw_empty))?;
        writeln!(f, "  RAW unrecognized    : {}", g(&self.raw_unrecognized))?;
        writeln!(f, "  SBS MSG records     : {}", g(&self.sbs_msg))?;
        writeln!(f, "  SBS other records   : {}", g(&self.sbs_other))?;
        writeln!(f, "  SBS unrecognized    : {}", g(&self.sbs_unrecognized))?;
        writeln!(f, "  registry messages   : {}", g(&self.messages))?;
        write!(f, "  denied accepts      : {}", g(&self.denied_accepts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::new();
        Stats::bump(&stats.raw_good);
        Stats::bump(&stats.raw_good);
        Stats::add(&stats.raw_good, 3);
        assert_eq!(Stats::get(&stats.raw_good), 5);
        assert_eq!(Stats::get(&stats.raw_empty), 0);
    }

    #[test]
    fn display_mentions_every_family() {
        let stats = Stats::new();
        let text = stats.to_string();
        assert!(text.contains("good CRC"));
        assert!(text.contains("RAW lines good"));
        assert!(text.contains("SBS MSG records"));
    }
}
