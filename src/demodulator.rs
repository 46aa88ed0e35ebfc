//! Pulse-position demodulation of Mode S replies.
//!
//! Scans a magnitude stream for the 8 µs preamble, slices the 1 µs bit
//! cells into a candidate frame, and hands CRC-accepted frames to the
//! decode channel. Weak candidates get one retry after a phase-correction
//! pass over a scratch copy of the window.

use std::fs::File;
use std::io::{BufReader, Read};
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::debug;

use crate::config::Config;
use crate::decoder::{self, MODES_LONG_MSG_BITS, ModesMessage};
use crate::icao::IcaoCache;
use crate::magnitude::{MagnitudeLut, compute_magnitude_vector};
use crate::stats::{self, Stats};

/// Preamble duration in microseconds (2 samples per µs).
pub const MODES_PREAMBLE_US: usize = 8;
/// Preamble plus longest message, in microseconds.
pub const MODES_FULL_LEN: usize = MODES_PREAMBLE_US + MODES_LONG_MSG_BITS;
/// IQ bytes read per acquisition batch.
pub const MODES_DATA_LEN: usize = 16 * 16384;
/// IQ bytes carried over between batches so frames that straddle a batch
/// boundary still demodulate.
pub const MODES_OVERLAP_LEN: usize = (MODES_FULL_LEN - 1) * 4;

/// Bit cell value marking an unreadable sample pair.
const BIT_ERROR: u8 = 2;

pub struct Demodulator {
    config: Config,
    pub mag_lut: MagnitudeLut,
    cache: Arc<IcaoCache>,
    stats: Arc<Stats>,
}

impl Demodulator {
    pub fn new(config: Config, cache: Arc<IcaoCache>, stats: Arc<Stats>) -> Self {
        Self {
            config,
            mag_lut: MagnitudeLut::new(),
            cache,
            stats,
        }
    }

    /// Feed a batch of interleaved IQ bytes through the pipeline.
    pub fn process_iq(&self, data: &[u8], tx: &Sender<ModesMessage>) {
        let magnitude = compute_magnitude_vector(data, &self.mag_lut);
        self.detect_modes(&magnitude, tx);
    }

    /// Replay IQ samples from a file (or stdin with `-`).
    pub fn process_file(&self, filename: &str, tx: &Sender<ModesMessage>) -> std::io::Result<()> {
        let input: Box<dyn Read> = if filename == "-" {
            Box::new(std::io::stdin())
        } else {
            Box::new(File::open(filename)?)
        };
        let mut reader = BufReader::with_capacity(MODES_DATA_LEN, input);

        let mut data = vec![127u8; MODES_OVERLAP_LEN + MODES_DATA_LEN];

        loop {
            data.copy_within(MODES_DATA_LEN.., 0);

            let mut filled = 0;
            while filled < MODES_DATA_LEN {
                match reader.read(&mut data[MODES_OVERLAP_LEN + filled..])? {
                    0 => break,
                    n => filled += n,
                }
            }

            if filled == 0 {
                if self.config.loop_file && filename != "-" {
                    reader = BufReader::with_capacity(MODES_DATA_LEN, Box::new(File::open(filename)?));
                    debug!("looping input file");
                    continue;
                }
                break;
            }

            if filled < MODES_DATA_LEN {
                // DC-pad the tail so the last frames still slice cleanly.
                data[MODES_OVERLAP_LEN + filled..].fill(127);
            }

            self.process_iq(&data[..MODES_OVERLAP_LEN + filled], tx);
        }
        Ok(())
    }

    /// Scan a magnitude buffer for frames.
    pub fn detect_modes(&self, m: &[u16], tx: &Sender<ModesMessage>) {
        let mlen = m.len();
        if mlen < MODES_FULL_LEN * 2 {
            return;
        }

        let mut j = 0;
        while j < mlen - MODES_FULL_LEN * 2 {
            if !preamble_at(m, j) {
                j += 1;
                continue;
            }

            // Reference level from the four preamble spikes; the gaps and
            // the quiet zone before the data must stay below it.
            let high =
                ((m[j] as u32 + m[j + 2] as u32 + m[j + 7] as u32 + m[j + 9] as u32) / 6) as u16;
            if m[j + 4] >= high || m[j + 5] >= high {
                j += 1;
                continue;
            }
            if m[j + 11] >= high || m[j + 12] >= high || m[j + 13] >= high || m[j + 14] >= high {
                j += 1;
                continue;
            }

            Stats::bump(&self.stats.valid_preambles);
            let signal_power = preamble_power(m, j);

            let mut correction_window: Vec<u16>;

            for attempt in 0..2u8 {
                let (window, start): (&[u16], usize) = if attempt == 0 {
                    (m, j)
                } else {
                    if detect_out_of_phase(m, j) == 0 {
                        break;
                    }
                    Stats::bump(&self.stats.out_of_phase);
                    let end = (j + (MODES_FULL_LEN + 1) * 2).min(mlen);
                    correction_window = m[j..end].to_vec();
                    apply_phase_correction(&mut correction_window);
                    (correction_window.as_slice(), 0)
                };

                let (bits, errors) = slice_bits(window, start);
                let msg = pack_bits(&bits);

                let msg_bits = decoder::message_len_by_type(msg[0] >> 3);
                let msg_len = msg_bits / 8;

                // Too many unreadable cells in the critical half.
                if !(errors == 0 || (self.config.aggressive && errors < 3)) {
                    continue;
                }

                // Mean sample delta across the frame; pure noise reads flat.
                let mut delta = 0u32;
                for i in (0..msg_len * 8 * 2).step_by(2) {
                    let a = window[start + i + MODES_PREAMBLE_US * 2] as i32;
                    let b = window[start + i + MODES_PREAMBLE_US * 2 + 1] as i32;
                    delta += (a - b).unsigned_abs();
                }
                if delta / (msg_len as u32 * 4) < 10 * 255 / 256 {
                    break;
                }

                if attempt == 0 {
                    Stats::bump(&self.stats.demodulated);
                }

                let mut mm = decoder::decode_modes_message(
                    &msg[..msg_len],
                    self.config.fix_errors,
                    self.config.aggressive,
                    &self.cache,
                );
                mm.signal_power = signal_power;
                mm.phase_corrected = attempt == 1;

                stats::account_frame(&self.stats, &mm);
                if mm.crc_ok || !self.config.check_crc {
                    if attempt == 1 {
                        Stats::bump(&self.stats.phase_corrected);
                    }
                    j += (MODES_PREAMBLE_US + msg_len * 8) * 2 - 1;
                    let _ = tx.send(mm);
                    break;
                }
            }

            j += 1;
        }
    }

}

/// The 10-sample preamble shape: spikes at 0, 2, 7, 9 with valleys between.
fn preamble_at(m: &[u16], j: usize) -> bool {
    m[j] > m[j + 1]
        && m[j + 1] < m[j + 2]
        && m[j + 2] > m[j + 3]
        && m[j + 3] < m[j]
        && m[j + 4] < m[j]
        && m[j + 5] < m[j]
        && m[j + 6] < m[j]
        && m[j + 7] > m[j + 8]
        && m[j + 8] < m[j + 9]
        && m[j + 9] > m[j + 6]
}

/// Mean spike magnitude mapped to the unit interval (squared, so it reads
/// as relative power).
fn preamble_power(m: &[u16], j: usize) -> f32 {
    let sum = m[j] as f32 + m[j + 2] as f32 + m[j + 7] as f32 + m[j + 9] as f32;
    let mean = sum / 4.0 / 65535.0;
    mean * mean
}

/// Slice 112 bit cells starting after the preamble at `j`.
///
/// Near-equal sample pairs inherit the previous bit; exactly equal pairs
/// are marked unreadable and counted when they fall in the first 56 bits
/// (the half every frame length shares).
fn slice_bits(m: &[u16], j: usize) -> ([u8; MODES_LONG_MSG_BITS], u32) {
    let mut bits = [0u8; MODES_LONG_MSG_BITS];
    let mut errors = 0u32;

    for i in (0..MODES_LONG_MSG_BITS * 2).step_by(2) {
        let low = m[j + i + MODES_PREAMBLE_US * 2];
        let high = m[j + i + MODES_PREAMBLE_US * 2 + 1];
        let delta = (low as i32 - high as i32).unsigned_abs();
        let k = i / 2;

        if k > 0 && delta < 256 {
            bits[k] = bits[k - 1];
        } else if low == high {
            bits[k] = BIT_ERROR;
            if k < MODES_LONG_MSG_BITS / 2 {
                errors += 1;
            }
        } else if low > high {
            bits[k] = 1;
        } else {
            bits[k] = 0;
        }
    }

    (bits, errors)
}

/// MSB-first packing; unreadable cells pack as zero and are left to the
/// CRC to reject or repair.
fn pack_bits(bits: &[u8; MODES_LONG_MSG_BITS]) -> [u8; 14] {
    let mut msg = [0u8; 14];
    for (i, byte) in msg.iter_mut().enumerate() {
        for b in 0..8 {
            let bit = bits[i * 8 + b];
            if bit == 1 {
                *byte |= 1 << (7 - b);
            }
        }
    }
    msg
}

/// Heuristic for a half-sample timing offset: energy bleeding into what
/// should be quiet preamble cells. Positive means sampling late, negative
/// early, zero in phase.
fn detect_out_of_phase(m: &[u16], j: usize) -> i32 {
    if m[j + 3] > m[j + 2] / 3 {
        return 1;
    }
    if m[j + 10] > m[j + 9] / 3 {
        return 1;
    }
    if m[j + 6] > m[j + 7] / 3 {
        return -1;
    }
    if j > 0 && m[j - 1] > m[j + 1] / 3 {
        return -1;
    }
    0
}

/// Redistribute energy between adjacent cells on a scratch window whose
/// preamble starts at index 0: after a 1 the following cell absorbed part
/// of the pulse, after a 0 it lost some.
fn apply_phase_correction(window: &mut [u16]) {
    let data = &mut window[MODES_PREAMBLE_US * 2..];
    for k in (0..(MODES_LONG_MSG_BITS - 1) * 2).step_by(2) {
        if k + 2 >= data.len() {
            break;
        }
        if data[k] > data[k + 1] {
            data[k + 2] = ((data[k + 2] as u32 * 5) / 4).min(u16::MAX as u32) as u16;
        } else {
            data[k + 2] = ((data[k + 2] as u32 * 4) / 5) as u16;
        }
    }
}
