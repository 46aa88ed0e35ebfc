//! rtl_tcp client: a remote SDR reached over TCP.
//!
//! The server greets with a 12-byte frame (`RTL0`, tuner type, gain
//! count, both big-endian), accepts 5-byte command records, and then
//! streams raw interleaved IQ bytes. A stream that goes quiet past the
//! data timeout is fatal; the caller tears the process down.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use crossbeam_channel::Sender;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::Config;
use crate::decoder::ModesMessage;
use crate::demodulator::{Demodulator, MODES_DATA_LEN, MODES_OVERLAP_LEN};
use crate::network::NetError;

pub const CMD_SET_FREQUENCY: u8 = 0x01;
pub const CMD_SET_SAMPLE_RATE: u8 = 0x02;
pub const CMD_SET_GAIN_MODE: u8 = 0x03;
pub const CMD_SET_GAIN: u8 = 0x04;
pub const CMD_SET_FREQ_CORRECTION: u8 = 0x05;
pub const CMD_SET_AGC_MODE: u8 = 0x08;

/// Handshake timeout for the outbound connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest tolerated gap in the IQ stream.
const DATA_TIMEOUT: Duration = Duration::from_millis(2000);

/// Tuner identifiers from the welcome frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerType {
    Unknown,
    E4000,
    Fc0012,
    Fc0013,
    Fc2580,
    R820t,
    R828d,
}

impl TunerType {
    pub fn from_wire(value: u32) -> Self {
        match value {
            1 => TunerType::E4000,
            2 => TunerType::Fc0012,
            3 => TunerType::Fc0013,
            4 => TunerType::Fc2580,
            5 => TunerType::R820t,
            6 => TunerType::R828d,
            _ => TunerType::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TunerType::Unknown => "unknown",
            TunerType::E4000 => "E4000",
            TunerType::Fc0012 => "FC0012",
            TunerType::Fc0013 => "FC0013",
            TunerType::Fc2580 => "FC2580",
            TunerType::R820t => "R820T",
            TunerType::R828d => "R828D",
        }
    }

    /// Supported gains in tenths of dB. The welcome's tuner type picks the
    /// table; an unknown tuner gets none and falls back to auto gain.
    pub fn gain_table(&self) -> &'static [i32] {
        match self {
            TunerType::E4000 => &[
                -10, 15, 40, 65, 90, 115, 140, 165, 190, 215, 240, 290, 340, 420,
            ],
            TunerType::Fc0012 => &[-99, -40, 71, 179, 192],
            TunerType::Fc0013 => &[
                -99, -73, -65, -63, -60, -58, -54, 58, 61, 63, 65, 67, 68, 70, 71, 179, 181, 182,
                186, 188, 191, 197,
            ],
            TunerType::Fc2580 => &[0],
            TunerType::R820t | TunerType::R828d => &[
                0, 9, 14, 27, 37, 77, 87, 125, 144, 157, 166, 197, 207, 229, 254, 280, 297, 328,
                338, 364, 372, 386, 402, 421, 434, 439, 445, 480, 496,
            ],
            TunerType::Unknown => &[],
        }
    }
}

/// Parsed welcome frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Welcome {
    pub tuner: TunerType,
    pub gain_count: u32,
    pub gains: &'static [i32],
}

pub fn parse_welcome(buf: &[u8; 12]) -> Result<Welcome, NetError> {
    if &buf[..4] != b"RTL0" {
        return Err(NetError::BadWelcome);
    }
    let tuner_raw = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let gain_count = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
    let tuner = TunerType::from_wire(tuner_raw);
    Ok(Welcome {
        tuner,
        gain_count,
        gains: tuner.gain_table(),
    })
}

/// One 5-byte command record: command byte plus big-endian parameter.
pub fn command(cmd: u8, param: u32) -> [u8; 5] {
    let p = param.to_be_bytes();
    [cmd, p[0], p[1], p[2], p[3]]
}

/// Closest supported gain to the requested tenths of dB.
pub fn nearest_gain(table: &[i32], wanted: i32) -> Option<i32> {
    table.iter().copied().min_by_key(|g| (g - wanted).abs())
}

/// Connect, tune, and pump the IQ stream into the demodulator until the
/// stream dies or the channel closes.
pub async fn run_client(
    config: Config,
    demodulator: Arc<Demodulator>,
    tx: Sender<ModesMessage>,
) -> Result<(), NetError> {
    let addr = config
        .rtl_tcp
        .clone()
        .ok_or_else(|| NetError::Config("no rtl_tcp host configured".into()))?;

    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| NetError::ConnectTimeout(addr.clone()))?
        .map_err(|e| NetError::Connect(addr.clone(), e))?;

    let mut welcome_buf = [0u8; 12];
    timeout(DATA_TIMEOUT, stream.read_exact(&mut welcome_buf))
        .await
        .map_err(|_| NetError::DataTimeout(addr.clone()))?
        .map_err(|e| NetError::Io(e))?;
    let welcome = parse_welcome(&welcome_buf)?;
    info!(
        "rtl_tcp {}: tuner {} with {} gains",
        addr,
        welcome.tuner.name(),
        welcome.gain_count
    );

    // Tune before the server starts flooding IQ data.
    stream
        .write_all(&command(CMD_SET_SAMPLE_RATE, config.sample_rate))
        .await
        .map_err(NetError::Io)?;
    stream
        .write_all(&command(CMD_SET_FREQUENCY, config.freq))
        .await
        .map_err(NetError::Io)?;
    stream
        .write_all(&command(CMD_SET_FREQ_CORRECTION, config.freq_correction as u32))
        .await
        .map_err(NetError::Io)?;

    if config.gain < 0 || welcome.gains.is_empty() {
        if config.gain >= 0 {
            warn!(
                "rtl_tcp {}: unknown tuner, falling back to auto gain",
                addr
            );
        }
        stream
            .write_all(&command(CMD_SET_GAIN_MODE, 0))
            .await
            .map_err(NetError::Io)?;
    } else {
        let wanted = if config.gain == crate::config::GAIN_MAX {
            *welcome.gains.last().unwrap_or(&0)
        } else {
            nearest_gain(welcome.gains, config.gain).unwrap_or(0)
        };
        stream
            .write_all(&command(CMD_SET_GAIN_MODE, 1))
            .await
            .map_err(NetError::Io)?;
        stream
            .write_all(&command(CMD_SET_GAIN, wanted as u32))
            .await
            .map_err(NetError::Io)?;
    }
    if config.enable_agc {
        stream
            .write_all(&command(CMD_SET_AGC_MODE, 1))
            .await
            .map_err(NetError::Io)?;
    }

    // Acquisition loop with the usual boundary overlap.
    let mut data = vec![127u8; MODES_OVERLAP_LEN + MODES_DATA_LEN];
    let mut pending = BytesMut::with_capacity(MODES_DATA_LEN);
    let mut chunk = vec![0u8; 64 * 1024];

    loop {
        let n = timeout(DATA_TIMEOUT, stream.read(&mut chunk))
            .await
            .map_err(|_| NetError::DataTimeout(addr.clone()))?
            .map_err(NetError::Io)?;
        if n == 0 {
            return Err(NetError::StreamClosed(addr));
        }
        pending.extend_from_slice(&chunk[..n]);

        while pending.len() >= MODES_DATA_LEN {
            let batch = pending.split_to(MODES_DATA_LEN);
            data.copy_within(MODES_DATA_LEN.., 0);
            data[MODES_OVERLAP_LEN..].copy_from_slice(&batch);
            demodulator.process_iq(&data, &tx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welcome_r820t() {
        let buf = [
            0x52, 0x54, 0x4C, 0x30, 0x00, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x1D,
        ];
        let w = parse_welcome(&buf).unwrap();
        assert_eq!(w.tuner, TunerType::R820t);
        assert_eq!(w.gain_count, 29);
        assert_eq!(w.gains.len(), 29);
        assert_eq!(w.gains.first(), Some(&0));
        assert_eq!(w.gains.last(), Some(&496));
    }

    #[test]
    fn welcome_rejects_bad_magic() {
        let buf = [0u8; 12];
        assert!(parse_welcome(&buf).is_err());
    }

    #[test]
    fn unknown_tuner_has_no_gain_table() {
        let buf = [
            0x52, 0x54, 0x4C, 0x30, 0x00, 0x00, 0x00, 0x63, 0x00, 0x00, 0x00, 0x00,
        ];
        let w = parse_welcome(&buf).unwrap();
        assert_eq!(w.tuner, TunerType::Unknown);
        assert!(w.gains.is_empty());
    }

    #[test]
    fn command_encoding_is_big_endian() {
        assert_eq!(
            command(CMD_SET_SAMPLE_RATE, 2_000_000),
            [0x02, 0x00, 0x1E, 0x84, 0x80]
        );
        assert_eq!(
            command(CMD_SET_FREQUENCY, 1_090_000_000),
            [0x01, 0x40, 0xF8, 0x14, 0x80]
        );
        assert_eq!(command(CMD_SET_GAIN_MODE, 1), [0x03, 0, 0, 0, 1]);
    }

    #[test]
    fn nearest_gain_picks_closest() {
        let table = TunerType::R820t.gain_table();
        assert_eq!(nearest_gain(table, 0), Some(0));
        assert_eq!(nearest_gain(table, 400), Some(402));
        assert_eq!(nearest_gain(table, 1000), Some(496));
        assert_eq!(nearest_gain(&[], 100), None);
    }

    #[test]
    fn r828d_shares_the_r820t_table() {
        assert_eq!(
            TunerType::R828d.gain_table(),
            TunerType::R820t.gain_table()
        );
    }
}
