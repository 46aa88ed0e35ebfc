//! Mode S message decoding.
//!
//! Turns a validated bit stream into a typed [`ModesMessage`] with the
//! DF-specific fields unpacked. Frames whose parity field is XORed with
//! the transmitter address are only accepted when the recovered address
//! was recently seen in a self-checking frame (see [`crate::icao`]).

use std::fmt;

use crate::crc::{self, Fix, extract_crc, modes_checksum};
use crate::icao::IcaoCache;

pub const MODES_LONG_MSG_BITS: usize = 112;
pub const MODES_SHORT_MSG_BITS: usize = 56;
pub const MODES_LONG_MSG_BYTES: usize = 14;
#[allow(dead_code)]
pub const MODES_SHORT_MSG_BYTES: usize = 7;

/// Unit tag for decoded altitudes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AltitudeUnit {
    #[default]
    Feet,
    /// Metric altitude reporting (M bit set). Kept as the raw field value;
    /// no aircraft in the wild is known to use it.
    Meters,
}

/// Character set for the 6-bit flight identification encoding.
const AIS_CHARSET: &[u8; 64] = b"?ABCDEFGHIJKLMNOPQRSTUVWXYZ????? ???????????????0123456789??????";

/// Comm-B register content recovered from the MB field of DF20/21.
///
/// The downlink does not say which register a reply carries; registers
/// with a BDS signature byte are matched on it, the rest are probed with
/// plausibility gates and may occasionally misidentify.
#[derive(Debug, Clone, PartialEq)]
pub enum CommB {
    /// BDS 1,0
    DataLinkCapability { continuation: bool, overlay: bool },
    /// BDS 2,0
    AircraftIdent { callsign: String },
    /// BDS 3,0
    AcasAdvisory { ara: u16, rac: u8, rat: bool, mte: bool },
    /// BDS 4,0
    SelectedIntent {
        mcp_altitude: Option<u32>,
        fms_altitude: Option<u32>,
        baro_setting: Option<f32>,
        vnav: bool,
        alt_hold: bool,
        approach: bool,
    },
    /// BDS 5,0
    TrackAndTurn {
        roll_angle: Option<f32>,
        true_track: Option<f32>,
        ground_speed: Option<u16>,
        track_rate: Option<f32>,
        true_airspeed: Option<u16>,
    },
    /// BDS 6,0
    HeadingAndSpeed {
        magnetic_heading: Option<f32>,
        indicated_airspeed: Option<u16>,
        mach: Option<f32>,
        baro_rate: Option<i32>,
        inertial_rate: Option<i32>,
    },
}

/// A decoded Mode S frame.
#[derive(Debug, Clone, Default)]
pub struct ModesMessage {
    /// Raw frame bytes, possibly CRC-repaired.
    pub msg: [u8; MODES_LONG_MSG_BYTES],
    /// 56 or 112.
    pub msg_bits: usize,
    /// Downlink format, bits 1-5.
    pub msg_type: u8,
    /// Checksum stored in the trailing three bytes.
    pub crc: u32,
    /// Checksum computed over the frame.
    pub crc_computed: u32,
    /// Frame accepted: clean CRC, repaired CRC, or ICAO-cache validation.
    pub crc_ok: bool,
    /// Which bits, if any, error recovery flipped.
    pub fix: Fix,
    /// Announced (or recovered) 24-bit address.
    pub aa: [u8; 3],
    /// Transponder capability (DF11/DF17).
    pub ca: u8,
    /// Flight status (DF4/5/20/21).
    pub fs: u8,
    /// Downlink request.
    pub dr: u8,
    /// Utility message.
    pub um: u8,
    /// Squawk as a 4-decimal-digit number (each digit octal).
    pub identity: u16,
    pub altitude: i32,
    pub unit: AltitudeUnit,
    /// Extended squitter type / subtype (DF17).
    pub me_type: u8,
    pub me_sub: u8,
    /// Flight identification, trailing spaces trimmed (ME 1..4).
    pub flight: String,
    /// Emitter category within the identification type.
    pub aircraft_category: u8,
    /// CPR format flag: false = even, true = odd.
    pub fflag: bool,
    /// UTC synchronization flag.
    pub tflag: bool,
    /// Raw 17-bit CPR fields (ME 9..18).
    pub raw_latitude: u32,
    pub raw_longitude: u32,
    /// Velocity components (ME 19 subtype 1..2).
    pub ew_dir: u8,
    pub ew_velocity: u16,
    pub ns_dir: u8,
    pub ns_velocity: u16,
    pub vert_rate_source: u8,
    pub vert_rate_sign: u8,
    pub vert_rate: u16,
    /// Ground speed in knots, derived from the EW/NS components.
    pub velocity: u16,
    /// Track in degrees 0..360.
    pub heading: f64,
    pub heading_is_valid: bool,
    /// Recovered Comm-B register (DF20/21).
    pub comm_b: Option<CommB>,
    /// Preamble power estimate in the unit interval.
    pub signal_power: f32,
    /// Set when the frame only decoded after the phase-correction retry.
    pub phase_corrected: bool,
}

impl ModesMessage {
    pub fn icao_address(&self) -> u32 {
        ((self.aa[0] as u32) << 16) | ((self.aa[1] as u32) << 8) | (self.aa[2] as u32)
    }

    /// `*HEX;` line for the RAW protocol (newline added by the writer).
    pub fn to_raw_string(&self) -> String {
        let bytes = self.msg_bits / 8;
        let mut s = String::with_capacity(bytes * 2 + 2);
        s.push('*');
        for b in &self.msg[..bytes] {
            use std::fmt::Write;
            let _ = write!(s, "{:02X}", b);
        }
        s.push(';');
        s
    }

    /// Vertical rate in ft/min for velocity messages; zero raw value means
    /// "no information".
    pub fn vertical_rate(&self) -> Option<i32> {
        if self.msg_type == 17 && self.me_type == 19 && (self.me_sub == 1 || self.me_sub == 2) {
            if self.vert_rate == 0 {
                return None;
            }
            let sign = if self.vert_rate_sign == 0 { 1 } else { -1 };
            Some(sign * 64 * (self.vert_rate as i32 - 1))
        } else {
            None
        }
    }

    /// True for the downlink formats that carry their address in the clear.
    pub fn address_in_frame(&self) -> bool {
        matches!(self.msg_type, 11 | 17 | 18)
    }

    /// Alert / emergency / SPI / on-ground flags for the SBS output,
    /// derived from flight status and the reserved squawk codes.
    pub fn status_flags(&self) -> (bool, bool, bool, bool) {
        let emergency = matches!(self.identity, 7500 | 7600 | 7700);
        let ground = self.fs == 1 || self.fs == 3;
        let alert = matches!(self.fs, 2 | 3 | 4);
        let spi = self.fs == 4 || self.fs == 5;
        (alert, emergency, spi, ground)
    }
}

/// Frame length in bits for a downlink format.
pub fn message_len_by_type(df: u8) -> usize {
    match df {
        16 | 17 | 19 | 20 | 21 => MODES_LONG_MSG_BITS,
        _ => MODES_SHORT_MSG_BITS,
    }
}

/// Decode a raw frame.
///
/// DF11/DF17 get single-bit repair when `fix_errors` is set and two-bit
/// repair (DF17 only) when `aggressive` is also set; accepted frames seed
/// the ICAO cache. Address-XOR-parity formats recover the address by XOR
/// and are accepted only on a cache hit.
pub fn decode_modes_message(
    raw: &[u8],
    fix_errors: bool,
    aggressive: bool,
    cache: &IcaoCache,
) -> ModesMessage {
    let mut mm = ModesMessage::default();

    let len = raw.len().min(MODES_LONG_MSG_BYTES);
    mm.msg[..len].copy_from_slice(&raw[..len]);

    mm.msg_type = mm.msg[0] >> 3;
    mm.msg_bits = message_len_by_type(mm.msg_type);

    mm.crc = extract_crc(&mm.msg, mm.msg_bits);
    mm.crc_computed = modes_checksum(&mm.msg, mm.msg_bits);

    if matches!(mm.msg_type, 11 | 17 | 18) {
        mm.crc_ok = mm.crc == mm.crc_computed;

        if !mm.crc_ok && fix_errors && (mm.msg_type == 11 || mm.msg_type == 17) {
            if let Some(bit) = crc::fix_single_bit(&mut mm.msg, mm.msg_bits) {
                mm.fix = Fix::Single(bit);
                mm.crc = extract_crc(&mm.msg, mm.msg_bits);
                mm.crc_computed = modes_checksum(&mm.msg, mm.msg_bits);
                mm.crc_ok = true;
            } else if aggressive && mm.msg_type == 17 {
                if let Some((a, b)) = crc::fix_two_bits(&mut mm.msg, mm.msg_bits) {
                    mm.fix = Fix::Double(a, b);
                    mm.crc = extract_crc(&mm.msg, mm.msg_bits);
                    mm.crc_computed = modes_checksum(&mm.msg, mm.msg_bits);
                    mm.crc_ok = true;
                }
            }
        }

        mm.aa = [mm.msg[1], mm.msg[2], mm.msg[3]];

        // Only untouched DF11/DF17 frames vouch for their address.
        if mm.crc_ok && mm.fix.is_none() && (mm.msg_type == 11 || mm.msg_type == 17) {
            let addr = mm.icao_address();
            if addr != 0 {
                cache.insert(addr);
            }
        }
    } else {
        // DF0/4/5/16/20/21/24: the parity field is address XOR checksum.
        let recovered = mm.crc_computed ^ mm.crc;
        mm.aa = [
            ((recovered >> 16) & 0xFF) as u8,
            ((recovered >> 8) & 0xFF) as u8,
            (recovered & 0xFF) as u8,
        ];
        mm.crc_ok = recovered != 0 && cache.contains(recovered);
    }

    mm.ca = mm.msg[0] & 0x07;
    mm.fs = mm.msg[0] & 0x07;
    mm.dr = (mm.msg[1] >> 3) & 0x1F;
    mm.um = ((mm.msg[1] & 0x07) << 3) | (mm.msg[2] >> 5);

    if mm.msg_type == 5 || mm.msg_type == 21 {
        mm.identity = decode_identity(&mm.msg);
    }

    if matches!(mm.msg_type, 0 | 4 | 16 | 20) {
        mm.altitude = decode_ac13_field(&mm.msg, &mut mm.unit);
    }

    if mm.msg_type == 17 {
        decode_extended_squitter(&mut mm);
    }

    if mm.msg_type == 20 || mm.msg_type == 21 {
        mm.comm_b = decode_comm_b(&mm.msg);
    }

    mm
}

/// Read `len` bits starting at 1-based position `start` of the MB field.
fn mb_bits(mb: &[u8], start: u32, len: u32) -> u32 {
    let mut value = 0u32;
    for i in 0..len {
        let bit = start - 1 + i;
        let mask = 0x80 >> (bit % 8);
        value = (value << 1) | u32::from(mb[(bit / 8) as usize] & mask != 0);
    }
    value
}

/// Two's-complement field: sign at `sign_bit`, magnitude following it.
fn mb_signed(mb: &[u8], sign_bit: u32, len: u32) -> i32 {
    let mag = mb_bits(mb, sign_bit + 1, len) as i32;
    if mb_bits(mb, sign_bit, 1) != 0 {
        mag - (1 << len)
    } else {
        mag
    }
}

fn decode_comm_b(msg: &[u8]) -> Option<CommB> {
    let mb = &msg[4..11];
    try_bds10(mb)
        .or_else(|| try_bds20(mb))
        .or_else(|| try_bds30(mb))
        .or_else(|| try_bds50(mb))
        .or_else(|| try_bds60(mb))
        .or_else(|| try_bds40(mb))
}

fn try_bds10(mb: &[u8]) -> Option<CommB> {
    if mb[0] != 0x10 {
        return None;
    }
    Some(CommB::DataLinkCapability {
        continuation: mb_bits(mb, 9, 1) != 0,
        overlay: mb_bits(mb, 16, 1) != 0,
    })
}

fn try_bds20(mb: &[u8]) -> Option<CommB> {
    if mb[0] != 0x20 {
        return None;
    }
    let mut callsign = String::with_capacity(8);
    for k in 0..8 {
        let idx = mb_bits(mb, 9 + 6 * k, 6) as usize;
        let c = AIS_CHARSET[idx];
        if c == b'?' {
            return None;
        }
        callsign.push(c as char);
    }
    let callsign = callsign.trim_end().to_string();
    if callsign.is_empty() {
        return None;
    }
    Some(CommB::AircraftIdent { callsign })
}

fn try_bds30(mb: &[u8]) -> Option<CommB> {
    if mb[0] != 0x30 {
        return None;
    }
    let ara = mb_bits(mb, 9, 14) as u16;
    let rac = mb_bits(mb, 23, 4) as u8;
    if ara == 0 && rac == 0 {
        return None;
    }
    Some(CommB::AcasAdvisory {
        ara,
        rac,
        rat: mb_bits(mb, 27, 1) != 0,
        mte: mb_bits(mb, 28, 1) != 0,
    })
}

fn try_bds40(mb: &[u8]) -> Option<CommB> {
    let mcp_altitude = (mb_bits(mb, 1, 1) != 0).then(|| mb_bits(mb, 2, 12) * 16);
    let fms_altitude = (mb_bits(mb, 14, 1) != 0).then(|| mb_bits(mb, 15, 12) * 16);
    let baro_setting =
        (mb_bits(mb, 27, 1) != 0).then(|| mb_bits(mb, 28, 12) as f32 * 0.1 + 800.0);

    if mcp_altitude.is_none() && fms_altitude.is_none() && baro_setting.is_none() {
        return None;
    }
    if mcp_altitude.is_some_and(|a| a == 0 || a > 50_000)
        || fms_altitude.is_some_and(|a| a == 0 || a > 50_000)
    {
        return None;
    }
    if baro_setting.is_some_and(|b| !(850.0..=1100.0).contains(&b)) {
        return None;
    }

    let mode_status = mb_bits(mb, 48, 1) != 0;
    Some(CommB::SelectedIntent {
        mcp_altitude,
        fms_altitude,
        baro_setting,
        vnav: mode_status && mb_bits(mb, 49, 1) != 0,
        alt_hold: mode_status && mb_bits(mb, 50, 1) != 0,
        approach: mode_status && mb_bits(mb, 51, 1) != 0,
    })
}

fn try_bds50(mb: &[u8]) -> Option<CommB> {
    let statuses = [1u32, 12, 24, 35, 46];
    let present = statuses.iter().filter(|&&b| mb_bits(mb, b, 1) != 0).count();
    if present < 2 {
        return None;
    }

    let roll_angle =
        (mb_bits(mb, 1, 1) != 0).then(|| mb_signed(mb, 2, 9) as f32 * 45.0 / 256.0);
    let true_track = (mb_bits(mb, 12, 1) != 0).then(|| {
        let t = mb_signed(mb, 13, 10) as f32 * 90.0 / 512.0;
        if t < 0.0 { t + 360.0 } else { t }
    });
    let ground_speed = (mb_bits(mb, 24, 1) != 0).then(|| (mb_bits(mb, 25, 10) * 2) as u16);
    let track_rate =
        (mb_bits(mb, 35, 1) != 0).then(|| mb_signed(mb, 36, 9) as f32 * 8.0 / 256.0);
    let true_airspeed = (mb_bits(mb, 46, 1) != 0).then(|| (mb_bits(mb, 47, 10) * 2) as u16);

    if roll_angle.is_some_and(|r| r.abs() > 60.0) {
        return None;
    }
    if ground_speed.is_some_and(|g| g > 600) || true_airspeed.is_some_and(|t| t > 600) {
        return None;
    }

    Some(CommB::TrackAndTurn {
        roll_angle,
        true_track,
        ground_speed,
        track_rate,
        true_airspeed,
    })
}

fn try_bds60(mb: &[u8]) -> Option<CommB> {
    let statuses = [1u32, 13, 24, 35, 46];
    let present = statuses.iter().filter(|&&b| mb_bits(mb, b, 1) != 0).count();
    if present < 2 {
        return None;
    }

    let magnetic_heading = (mb_bits(mb, 1, 1) != 0).then(|| {
        let h = mb_signed(mb, 2, 10) as f32 * 90.0 / 512.0;
        if h < 0.0 { h + 360.0 } else { h }
    });
    let indicated_airspeed = (mb_bits(mb, 13, 1) != 0).then(|| mb_bits(mb, 14, 10) as u16);
    let mach = (mb_bits(mb, 24, 1) != 0).then(|| mb_bits(mb, 25, 10) as f32 * 2.048 / 512.0);
    let baro_rate = (mb_bits(mb, 35, 1) != 0).then(|| mb_signed(mb, 36, 9) * 32);
    let inertial_rate = (mb_bits(mb, 46, 1) != 0).then(|| mb_signed(mb, 47, 9) * 32);

    if indicated_airspeed.is_some_and(|i| i > 500) {
        return None;
    }
    if mach.is_some_and(|m| m > 1.0) {
        return None;
    }

    Some(CommB::HeadingAndSpeed {
        magnetic_heading,
        indicated_airspeed,
        mach,
        baro_rate,
        inertial_rate,
    })
}

/// Unpack the interleaved Gillham identity bits into the four octal
/// digits of the squawk, stored as a base-10 number.
fn decode_identity(msg: &[u8]) -> u16 {
    let a = ((msg[3] & 0x80) >> 5) | (msg[2] & 0x02) | ((msg[2] & 0x08) >> 3);
    let b = ((msg[3] & 0x02) << 1) | ((msg[3] & 0x08) >> 2) | ((msg[3] & 0x20) >> 5);
    let c = ((msg[2] & 0x01) << 2) | ((msg[2] & 0x04) >> 1) | ((msg[2] & 0x10) >> 4);
    let d = ((msg[3] & 0x01) << 2) | ((msg[3] & 0x04) >> 1) | ((msg[3] & 0x10) >> 4);
    (a as u16) * 1000 + (b as u16) * 100 + (c as u16) * 10 + (d as u16)
}

fn decode_extended_squitter(mm: &mut ModesMessage) {
    mm.me_type = mm.msg[4] >> 3;
    mm.me_sub = mm.msg[4] & 0x07;

    if (1..=4).contains(&mm.me_type) {
        // Identification and category.
        mm.aircraft_category = mm.me_sub;

        let idx = [
            (mm.msg[5] >> 2) as usize,
            (((mm.msg[5] & 0x03) << 4) | (mm.msg[6] >> 4)) as usize,
            (((mm.msg[6] & 0x0F) << 2) | (mm.msg[7] >> 6)) as usize,
            (mm.msg[7] & 0x3F) as usize,
            (mm.msg[8] >> 2) as usize,
            (((mm.msg[8] & 0x03) << 4) | (mm.msg[9] >> 4)) as usize,
            (((mm.msg[9] & 0x0F) << 2) | (mm.msg[10] >> 6)) as usize,
            (mm.msg[10] & 0x3F) as usize,
        ];
        let flight: String = idx.iter().map(|&i| AIS_CHARSET[i] as char).collect();
        mm.flight = flight.trim_end().to_string();
    } else if (9..=18).contains(&mm.me_type) {
        // Airborne position, barometric altitude.
        mm.fflag = (mm.msg[6] & 0x04) != 0;
        mm.tflag = (mm.msg[6] & 0x08) != 0;
        mm.altitude = decode_ac12_field(&mm.msg, &mut mm.unit);
        mm.raw_latitude = (((mm.msg[6] & 0x03) as u32) << 15)
            | ((mm.msg[7] as u32) << 7)
            | ((mm.msg[8] >> 1) as u32);
        mm.raw_longitude =
            (((mm.msg[8] & 0x01) as u32) << 16) | ((mm.msg[9] as u32) << 8) | (mm.msg[10] as u32);
    } else if mm.me_type == 19 && (1..=4).contains(&mm.me_sub) {
        if mm.me_sub == 1 || mm.me_sub == 2 {
            // Ground-referenced velocity.
            mm.ew_dir = (mm.msg[5] & 0x04) >> 2;
            mm.ew_velocity = (((mm.msg[5] & 0x03) as u16) << 8) | (mm.msg[6] as u16);
            mm.ns_dir = (mm.msg[7] & 0x80) >> 7;
            mm.ns_velocity =
                (((mm.msg[7] & 0x7F) as u16) << 3) | (((mm.msg[8] & 0xE0) >> 5) as u16);
            mm.vert_rate_source = (mm.msg[8] & 0x10) >> 4;
            mm.vert_rate_sign = (mm.msg[8] & 0x08) >> 3;
            mm.vert_rate =
                (((mm.msg[8] & 0x07) as u16) << 6) | (((mm.msg[9] & 0xFC) >> 2) as u16);

            let ewv = mm.ew_velocity as f64;
            let nsv = mm.ns_velocity as f64;
            mm.velocity = ewv.hypot(nsv) as u16;

            if mm.velocity > 0 {
                let ewv = if mm.ew_dir != 0 { -ewv } else { ewv };
                let nsv = if mm.ns_dir != 0 { -nsv } else { nsv };
                let mut heading = ewv.atan2(nsv).to_degrees();
                if heading < 0.0 {
                    heading += 360.0;
                }
                mm.heading = heading;
                mm.heading_is_valid = true;
            }
        } else {
            // Airspeed/heading subtypes carry a 7-bit magnetic heading.
            mm.heading_is_valid = (mm.msg[5] & 0x04) != 0;
            mm.heading = (360.0 / 128.0)
                * ((((mm.msg[5] & 0x03) as u16) << 5) | ((mm.msg[6] >> 3) as u16)) as f64;
        }
    }
    // ME 5..8 (surface position) is recognized but not decoded.
}

/// 13-bit altitude field of DF0/4/16/20.
///
/// M selects metric reporting (kept raw), Q selects 25 ft quanta; the
/// Q=0 path falls back to the legacy Gillham encoding.
fn decode_ac13_field(msg: &[u8], unit: &mut AltitudeUnit) -> i32 {
    let m_bit = (msg[3] & 0x40) != 0;
    let q_bit = (msg[3] & 0x10) != 0;

    if m_bit {
        *unit = AltitudeUnit::Meters;
        let n = (((msg[2] & 0x1F) as i32) << 7)
            | (((msg[3] & 0x80) >> 1) as i32)
            | ((msg[3] & 0x20) as i32)
            | ((msg[3] & 0x0F) as i32);
        return n;
    }

    *unit = AltitudeUnit::Feet;
    if q_bit {
        let n = (((msg[2] & 0x1F) as i32) << 6)
            | (((msg[3] & 0x80) >> 2) as i32)
            | (((msg[3] & 0x20) >> 1) as i32)
            | ((msg[3] & 0x0F) as i32);
        (n * 25 - 1000).max(0)
    } else {
        let c1 = (msg[2] >> 4) & 1;
        let a1 = (msg[2] >> 3) & 1;
        let c2 = (msg[2] >> 2) & 1;
        let a2 = (msg[2] >> 1) & 1;
        let c4 = msg[2] & 1;
        let a4 = (msg[3] >> 7) & 1;
        let b1 = (msg[3] >> 5) & 1;
        let d2 = (msg[3] >> 3) & 1;
        let b2 = (msg[3] >> 2) & 1;
        let d4 = (msg[3] >> 1) & 1;
        let b4 = msg[3] & 1;

        let code = ((d4 as u16) << 10)
            | ((d2 as u16) << 9)
            | ((b4 as u16) << 8)
            | ((b2 as u16) << 7)
            | ((b1 as u16) << 6)
            | ((a4 as u16) << 5)
            | ((a2 as u16) << 4)
            | ((a1 as u16) << 3)
            | ((c4 as u16) << 2)
            | ((c2 as u16) << 1)
            | (c1 as u16);
        decode_gillham_altitude(code).unwrap_or(0)
    }
}

/// 12-bit altitude field of DF17 airborne position. Q-bit quanta only.
fn decode_ac12_field(msg: &[u8], unit: &mut AltitudeUnit) -> i32 {
    *unit = AltitudeUnit::Feet;
    let q_bit = (msg[5] & 0x01) != 0;
    if !q_bit {
        return 0;
    }
    let n = (((msg[5] >> 1) as i32) << 4) | (((msg[6] & 0xF0) >> 4) as i32);
    (n * 25 - 1000).max(0)
}

/// Legacy Mode C Gillham (reflected Gray) altitude in 100 ft steps.
fn decode_gillham_altitude(code: u16) -> Option<i32> {
    if code == 0 {
        return None;
    }

    let c1 = (code & 0x001) != 0;
    let c2 = (code & 0x002) != 0;
    let c4 = (code & 0x004) != 0;
    let a1 = (code & 0x008) != 0;
    let a2 = (code & 0x010) != 0;
    let a4 = (code & 0x020) != 0;
    let b1 = (code & 0x040) != 0;
    let b2 = (code & 0x080) != 0;
    let b4 = (code & 0x100) != 0;
    let d2 = (code & 0x200) != 0;
    let d4 = (code & 0x400) != 0;

    // 500 ft bands from the D/B groups (Gray coded, D1 never transmitted).
    let mut gray500 = 0i32;
    if d4 {
        gray500 |= 0x20;
    }
    if d2 {
        gray500 |= 0x10;
    }
    if b4 {
        gray500 |= 0x04;
    }
    if b2 {
        gray500 |= 0x02;
    }
    if b1 {
        gray500 |= 0x01;
    }
    let mut five_hundreds = gray500;
    five_hundreds ^= five_hundreds >> 4;
    five_hundreds ^= five_hundreds >> 2;
    five_hundreds ^= five_hundreds >> 1;

    // 100 ft steps from the C/A groups.
    let mut gray100 = 0i32;
    if c4 {
        gray100 |= 0x10;
    }
    if c2 {
        gray100 |= 0x08;
    }
    if c1 {
        gray100 |= 0x04;
    }
    if a4 {
        gray100 |= 0x02;
    }
    if a2 {
        gray100 |= 0x01;
    }
    let mut one_hundreds = gray100;
    one_hundreds ^= one_hundreds >> 4;
    one_hundreds ^= one_hundreds >> 2;
    one_hundreds ^= one_hundreds >> 1;

    // The 100 ft digit reflects in alternate 500 ft bands.
    let hundreds = if a1 {
        4 - (one_hundreds % 5).min(4)
    } else {
        (one_hundreds % 5).min(4)
    };

    let altitude = five_hundreds * 500 + hundreds * 100 - 1300;
    if (-1200..=126_700).contains(&altitude) {
        Some(altitude)
    } else {
        None
    }
}

/// Parse a RAW protocol line (`*HEX;`, 2..28 hex digits) and decode it.
pub fn decode_hex_message(
    line: &str,
    fix_errors: bool,
    aggressive: bool,
    cache: &IcaoCache,
) -> Option<ModesMessage> {
    let line = line.trim();
    if line.len() < 4 || !line.starts_with('*') || !line.ends_with(';') {
        return None;
    }

    let hex = &line[1..line.len() - 1];
    if hex.len() < 2 || hex.len() > MODES_LONG_MSG_BYTES * 2 || hex.len() % 2 != 0 {
        return None;
    }

    let mut msg = [0u8; MODES_LONG_MSG_BYTES];
    for (i, pair) in hex.as_bytes().chunks_exact(2).enumerate() {
        let hi = hex_digit(pair[0])?;
        let lo = hex_digit(pair[1])?;
        msg[i] = (hi << 4) | lo;
    }

    Some(decode_modes_message(
        &msg[..hex.len() / 2],
        fix_errors,
        aggressive,
        cache,
    ))
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn comm_b_summary(cb: &CommB) -> String {
    fn or_na<T: std::fmt::Display>(v: &Option<T>, unit: &str) -> String {
        match v {
            Some(v) => format!("{v}{unit}"),
            None => "N/A".to_string(),
        }
    }

    match cb {
        CommB::DataLinkCapability { continuation, overlay } => {
            format!("BDS 1,0 data link capability (cont={continuation}, overlay={overlay})")
        }
        CommB::AircraftIdent { callsign } => format!("BDS 2,0 ident: {callsign}"),
        CommB::AcasAdvisory { ara, rac, rat, mte } => {
            format!("BDS 3,0 ACAS RA (ARA={ara}, RAC={rac}, RAT={rat}, MTE={mte})")
        }
        CommB::SelectedIntent {
            mcp_altitude,
            fms_altitude,
            baro_setting,
            ..
        } => format!(
            "BDS 4,0 MCP {} FMS {} baro {}",
            or_na(mcp_altitude, " ft"),
            or_na(fms_altitude, " ft"),
            or_na(baro_setting, " mb")
        ),
        CommB::TrackAndTurn {
            roll_angle,
            true_track,
            ground_speed,
            true_airspeed,
            ..
        } => format!(
            "BDS 5,0 roll {} track {} GS {} TAS {}",
            or_na(roll_angle, ""),
            or_na(true_track, ""),
            or_na(ground_speed, " kt"),
            or_na(true_airspeed, " kt")
        ),
        CommB::HeadingAndSpeed {
            magnetic_heading,
            indicated_airspeed,
            mach,
            baro_rate,
            ..
        } => format!(
            "BDS 6,0 hdg {} IAS {} mach {} baro rate {}",
            or_na(magnetic_heading, ""),
            or_na(indicated_airspeed, " kt"),
            or_na(mach, ""),
            or_na(baro_rate, " ft/min")
        ),
    }
}

fn capability_str(ca: u8) -> &'static str {
    match ca {
        0 => "Level 1 (Surveillance Only)",
        1 => "Level 2 (DF0,4,5,11)",
        2 => "Level 3 (DF0,4,5,11,20,21)",
        3 => "Level 4 (DF0,4,5,11,20,21,24)",
        4 => "Level 2+3+4 (DF0,4,5,11,20,21,24,code7 - is on ground)",
        5 => "Level 2+3+4 (DF0,4,5,11,20,21,24,code7 - is airborne)",
        6 => "Level 2+3+4 (DF0,4,5,11,20,21,24,code7)",
        7 => "Level 7",
        _ => "Unknown",
    }
}

fn flight_status_str(fs: u8) -> &'static str {
    match fs {
        0 => "Normal, Airborne",
        1 => "Normal, On the ground",
        2 => "ALERT, Airborne",
        3 => "ALERT, On the ground",
        4 => "ALERT & Special Position Identification",
        5 => "Special Position Identification",
        _ => "Not assigned",
    }
}

fn me_description(me_type: u8, me_sub: u8) -> &'static str {
    match me_type {
        1..=4 => "Aircraft Identification and Category",
        5..=8 => "Surface Position",
        9..=18 => "Airborne Position (Baro Altitude)",
        19 if (1..=4).contains(&me_sub) => "Airborne Velocity",
        20..=22 => "Airborne Position (GNSS Height)",
        23 if me_sub == 0 => "Test Message",
        28 if me_sub == 1 => "Aircraft Status (Emergency)",
        28 if me_sub == 2 => "Aircraft Status (TCAS RA)",
        29 if me_sub <= 1 => "Target State and Status",
        31 if me_sub <= 1 => "Aircraft Operational Status",
        _ => "Unknown",
    }
}

impl fmt::Display for ModesMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.to_raw_string())?;
        writeln!(
            f,
            "CRC: {:06x} ({})",
            self.crc,
            if self.crc_ok { "ok" } else { "wrong" }
        )?;
        match self.fix {
            Fix::None => {}
            Fix::Single(bit) => writeln!(f, "Single bit error fixed, bit {bit}")?,
            Fix::Double(a, b) => writeln!(f, "Two bit errors fixed, bits {a} and {b}")?,
        }

        let unit = if self.unit == AltitudeUnit::Meters {
            "meters"
        } else {
            "feet"
        };

        match self.msg_type {
            0 | 16 => {
                let name = if self.msg_type == 0 { "Short" } else { "Long" };
                writeln!(f, "DF {}: {} Air-Air Surveillance.", self.msg_type, name)?;
                writeln!(f, "  Altitude       : {} {}", self.altitude, unit)?;
                writeln!(f, "  ICAO Address   : {:06x}", self.icao_address())?;
            }
            4 | 20 => {
                let name = if self.msg_type == 4 { "Surveillance" } else { "Comm-B" };
                writeln!(f, "DF {}: {}, Altitude Reply.", self.msg_type, name)?;
                writeln!(f, "  Flight Status  : {}", flight_status_str(self.fs))?;
                writeln!(f, "  DR             : {}", self.dr)?;
                writeln!(f, "  UM             : {}", self.um)?;
                writeln!(f, "  Altitude       : {} {}", self.altitude, unit)?;
                writeln!(f, "  ICAO Address   : {:06x}", self.icao_address())?;
                if let Some(ref cb) = self.comm_b {
                    writeln!(f, "  MB Field       : {}", comm_b_summary(cb))?;
                }
            }
            5 | 21 => {
                let name = if self.msg_type == 5 { "Surveillance" } else { "Comm-B" };
                writeln!(f, "DF {}: {}, Identity Reply.", self.msg_type, name)?;
                writeln!(f, "  Flight Status  : {}", flight_status_str(self.fs))?;
                writeln!(f, "  DR             : {}", self.dr)?;
                writeln!(f, "  UM             : {}", self.um)?;
                writeln!(f, "  Squawk         : {:04}", self.identity)?;
                writeln!(f, "  ICAO Address   : {:06x}", self.icao_address())?;
                if let Some(ref cb) = self.comm_b {
                    writeln!(f, "  MB Field       : {}", comm_b_summary(cb))?;
                }
            }
            11 => {
                writeln!(f, "DF 11: All Call Reply.")?;
                writeln!(f, "  Capability  : {}", capability_str(self.ca))?;
                writeln!(f, "  ICAO Address: {:06x}", self.icao_address())?;
            }
            17 => {
                writeln!(f, "DF 17: ADS-B message.")?;
                writeln!(f, "  Capability     : {} ({})", self.ca, capability_str(self.ca))?;
                writeln!(f, "  ICAO Address   : {:06x}", self.icao_address())?;
                writeln!(f, "  Squitter Type  : {}", self.me_type)?;
                writeln!(f, "  Squitter Sub   : {}", self.me_sub)?;
                writeln!(
                    f,
                    "  Squitter Name  : {}",
                    me_description(self.me_type, self.me_sub)
                )?;

                if (1..=4).contains(&self.me_type) {
                    writeln!(f, "    Category       : {}", self.aircraft_category)?;
                    writeln!(f, "    Identification : {}", self.flight)?;
                } else if (9..=18).contains(&self.me_type) {
                    writeln!(f, "    F flag   : {}", if self.fflag { "odd" } else { "even" })?;
                    writeln!(f, "    T flag   : {}", if self.tflag { "UTC" } else { "non-UTC" })?;
                    writeln!(f, "    Altitude : {} feet", self.altitude)?;
                    writeln!(f, "    Latitude : {} (not decoded)", self.raw_latitude)?;
                    writeln!(f, "    Longitude: {} (not decoded)", self.raw_longitude)?;
                } else if self.me_type == 19 && (self.me_sub == 1 || self.me_sub == 2) {
                    writeln!(f, "    EW direction      : {}", self.ew_dir)?;
                    writeln!(f, "    EW velocity       : {}", self.ew_velocity)?;
                    writeln!(f, "    NS direction      : {}", self.ns_dir)?;
                    writeln!(f, "    NS velocity       : {}", self.ns_velocity)?;
                    writeln!(f, "    Ground speed      : {} kt", self.velocity)?;
                    writeln!(f, "    Track             : {:.1}", self.heading)?;
                    writeln!(
                        f,
                        "    Vertical rate     : {}",
                        self.vertical_rate().unwrap_or(0)
                    )?;
                } else if self.me_type == 19 {
                    writeln!(f, "    Heading valid : {}", self.heading_is_valid)?;
                    writeln!(f, "    Heading       : {:.1}", self.heading)?;
                }
            }
            _ => {
                writeln!(f, "DF {} (decoding not implemented)", self.msg_type)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> IcaoCache {
        IcaoCache::new()
    }

    #[test]
    fn length_table() {
        assert_eq!(message_len_by_type(0), 56);
        assert_eq!(message_len_by_type(4), 56);
        assert_eq!(message_len_by_type(5), 56);
        assert_eq!(message_len_by_type(11), 56);
        assert_eq!(message_len_by_type(16), 112);
        assert_eq!(message_len_by_type(17), 112);
        assert_eq!(message_len_by_type(19), 112);
        assert_eq!(message_len_by_type(20), 112);
        assert_eq!(message_len_by_type(21), 112);
        assert_eq!(message_len_by_type(24), 56);
    }

    #[test]
    fn df17_identification_decodes_flight() {
        let mm = decode_hex_message("*8D4840D6202CC371C32CE0576098;", true, false, &cache())
            .expect("line should parse");
        assert_eq!(mm.msg_type, 17);
        assert_eq!(mm.msg_bits, 112);
        assert!(mm.crc_ok);
        assert_eq!(mm.aa, [0x48, 0x40, 0xD6]);
        assert_eq!(mm.me_type, 4);
        assert_eq!(mm.flight, "KLM1023");
    }

    #[test]
    fn df17_velocity_fields() {
        // Ground-referenced velocity frame for 485020.
        let mm = decode_hex_message("*8D485020994409940838175B284F;", true, false, &cache())
            .expect("line should parse");
        assert!(mm.crc_ok);
        assert_eq!(mm.me_type, 19);
        assert_eq!(mm.me_sub, 1);
        assert!(mm.velocity > 150 && mm.velocity < 170, "gs {}", mm.velocity);
        assert!(mm.heading_is_valid);
        assert!(mm.heading > 180.0 && mm.heading < 185.0, "trk {}", mm.heading);
        assert_eq!(mm.vertical_rate(), Some(-832));
    }

    #[test]
    fn df17_airborne_position_fields() {
        let mm = decode_hex_message("*8D40621D58C382D690C8AC2863A7;", true, false, &cache())
            .expect("line should parse");
        assert!(mm.crc_ok);
        assert!((9..=18).contains(&mm.me_type));
        assert!(!mm.fflag); // even frame
        assert_eq!(mm.raw_latitude, 93000);
        assert_eq!(mm.raw_longitude, 51372);
        assert_eq!(mm.altitude, 38000);
    }

    #[test]
    fn clean_df17_seeds_the_cache() {
        let c = cache();
        let mm = decode_hex_message("*8D4840D6202CC371C32CE0576098;", false, false, &c).unwrap();
        assert!(mm.crc_ok);
        assert!(c.contains(0x4840D6));
    }

    #[test]
    fn ap_xor_frame_requires_cache_hit() {
        let c = cache();
        let line = "*20000F1F684A6C;"; // DF4 altitude reply
        let first = decode_hex_message(line, false, false, &c).unwrap();
        assert_eq!(first.msg_type, 4);
        assert!(!first.crc_ok, "unknown address must not validate");
        let addr = first.icao_address();
        assert_ne!(addr, 0);

        c.insert(addr);
        let second = decode_hex_message(line, false, false, &c).unwrap();
        assert!(second.crc_ok, "cached address validates the frame");
        assert_eq!(second.icao_address(), addr);
    }

    #[test]
    fn identity_all_ones_is_7777() {
        let mut msg = [0u8; 7];
        msg[0] = 5 << 3;
        msg[2] = 0x1F;
        msg[3] = 0xBF;
        assert_eq!(decode_identity(&msg), 7777);
    }

    #[test]
    fn identity_zero_field_is_0000() {
        let msg = [5 << 3, 0, 0, 0, 0, 0, 0];
        assert_eq!(decode_identity(&msg), 0);
    }

    #[test]
    fn ac13_q_bit_round_trip() {
        // decode(encode(N)) == 25*N - 1000 across the 11-bit range.
        for n in [40i32, 100, 500, 1000, 1500, 2000, 2047] {
            let mut msg = [0u8; 7];
            msg[0] = 4 << 3;
            msg[2] = ((n >> 6) & 0x1F) as u8;
            msg[3] = ((((n >> 5) & 1) as u8) << 7)
                | ((((n >> 4) & 1) as u8) << 5)
                | ((n & 0x0F) as u8)
                | 0x10; // Q
            let mut unit = AltitudeUnit::Feet;
            assert_eq!(decode_ac13_field(&msg, &mut unit), (25 * n - 1000).max(0));
            assert_eq!(unit, AltitudeUnit::Feet);
        }
    }

    #[test]
    fn ac13_m_bit_tags_meters() {
        let mut msg = [0u8; 7];
        msg[3] = 0x40;
        let mut unit = AltitudeUnit::Feet;
        decode_ac13_field(&msg, &mut unit);
        assert_eq!(unit, AltitudeUnit::Meters);
    }

    #[test]
    fn gillham_rejects_zero() {
        assert_eq!(decode_gillham_altitude(0), None);
    }

    #[test]
    fn raw_string_round_trip() {
        let c = cache();
        let mm = decode_hex_message("*8D4840D6202CC371C32CE0576098;", false, false, &c).unwrap();
        assert_eq!(mm.to_raw_string(), "*8D4840D6202CC371C32CE0576098;");
        let back = decode_hex_message(&mm.to_raw_string(), false, false, &c).unwrap();
        assert_eq!(back.msg, mm.msg);
        assert_eq!(back.msg_bits, mm.msg_bits);
    }

    #[test]
    fn malformed_raw_lines_are_rejected() {
        let c = cache();
        assert!(decode_hex_message("8D4840D6202CC371C32CE0576098", false, false, &c).is_none());
        assert!(decode_hex_message("*;", false, false, &c).is_none());
        assert!(decode_hex_message("*8D4;", false, false, &c).is_none());
        assert!(decode_hex_message("*8G;", false, false, &c).is_none());
        assert!(
            decode_hex_message("*8D4840D6202CC371C32CE05760988D4840D6;", false, false, &c)
                .is_none()
        );
    }

    #[test]
    fn comm_b_ident_register() {
        // BDS 2,0 with "BAW256" packed as 6-bit characters.
        let mut msg = [0u8; 14];
        msg[0] = 20 << 3;
        msg[4..11].copy_from_slice(&[0x20, 0x08, 0x15, 0xF2, 0xD7, 0x68, 0x20]);

        match decode_comm_b(&msg) {
            Some(CommB::AircraftIdent { callsign }) => assert_eq!(callsign, "BAW256"),
            other => panic!("expected ident register, got {other:?}"),
        }
    }

    #[test]
    fn comm_b_heading_and_speed_register() {
        // Heading 90.0 degrees (raw 512) and IAS 250 kt, other fields off.
        let mut msg = [0u8; 14];
        msg[0] = 21 << 3;
        msg[4..11].copy_from_slice(&[0xA0, 0x09, 0xF4, 0, 0, 0, 0]);

        match decode_comm_b(&msg) {
            Some(CommB::HeadingAndSpeed {
                magnetic_heading,
                indicated_airspeed,
                mach,
                baro_rate,
                ..
            }) => {
                assert_eq!(magnetic_heading, Some(90.0));
                assert_eq!(indicated_airspeed, Some(250));
                assert_eq!(mach, None);
                assert_eq!(baro_rate, None);
            }
            other => panic!("expected heading/speed register, got {other:?}"),
        }
    }

    #[test]
    fn comm_b_rejects_unidentifiable_fields() {
        // A single status bit is not enough for the heuristic registers.
        let mut msg = [0u8; 14];
        msg[0] = 20 << 3;
        msg[4..11].copy_from_slice(&[0x80, 0, 0, 0, 0, 0, 0]);
        assert_eq!(decode_comm_b(&msg), None);
    }

    #[test]
    fn mb_bit_extraction() {
        let mb = [0b1010_0000u8, 0b0000_1001, 0, 0, 0, 0, 0];
        assert_eq!(mb_bits(&mb, 1, 1), 1);
        assert_eq!(mb_bits(&mb, 2, 1), 0);
        assert_eq!(mb_bits(&mb, 3, 10), 512);
        assert_eq!(mb_bits(&mb, 13, 1), 1);
        assert_eq!(mb_signed(&mb, 2, 10), 512);

        let negative = [0b1110_0000u8, 0, 0, 0, 0, 0, 0];
        assert_eq!(mb_signed(&negative, 2, 10), 512 - 1024, "sign bit extends");
    }

    #[test]
    fn status_flags_follow_fs_and_squawk() {
        let mut mm = ModesMessage::default();
        mm.fs = 3;
        mm.identity = 7700;
        let (alert, emergency, spi, ground) = mm.status_flags();
        assert!(alert && emergency && ground && !spi);

        mm.fs = 5;
        mm.identity = 1200;
        let (alert, emergency, spi, ground) = mm.status_flags();
        assert!(!alert && !emergency && spi && !ground);
    }
}
