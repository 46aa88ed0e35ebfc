//! SBS (BaseStation) CSV protocol.
//!
//! The output side turns decoded messages into the 22-field `MSG,n` rows
//! that BaseStation-compatible tools ingest on port 30003; the input side
//! parses the same rows from upstream feeders. Fields 7-10 carry the same
//! local timestamp twice (generated and logged).

use chrono::{DateTime, Local};

use crate::decoder::ModesMessage;

/// Record types a BaseStation feed may carry. Only `MSG` has content we
/// use; the others are counted and dropped.
const OTHER_PREFIXES: [&str; 5] = ["SEL,", "ID,", "AIR,", "STA,", "CLK,"];

/// A parsed inbound `MSG,` record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SbsMsg {
    pub transmission_type: u8,
    pub icao: u32,
    pub callsign: Option<String>,
    pub altitude: Option<i32>,
    pub ground_speed: Option<f64>,
    pub track: Option<f64>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub vertical_rate: Option<i32>,
    pub squawk: Option<u16>,
    pub alert: bool,
    pub emergency: bool,
    pub spi: bool,
    pub is_on_ground: bool,
}

/// Classification of one inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum SbsRecord {
    Msg(SbsMsg),
    /// A known non-MSG record type.
    Other,
}

/// Format the timestamp pair used in fields 7-10.
fn timestamp_fields(now: DateTime<Local>) -> (String, String) {
    (
        now.format("%Y/%m/%d").to_string(),
        now.format("%H:%M:%S%.3f").to_string(),
    )
}

/// Serialize a decoded message as one SBS row, newline excluded.
///
/// Returns `None` for downlink formats the BaseStation protocol has no
/// row for. `position` supplies the registry's current fix for airborne
/// position messages.
pub fn format_message(
    mm: &ModesMessage,
    position: Option<(f64, f64)>,
    now: DateTime<Local>,
) -> Option<String> {
    let icao = format!("{:06X}", mm.icao_address());
    let (date, time) = timestamp_fields(now);
    let head = |tt: u8| format!("MSG,{tt},1,1,{icao},1,{date},{time},{date},{time}");
    let (alert, emergency, spi, ground) = mm.status_flags();
    let flags = format!(
        "{},{},{},{}",
        flag(alert),
        flag(emergency),
        flag(spi),
        flag(ground)
    );

    match mm.msg_type {
        0 | 16 => Some(format!("{},,{},,,,,,,,,,", head(5), mm.altitude)),
        4 => Some(format!("{},,{},,,,,,,{}", head(5), mm.altitude, flags)),
        5 => Some(format!("{},,,,,,,,{:04},{}", head(6), mm.identity, flags)),
        11 => Some(format!("{},,,,,,,,,,,,", head(8))),
        17 if (1..=4).contains(&mm.me_type) => {
            Some(format!("{},{},,,,,,,,0,0,0,0", head(1), mm.flight))
        }
        17 if (9..=18).contains(&mm.me_type) => {
            if let Some((lat, lon)) = position {
                Some(format!(
                    "{},,{},,,{:.5},{:.5},,,0,0,0,0",
                    head(3),
                    mm.altitude,
                    lat,
                    lon
                ))
            } else {
                Some(format!("{},,{},,,,,,,0,0,0,0", head(3), mm.altitude))
            }
        }
        17 if mm.me_type == 19 && (mm.me_sub == 1 || mm.me_sub == 2) => Some(format!(
            "{},,,{},{},,,{},,0,0,0,0",
            head(4),
            mm.velocity,
            mm.heading as i32,
            mm.vertical_rate().unwrap_or(0)
        )),
        21 => Some(format!("{},,,,,,,,{:04},{}", head(6), mm.identity, flags)),
        _ => None,
    }
}

fn flag(v: bool) -> i8 {
    if v { -1 } else { 0 }
}

/// Parse one inbound line. `None` means the line matched no known record
/// type (counted as unrecognized by the caller).
pub fn parse_line(line: &str) -> Option<SbsRecord> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("MSG,") {
        return parse_msg(rest).map(SbsRecord::Msg);
    }
    if OTHER_PREFIXES.iter().any(|p| line.starts_with(p)) {
        return Some(SbsRecord::Other);
    }
    None
}

fn parse_msg(rest: &str) -> Option<SbsMsg> {
    // `rest` starts at field 2; fields are fixed-position, missing ones
    // are empty strings and trailing fields may be absent entirely.
    let fields: Vec<&str> = rest.split(',').collect();
    let get = |i: usize| fields.get(i).copied().unwrap_or("");

    let transmission_type: u8 = get(0).parse().ok()?;
    let icao = u32::from_str_radix(get(3), 16).ok()?;
    if icao == 0 || icao > 0xFF_FFFF {
        return None;
    }

    Some(SbsMsg {
        transmission_type,
        icao,
        callsign: non_empty(get(9)),
        altitude: get(10).parse().ok(),
        ground_speed: get(11).parse().ok(),
        track: get(12).parse().ok(),
        lat: get(13).parse().ok(),
        lon: get(14).parse().ok(),
        vertical_rate: get(15).parse().ok(),
        squawk: get(16).parse().ok(),
        alert: get(17) == "-1",
        emergency: get(18) == "-1",
        spi: get(19) == "-1",
        is_on_ground: get(20) == "-1",
    })
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at_noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn field_count(row: &str) -> usize {
        row.split(',').count()
    }

    #[test]
    fn identification_row_matches_grid() {
        let mut mm = ModesMessage::default();
        mm.msg_type = 17;
        mm.me_type = 4;
        mm.aa = [0x4B, 0x16, 0x21];
        mm.flight = "SAS123".into();

        let row = format_message(&mm, None, at_noon()).unwrap();
        assert_eq!(
            row,
            "MSG,1,1,1,4B1621,1,2024/03/01,12:00:00.000,2024/03/01,12:00:00.000,SAS123,,,,,,,,0,0,0,0"
        );
        assert_eq!(field_count(&row), 22);
    }

    #[test]
    fn every_row_type_has_22_fields() {
        let mk = |df: u8, me: u8, sub: u8| {
            let mut mm = ModesMessage::default();
            mm.msg_type = df;
            mm.me_type = me;
            mm.me_sub = sub;
            mm.aa = [0x48, 0x40, 0xD6];
            mm
        };

        for mm in [
            mk(0, 0, 0),
            mk(4, 0, 0),
            mk(5, 0, 0),
            mk(11, 0, 0),
            mk(16, 0, 0),
            mk(17, 4, 0),
            mk(17, 11, 0),
            mk(17, 19, 1),
            mk(21, 0, 0),
        ] {
            let row = format_message(&mm, Some((52.0, 4.0)), at_noon()).unwrap();
            assert_eq!(field_count(&row), 22, "df {} row {row}", mm.msg_type);
        }
    }

    #[test]
    fn unsupported_df_yields_no_row() {
        let mut mm = ModesMessage::default();
        mm.msg_type = 19;
        assert!(format_message(&mm, None, at_noon()).is_none());
    }

    #[test]
    fn position_row_carries_fix_when_known() {
        let mut mm = ModesMessage::default();
        mm.msg_type = 17;
        mm.me_type = 11;
        mm.aa = [0x40, 0x62, 0x1D];
        mm.altitude = 38_000;

        let with = format_message(&mm, Some((52.25720, 3.91937)), at_noon()).unwrap();
        assert!(with.contains("52.25720,3.91937"), "{with}");

        let without = format_message(&mm, None, at_noon()).unwrap();
        assert!(!without.contains("52.2"), "{without}");
        assert_eq!(field_count(&without), 22);
    }

    #[test]
    fn emergency_flags_appear_in_identity_rows() {
        let mut mm = ModesMessage::default();
        mm.msg_type = 5;
        mm.aa = [0x40, 0x01, 0x23];
        mm.identity = 7700;
        mm.fs = 2;

        let row = format_message(&mm, None, at_noon()).unwrap();
        assert!(row.ends_with("7700,-1,-1,0,0"), "{row}");
    }

    #[test]
    fn velocity_row_has_speed_track_and_rate() {
        let mut mm = ModesMessage::default();
        mm.msg_type = 17;
        mm.me_type = 19;
        mm.me_sub = 1;
        mm.aa = [0x48, 0x50, 0x20];
        mm.velocity = 159;
        mm.heading = 182.9;
        mm.heading_is_valid = true;
        mm.vert_rate = 14;
        mm.vert_rate_sign = 1;

        let row = format_message(&mm, None, at_noon()).unwrap();
        assert!(row.contains(",159,182,"), "{row}");
        assert!(row.contains(",-832,"), "{row}");
    }

    #[test]
    fn parse_round_trips_a_formatted_row() {
        let mut mm = ModesMessage::default();
        mm.msg_type = 17;
        mm.me_type = 4;
        mm.aa = [0x4B, 0x16, 0x21];
        mm.flight = "SAS123".into();

        let row = format_message(&mm, None, at_noon()).unwrap();
        let parsed = parse_line(&row).unwrap();
        match parsed {
            SbsRecord::Msg(msg) => {
                assert_eq!(msg.transmission_type, 1);
                assert_eq!(msg.icao, 0x4B1621);
                assert_eq!(msg.callsign.as_deref(), Some("SAS123"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_extracts_position_fields() {
        let line = "MSG,3,1,1,40621D,1,2024/03/01,12:00:00.000,2024/03/01,12:00:00.000,,38000,,,52.25720,3.91937,,,0,0,0,0";
        let SbsRecord::Msg(msg) = parse_line(line).unwrap() else {
            panic!("not a MSG record");
        };
        assert_eq!(msg.transmission_type, 3);
        assert_eq!(msg.altitude, Some(38_000));
        assert_eq!(msg.lat, Some(52.25720));
        assert_eq!(msg.lon, Some(3.91937));
        assert_eq!(msg.squawk, None);
    }

    #[test]
    fn non_msg_records_are_classified() {
        assert_eq!(parse_line("STA,,5,1,4B1621"), Some(SbsRecord::Other));
        assert_eq!(parse_line("CLK,whatever"), Some(SbsRecord::Other));
        assert_eq!(parse_line("BOGUS,1,2,3"), None);
        assert_eq!(parse_line("MSG,notanumber,1,1,4B1621"), None);
    }
}
