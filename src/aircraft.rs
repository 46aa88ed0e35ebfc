//! Aircraft registry.
//!
//! One entry per ICAO address, created when a validated message first
//! mentions the address and evicted after a period of silence. Position
//! comes from paired CPR frames; between position reports the registry
//! dead-reckons an estimated position from the last speed and track.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::cpr;
use crate::decoder::{AltitudeUnit, CommB, ModesMessage};
use crate::geo;
use crate::sbs::SbsMsg;

/// Maximum age difference between the odd and even CPR halves.
const CPR_PAIR_MAX_AGE: Duration = Duration::from_secs(600);
/// An aircraft in `Normal` switches to `LastTime` this long before eviction.
const LAST_TIME_WINDOW: Duration = Duration::from_millis(1000);
/// Speed/track older than this no longer drive estimation.
const ESTIMATE_MAX_AGE: Duration = Duration::from_secs(60);

/// Display lifecycle of a tracked aircraft. Transitions only run forward:
/// `FirstTime → Normal → LastTime → None` (removal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowState {
    FirstTime,
    Normal,
    LastTime,
    None,
}

/// Ring of the last four per-message power readings (unit interval).
#[derive(Debug, Clone, Default)]
pub struct SignalRing {
    values: [f32; 4],
    next: usize,
    filled: usize,
}

impl SignalRing {
    pub fn push(&mut self, power: f32) {
        self.values[self.next] = power;
        self.next = (self.next + 1) % self.values.len();
        self.filled = (self.filled + 1).min(self.values.len());
    }

    /// Average power in dBFS. Reads half-scale until the ring has wrapped
    /// once, which damps the very first messages of a track.
    pub fn power_db(&self) -> f32 {
        let sum: f32 = self.values[..self.filled].iter().sum();
        10.0 * (sum / 8.0 + 1.125e-5).log10()
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }
}

#[derive(Debug, Clone)]
pub struct Aircraft {
    pub addr: u32,
    pub hex_addr: String,
    pub flight: String,
    pub altitude: i32,
    /// Ground speed in knots.
    pub speed: u16,
    /// Track in degrees 0..360.
    pub track: u16,
    pub track_valid: bool,
    pub helicopter: bool,
    /// Emitter category as reported in identification frames, e.g. "A3".
    pub category: Option<String>,
    pub show: ShowState,
    pub seen_first: Instant,
    pub seen: Instant,
    /// Last time the estimated position was advanced.
    pub est_seen: Instant,
    pub squawk: u16,
    pub messages: u64,
    pub rssi: SignalRing,
    /// Vertical rate in ft/min, from velocity squitters or BDS 6,0.
    pub vert_rate: Option<i32>,
    /// MCP/FCU selected altitude (BDS 4,0).
    pub selected_altitude: Option<u32>,
    /// Barometric pressure setting in mb (BDS 4,0).
    pub baro_setting: Option<f32>,
    /// Roll angle in degrees (BDS 5,0).
    pub roll_angle: Option<f32>,
    pub true_airspeed: Option<u16>,
    pub indicated_airspeed: Option<u16>,
    pub mach: Option<f32>,
    pub magnetic_heading: Option<f32>,
    pub odd_cpr: (u32, u32),
    pub even_cpr: (u32, u32),
    pub odd_cpr_time: Option<Instant>,
    pub even_cpr_time: Option<Instant>,
    /// Last CPR-decoded position.
    pub position: Option<(f64, f64)>,
    pub position_time: Option<Instant>,
    /// Dead-reckoned position, re-seeded on every real fix.
    pub est_position: Option<(f64, f64)>,
    /// Great-circle distance to the receiver, km.
    pub distance_km: Option<f64>,
    pub est_distance_km: Option<f64>,
}

impl Aircraft {
    fn new(addr: u32, now: Instant) -> Self {
        Self {
            addr,
            hex_addr: format!("{addr:06X}"),
            flight: String::new(),
            altitude: 0,
            speed: 0,
            track: 0,
            track_valid: false,
            helicopter: false,
            category: None,
            show: ShowState::FirstTime,
            seen_first: now,
            seen: now,
            est_seen: now,
            squawk: 0,
            messages: 0,
            rssi: SignalRing::default(),
            vert_rate: None,
            selected_altitude: None,
            baro_setting: None,
            roll_angle: None,
            true_airspeed: None,
            indicated_airspeed: None,
            mach: None,
            magnetic_heading: None,
            odd_cpr: (0, 0),
            even_cpr: (0, 0),
            odd_cpr_time: None,
            even_cpr_time: None,
            position: None,
            position_time: None,
            est_position: None,
            distance_km: None,
            est_distance_km: None,
        }
    }

    /// Seconds since the last message.
    pub fn age_secs(&self, now: Instant) -> u64 {
        now.duration_since(self.seen).as_secs()
    }
}

pub struct AircraftStore {
    aircraft: HashMap<u32, Aircraft>,
    ttl: Duration,
    /// Messages required before an aircraft shows up in output.
    min_messages: u64,
    /// Receiver location for distance computation.
    home: Option<(f64, f64)>,
}

impl AircraftStore {
    pub fn new(ttl: Duration, min_messages: u64, home: Option<(f64, f64)>) -> Self {
        Self {
            aircraft: HashMap::new(),
            ttl,
            min_messages,
            home,
        }
    }

    /// Apply a validated message.
    pub fn update_from_message(&mut self, mm: &ModesMessage, now: Instant) -> Option<&Aircraft> {
        let addr = mm.icao_address();
        if addr == 0 {
            return None;
        }

        let home = self.home;
        let aircraft = self
            .aircraft
            .entry(addr)
            .or_insert_with(|| Aircraft::new(addr, now));
        aircraft.seen = now;
        aircraft.messages += 1;
        if aircraft.show == ShowState::FirstTime && aircraft.messages > 1 {
            aircraft.show = ShowState::Normal;
        }
        if mm.signal_power > 0.0 {
            aircraft.rssi.push(mm.signal_power);
        }

        match mm.msg_type {
            0 | 4 | 16 | 20 => {
                if mm.unit == AltitudeUnit::Feet {
                    aircraft.altitude = mm.altitude;
                }
            }
            5 | 21 => {
                if mm.identity != 0 {
                    aircraft.squawk = mm.identity;
                }
            }
            17 => match mm.me_type {
                1..=4 => {
                    if !mm.flight.is_empty() {
                        aircraft.flight = mm.flight.clone();
                    }
                    let class = match mm.me_type {
                        4 => 'A',
                        3 => 'B',
                        2 => 'C',
                        _ => 'D',
                    };
                    aircraft.category = Some(format!("{class}{}", mm.aircraft_category));
                    // Emitter category A7 is a rotorcraft.
                    aircraft.helicopter = mm.me_type == 4 && mm.aircraft_category == 7;
                }
                9..=18 => {
                    aircraft.altitude = mm.altitude;
                    if mm.fflag {
                        aircraft.odd_cpr = (mm.raw_latitude, mm.raw_longitude);
                        aircraft.odd_cpr_time = Some(now);
                    } else {
                        aircraft.even_cpr = (mm.raw_latitude, mm.raw_longitude);
                        aircraft.even_cpr_time = Some(now);
                    }
                    Self::try_decode_position(aircraft, home, mm.fflag, now);
                }
                19 => {
                    if mm.me_sub == 1 || mm.me_sub == 2 {
                        aircraft.speed = mm.velocity;
                        if mm.heading_is_valid {
                            aircraft.track = (mm.heading as u16) % 360;
                            aircraft.track_valid = true;
                        }
                        if let Some(rate) = mm.vertical_rate() {
                            aircraft.vert_rate = Some(rate);
                        }
                    } else if (mm.me_sub == 3 || mm.me_sub == 4) && mm.heading_is_valid {
                        aircraft.track = (mm.heading as u16) % 360;
                        aircraft.track_valid = true;
                    }
                }
                _ => {}
            },
            _ => {}
        }

        if let Some(ref cb) = mm.comm_b {
            Self::apply_comm_b(aircraft, cb);
        }

        self.aircraft.get(&addr)
    }

    /// Fold a recovered Comm-B register into the track.
    fn apply_comm_b(aircraft: &mut Aircraft, cb: &CommB) {
        match cb {
            CommB::AircraftIdent { callsign } => {
                if aircraft.flight.is_empty() {
                    aircraft.flight = callsign.clone();
                }
            }
            CommB::SelectedIntent {
                mcp_altitude,
                baro_setting,
                ..
            } => {
                if let Some(alt) = mcp_altitude {
                    aircraft.selected_altitude = Some(*alt);
                }
                if let Some(baro) = baro_setting {
                    aircraft.baro_setting = Some(*baro);
                }
            }
            CommB::TrackAndTurn {
                roll_angle,
                true_track,
                ground_speed,
                true_airspeed,
                ..
            } => {
                if let Some(roll) = roll_angle {
                    aircraft.roll_angle = Some(*roll);
                }
                if let Some(gs) = ground_speed {
                    aircraft.speed = *gs;
                }
                if let Some(track) = true_track {
                    aircraft.track = (*track as u16) % 360;
                    aircraft.track_valid = true;
                }
                if let Some(tas) = true_airspeed {
                    aircraft.true_airspeed = Some(*tas);
                }
            }
            CommB::HeadingAndSpeed {
                magnetic_heading,
                indicated_airspeed,
                mach,
                baro_rate,
                ..
            } => {
                if let Some(hdg) = magnetic_heading {
                    aircraft.magnetic_heading = Some(*hdg);
                }
                if let Some(ias) = indicated_airspeed {
                    aircraft.indicated_airspeed = Some(*ias);
                }
                if let Some(m) = mach {
                    aircraft.mach = Some(*m);
                }
                if let Some(rate) = baro_rate {
                    aircraft.vert_rate = Some(*rate);
                }
            }
            _ => {}
        }
    }

    fn try_decode_position(
        aircraft: &mut Aircraft,
        home: Option<(f64, f64)>,
        latest_is_odd: bool,
        now: Instant,
    ) {
        let (Some(odd_t), Some(even_t)) = (aircraft.odd_cpr_time, aircraft.even_cpr_time) else {
            return;
        };
        let gap = if odd_t > even_t {
            odd_t.duration_since(even_t)
        } else {
            even_t.duration_since(odd_t)
        };
        if gap > CPR_PAIR_MAX_AGE {
            return;
        }

        let decoded = cpr::decode_airborne(
            aircraft.even_cpr.0,
            aircraft.even_cpr.1,
            aircraft.odd_cpr.0,
            aircraft.odd_cpr.1,
            latest_is_odd,
        );
        if let Some((lat, lon)) = decoded {
            aircraft.position = Some((lat, lon));
            aircraft.position_time = Some(now);
            aircraft.est_position = Some((lat, lon));
            aircraft.est_seen = now;
            if let Some((hlat, hlon)) = home {
                let d = geo::great_circle_km(hlat, hlon, lat, lon);
                aircraft.distance_km = Some(d);
                aircraft.est_distance_km = Some(d);
            }
        }
    }

    /// Apply an inbound BaseStation record. SBS rows carry decoded fields,
    /// so positions land directly without CPR pairing.
    pub fn update_from_sbs(&mut self, msg: &SbsMsg, now: Instant) -> Option<&Aircraft> {
        if msg.icao == 0 {
            return None;
        }
        let home = self.home;
        let aircraft = self
            .aircraft
            .entry(msg.icao)
            .or_insert_with(|| Aircraft::new(msg.icao, now));
        aircraft.seen = now;
        aircraft.messages += 1;
        if aircraft.show == ShowState::FirstTime && aircraft.messages > 1 {
            aircraft.show = ShowState::Normal;
        }

        if let Some(ref callsign) = msg.callsign {
            aircraft.flight = callsign.clone();
        }
        if let Some(alt) = msg.altitude {
            aircraft.altitude = alt;
        }
        if let Some(gs) = msg.ground_speed {
            aircraft.speed = gs.round() as u16;
        }
        if let Some(track) = msg.track {
            aircraft.track = (track.rem_euclid(360.0)) as u16;
            aircraft.track_valid = true;
        }
        if let Some(squawk) = msg.squawk {
            aircraft.squawk = squawk;
        }
        if let (Some(lat), Some(lon)) = (msg.lat, msg.lon) {
            if lat.abs() <= 90.0 && lon.abs() <= 180.0 {
                aircraft.position = Some((lat, lon));
                aircraft.position_time = Some(now);
                aircraft.est_position = Some((lat, lon));
                aircraft.est_seen = now;
                if let Some((hlat, hlon)) = home {
                    let d = geo::great_circle_km(hlat, hlon, lat, lon);
                    aircraft.distance_km = Some(d);
                    aircraft.est_distance_km = Some(d);
                }
            }
        }

        self.aircraft.get(&msg.icao)
    }

    /// Advance estimated positions for aircraft with usable speed and track.
    pub fn propagate_estimates(&mut self, now: Instant) {
        let home = self.home;
        for aircraft in self.aircraft.values_mut() {
            let Some((lat, lon)) = aircraft.est_position else {
                continue;
            };
            if !aircraft.track_valid
                || aircraft.speed == 0
                || now.duration_since(aircraft.seen) > ESTIMATE_MAX_AGE
            {
                continue;
            }
            let elapsed = now.duration_since(aircraft.est_seen);
            if elapsed < Duration::from_millis(250) {
                continue;
            }

            let km = geo::knots_to_km(aircraft.speed as f64, elapsed.as_millis() as u64);
            let (nlat, nlon) = geo::project(lat, lon, aircraft.track as f64, km);
            aircraft.est_position = Some((nlat, nlon));
            aircraft.est_seen = now;
            if let Some((hlat, hlon)) = home {
                let gc = geo::great_circle_km(hlat, hlon, nlat, nlon);
                let eq = geo::equirectangular_km(hlat, hlon, nlat, nlon);
                aircraft.est_distance_km = Some(gc.min(eq));
            }
        }
    }

    /// Run the eviction state machine.
    pub fn remove_stale(&mut self, now: Instant) {
        let ttl = self.ttl;
        for aircraft in self.aircraft.values_mut() {
            let idle = now.duration_since(aircraft.seen);
            match aircraft.show {
                ShowState::FirstTime if now.duration_since(aircraft.seen_first) >= Duration::from_secs(1) => {
                    aircraft.show = ShowState::Normal;
                }
                ShowState::Normal if idle + LAST_TIME_WINDOW >= ttl => {
                    aircraft.show = ShowState::LastTime;
                }
                _ => {}
            }
        }
        self.aircraft.retain(|_, a| {
            if now.duration_since(a.seen) <= ttl {
                true
            } else {
                a.show = ShowState::None;
                false
            }
        });
    }

    pub fn get(&self, addr: u32) -> Option<&Aircraft> {
        self.aircraft.get(&addr)
    }

    /// Aircraft that passed the ghost filter.
    pub fn all(&self) -> impl Iterator<Item = &Aircraft> {
        let min = self.min_messages;
        self.aircraft.values().filter(move |a| a.messages >= min)
    }

    pub fn len(&self) -> usize {
        self.all().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn home(&self) -> Option<(f64, f64)> {
        self.home
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> AircraftStore {
        AircraftStore::new(Duration::from_millis(60_000), 1, None)
    }

    fn message(addr: u32, df: u8) -> ModesMessage {
        let mut mm = ModesMessage::default();
        mm.msg_type = df;
        mm.crc_ok = true;
        mm.aa = [(addr >> 16) as u8, (addr >> 8) as u8, addr as u8];
        mm
    }

    #[test]
    fn first_message_creates_aircraft() {
        let mut s = store();
        let now = Instant::now();
        s.update_from_message(&message(0x4B1621, 11), now);
        let a = s.get(0x4B1621).expect("created");
        assert_eq!(a.hex_addr, "4B1621");
        assert_eq!(a.messages, 1);
        assert_eq!(a.show, ShowState::FirstTime);
    }

    #[test]
    fn zero_address_is_ignored() {
        let mut s = store();
        assert!(s.update_from_message(&message(0, 11), Instant::now()).is_none());
        assert!(s.is_empty());
    }

    #[test]
    fn eviction_timeline() {
        let mut s = store();
        let t0 = Instant::now();
        s.update_from_message(&message(0xABCDEF, 11), t0);
        s.update_from_message(&message(0xABCDEF, 11), t0);

        s.remove_stale(t0 + Duration::from_millis(30_000));
        assert_eq!(s.get(0xABCDEF).unwrap().show, ShowState::Normal);

        s.remove_stale(t0 + Duration::from_millis(59_000));
        assert_eq!(s.get(0xABCDEF).unwrap().show, ShowState::LastTime);

        s.remove_stale(t0 + Duration::from_millis(60_001));
        assert!(s.get(0xABCDEF).is_none());
    }

    #[test]
    fn identity_and_altitude_updates() {
        let mut s = store();
        let now = Instant::now();

        let mut ident = message(0x400123, 5);
        ident.identity = 7700;
        s.update_from_message(&ident, now);
        assert_eq!(s.get(0x400123).unwrap().squawk, 7700);

        let mut alt = message(0x400123, 4);
        alt.altitude = 35_000;
        s.update_from_message(&alt, now);
        assert_eq!(s.get(0x400123).unwrap().altitude, 35_000);
    }

    #[test]
    fn flight_and_helicopter_category() {
        let mut s = store();
        let now = Instant::now();

        let mut ident = message(0x4B1621, 17);
        ident.me_type = 4;
        ident.me_sub = 7;
        ident.aircraft_category = 7;
        ident.flight = "RESCUE1".into();
        s.update_from_message(&ident, now);

        let a = s.get(0x4B1621).unwrap();
        assert_eq!(a.flight, "RESCUE1");
        assert!(a.helicopter);
    }

    #[test]
    fn cpr_pair_yields_position() {
        let mut s = AircraftStore::new(Duration::from_millis(60_000), 1, Some((52.0, 4.0)));
        let now = Instant::now();

        let mut odd = message(0x40621D, 17);
        odd.me_type = 11;
        odd.fflag = true;
        odd.raw_latitude = 74158;
        odd.raw_longitude = 50194;
        s.update_from_message(&odd, now);
        assert!(s.get(0x40621D).unwrap().position.is_none());

        let mut even = message(0x40621D, 17);
        even.me_type = 11;
        even.fflag = false;
        even.raw_latitude = 93000;
        even.raw_longitude = 51372;
        s.update_from_message(&even, now + Duration::from_secs(1));

        let a = s.get(0x40621D).unwrap();
        let (lat, lon) = a.position.expect("pair should decode");
        assert!((lat - 52.25720).abs() < 0.001, "lat {lat}");
        assert!((lon - 3.91937).abs() < 0.001, "lon {lon}");
        assert!(a.distance_km.is_some());
        assert_eq!(a.position, a.est_position);
    }

    #[test]
    fn stale_cpr_half_does_not_pair() {
        let mut s = store();
        let t0 = Instant::now();

        let mut odd = message(0x40621D, 17);
        odd.me_type = 11;
        odd.fflag = true;
        odd.raw_latitude = 74158;
        odd.raw_longitude = 50194;
        s.update_from_message(&odd, t0);

        let mut even = message(0x40621D, 17);
        even.me_type = 11;
        even.raw_latitude = 93000;
        even.raw_longitude = 51372;
        s.update_from_message(&even, t0 + Duration::from_secs(700));
        assert!(s.get(0x40621D).unwrap().position.is_none());
    }

    #[test]
    fn velocity_updates_speed_and_track() {
        let mut s = store();
        let mut vel = message(0x4B1621, 17);
        vel.me_type = 19;
        vel.me_sub = 1;
        vel.velocity = 450;
        vel.heading = 92.7;
        vel.heading_is_valid = true;
        s.update_from_message(&vel, Instant::now());

        let a = s.get(0x4B1621).unwrap();
        assert_eq!(a.speed, 450);
        assert_eq!(a.track, 92);
        assert!(a.track_valid);
    }

    #[test]
    fn estimates_propagate_along_track() {
        let mut s = store();
        let t0 = Instant::now();

        let mut vel = message(0x4B1621, 17);
        vel.me_type = 19;
        vel.me_sub = 1;
        vel.velocity = 450;
        vel.heading = 90.0;
        vel.heading_is_valid = true;
        s.update_from_message(&vel, t0);

        // Seed a position by hand; CPR is exercised elsewhere.
        {
            let a = s.aircraft.get_mut(&0x4B1621).unwrap();
            a.position = Some((52.0, 4.0));
            a.est_position = Some((52.0, 4.0));
            a.est_seen = t0;
        }

        s.propagate_estimates(t0 + Duration::from_secs(30));
        let (lat, lon) = s.get(0x4B1621).unwrap().est_position.unwrap();
        assert!((lat - 52.0).abs() < 0.001, "track 90 keeps latitude, {lat}");
        // 450 kt east for 30 s is ~6.9 km, ~0.1 degree at 52N.
        assert!(lon > 4.05 && lon < 4.15, "lon {lon}");
    }

    #[test]
    fn ghost_filter_hides_single_message_tracks() {
        let mut s = AircraftStore::new(Duration::from_millis(60_000), 2, None);
        let now = Instant::now();
        s.update_from_message(&message(0x111111, 11), now);
        assert_eq!(s.len(), 0);
        s.update_from_message(&message(0x111111, 11), now);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn comm_b_registers_enrich_the_track() {
        let mut s = store();
        let now = Instant::now();

        let mut ident = message(0x400123, 20);
        ident.comm_b = Some(CommB::AircraftIdent {
            callsign: "BAW256".into(),
        });
        s.update_from_message(&ident, now);
        assert_eq!(s.get(0x400123).unwrap().flight, "BAW256");

        let mut hdg = message(0x400123, 21);
        hdg.comm_b = Some(CommB::HeadingAndSpeed {
            magnetic_heading: Some(92.5),
            indicated_airspeed: Some(250),
            mach: Some(0.78),
            baro_rate: Some(-1200),
            inertial_rate: None,
        });
        s.update_from_message(&hdg, now);

        let a = s.get(0x400123).unwrap();
        assert_eq!(a.indicated_airspeed, Some(250));
        assert_eq!(a.mach, Some(0.78));
        assert_eq!(a.vert_rate, Some(-1200));

        // An ADS-B callsign is not overwritten by later Comm-B idents.
        let mut other = message(0x400123, 20);
        other.comm_b = Some(CommB::AircraftIdent {
            callsign: "XXX999".into(),
        });
        s.update_from_message(&other, now);
        assert_eq!(s.get(0x400123).unwrap().flight, "BAW256");
    }

    #[test]
    fn sbs_record_updates_track_directly() {
        let mut s = store();
        let msg = SbsMsg {
            transmission_type: 3,
            icao: 0x4B1621,
            altitude: Some(38_000),
            lat: Some(52.2),
            lon: Some(3.9),
            ..Default::default()
        };
        s.update_from_sbs(&msg, Instant::now());

        let a = s.get(0x4B1621).unwrap();
        assert_eq!(a.altitude, 38_000);
        assert_eq!(a.position, Some((52.2, 3.9)));
    }

    #[test]
    fn signal_ring_power() {
        let mut ring = SignalRing::default();
        assert!(ring.is_empty());
        for _ in 0..4 {
            ring.push(0.04);
        }
        // 10*log10(0.16/8 + eps) = 10*log10(0.02) ≈ -17 dBFS.
        let db = ring.power_db();
        assert!((db + 17.0).abs() < 0.1, "db {db}");

        // Ring keeps only the last four values.
        for _ in 0..4 {
            ring.push(0.0);
        }
        assert!(ring.power_db() < -40.0);
    }
}
