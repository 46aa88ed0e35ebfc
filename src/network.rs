//! Network services.
//!
//! Listening side: RAW output (30002), RAW input (30001), SBS output
//! (30003), SBS input (30004) and HTTP. Active side: RAW and SBS feeds
//! pulled from upstream hosts. Every accept runs through the deny list
//! and the unique-source-address table first.
//!
//! Decoded traffic moves through a [`Pipeline`]: registry update plus
//! fan-out to the RAW and SBS broadcast channels, shared by the local
//! demodulator and all network ingest paths.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::Local;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::aircraft::AircraftStore;
use crate::config::Config;
use crate::decoder::{self, ModesMessage};
use crate::http;
use crate::icao::IcaoCache;
use crate::sbs::{self, SbsRecord};
use crate::stats::{self, Stats};

const BROADCAST_CAPACITY: usize = 1024;
/// Readsb-style keep-alive line accepted silently on RAW input.
const RAW_HEARTBEAT: &str = "*0000;";
/// Handshake timeout for active connections.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum NetError {
    #[error("failed to bind {0}: {1}")]
    Bind(String, io::Error),
    #[error("failed to connect to {0}: {1}")]
    Connect(String, io::Error),
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("no data from {0} within the timeout")]
    DataTimeout(String),
    #[error("{0} closed the stream")]
    StreamClosed(String),
    #[error("malformed rtl_tcp welcome frame")]
    BadWelcome,
    #[error("configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Identifies a service in logs and in the unique-address table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceTag {
    RawIn,
    RawOut,
    SbsIn,
    SbsOut,
    Http,
    RtlTcp,
}

impl ServiceTag {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceTag::RawIn => "raw-in",
            ServiceTag::RawOut => "raw-out",
            ServiceTag::SbsIn => "sbs-in",
            ServiceTag::SbsOut => "sbs-out",
            ServiceTag::Http => "http",
            ServiceTag::RtlTcp => "rtl-tcp",
        }
    }
}

/// A parsed deny-list entry, IPv4 or IPv6 with a prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cidr {
    V4 { net: u32, mask: u32 },
    V6 { net: u128, mask: u128 },
}

impl Cidr {
    /// Parse `a.b.c.d`, `a.b.c.d/nn`, `x::y` or `x::y/nn`.
    pub fn parse(text: &str) -> Option<Cidr> {
        let (addr, prefix) = match text.split_once('/') {
            Some((a, p)) => (a, Some(p.parse::<u32>().ok()?)),
            None => (text, None),
        };
        if let Ok(v4) = addr.parse::<Ipv4Addr>() {
            let bits = prefix.unwrap_or(32);
            if bits > 32 {
                return None;
            }
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
            return Some(Cidr::V4 {
                net: u32::from(v4) & mask,
                mask,
            });
        }
        if let Ok(v6) = addr.parse::<Ipv6Addr>() {
            let bits = prefix.unwrap_or(128);
            if bits > 128 {
                return None;
            }
            let mask = if bits == 0 {
                0
            } else {
                u128::MAX << (128 - bits)
            };
            return Some(Cidr::V6 {
                net: u128::from(v6) & mask,
                mask,
            });
        }
        None
    }

    pub fn matches(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (Cidr::V4 { net, mask }, IpAddr::V4(v4)) => u32::from(v4) & mask == *net,
            (Cidr::V6 { net, mask }, IpAddr::V6(v6)) => u128::from(v6) & mask == *net,
            // A v4-mapped v6 peer still has to honor v4 deny entries.
            (Cidr::V4 { net, mask }, IpAddr::V6(v6)) => v6
                .to_ipv4_mapped()
                .is_some_and(|v4| u32::from(v4) & mask == *net),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub first_seen: SystemTime,
    pub accepts: u64,
    pub denies: u64,
}

/// Deny list plus unique-source bookkeeping, consulted on every accept.
pub struct AccessControl {
    deny: Vec<Cidr>,
    peers: Mutex<HashMap<(IpAddr, ServiceTag), PeerRecord>>,
}

impl AccessControl {
    pub fn new(deny: Vec<Cidr>) -> Self {
        Self {
            deny,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Record the accept attempt; false means the peer is denied.
    pub fn allow(&self, service: ServiceTag, ip: IpAddr) -> bool {
        let denied = self.deny.iter().any(|c| c.matches(ip));
        let mut peers = self.peers.lock();
        let record = peers.entry((ip, service)).or_insert_with(|| PeerRecord {
            first_seen: SystemTime::now(),
            accepts: 0,
            denies: 0,
        });
        if denied {
            record.denies += 1;
        } else {
            record.accepts += 1;
        }
        !denied
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}

/// Shared decode-and-fan-out context.
#[derive(Clone)]
pub struct Pipeline {
    pub config: Config,
    pub store: Arc<RwLock<AircraftStore>>,
    pub cache: Arc<IcaoCache>,
    pub stats: Arc<Stats>,
    pub raw_tx: broadcast::Sender<String>,
    pub sbs_tx: broadcast::Sender<String>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        store: Arc<RwLock<AircraftStore>>,
        cache: Arc<IcaoCache>,
        stats: Arc<Stats>,
    ) -> Self {
        let (raw_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (sbs_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            config,
            store,
            cache,
            stats,
            raw_tx,
            sbs_tx,
        }
    }

    /// Route an accepted message: registry update, RAW and SBS fan-out.
    pub fn dispatch(&self, mm: &ModesMessage) {
        if !mm.crc_ok && self.config.check_crc {
            return;
        }
        Stats::bump(&self.stats.messages);

        let position = {
            let mut store = self.store.write();
            store
                .update_from_message(mm, Instant::now())
                .and_then(|a| a.position)
        };

        let _ = self.raw_tx.send(mm.to_raw_string());
        if let Some(row) = sbs::format_message(mm, position, Local::now()) {
            let _ = self.sbs_tx.send(row);
        }
    }

    /// One line of RAW input: `*hex;`, heart-beats, or garbage.
    pub fn ingest_raw_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            Stats::bump(&self.stats.raw_empty);
            return;
        }
        if line == RAW_HEARTBEAT {
            Stats::bump(&self.stats.raw_good);
            return;
        }
        match decoder::decode_hex_message(
            line,
            self.config.fix_errors,
            self.config.aggressive,
            &self.cache,
        ) {
            Some(mm) => {
                Stats::bump(&self.stats.raw_good);
                stats::account_frame(&self.stats, &mm);
                self.dispatch(&mm);
            }
            None => {
                Stats::bump(&self.stats.raw_unrecognized);
            }
        }
    }

    /// One line of SBS input; only `MSG,` records change state.
    pub fn ingest_sbs_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match sbs::parse_line(line) {
            Some(SbsRecord::Msg(msg)) => {
                Stats::bump(&self.stats.sbs_msg);
                let mut store = self.store.write();
                store.update_from_sbs(&msg, Instant::now());
            }
            Some(SbsRecord::Other) => {
                Stats::bump(&self.stats.sbs_other);
            }
            None => {
                Stats::bump(&self.stats.sbs_unrecognized);
            }
        }
    }
}

/// Bind and run every configured listening service. Active clients are
/// spawned by `main` because their failure tears the process down.
pub async fn run_servers(pipeline: Pipeline, access: Arc<AccessControl>) -> Result<(), NetError> {
    let mut tasks = Vec::new();

    {
        let p = pipeline.clone();
        let a = Arc::clone(&access);
        let port = pipeline.config.net_ro_port;
        tasks.push(tokio::spawn(async move {
            let tx = p.raw_tx.clone();
            if let Err(e) =
                run_broadcast_listener(ServiceTag::RawOut, port, tx, p.stats.clone(), a).await
            {
                error!("raw output server: {e}");
                std::process::exit(1);
            }
        }));
    }
    {
        let p = pipeline.clone();
        let a = Arc::clone(&access);
        let port = pipeline.config.net_ri_port;
        tasks.push(tokio::spawn(async move {
            if let Err(e) = run_raw_input_listener(port, p, a).await {
                error!("raw input server: {e}");
                std::process::exit(1);
            }
        }));
    }
    {
        let p = pipeline.clone();
        let a = Arc::clone(&access);
        let port = pipeline.config.net_sbs_port;
        tasks.push(tokio::spawn(async move {
            let tx = p.sbs_tx.clone();
            if let Err(e) =
                run_broadcast_listener(ServiceTag::SbsOut, port, tx, p.stats.clone(), a).await
            {
                error!("SBS output server: {e}");
                std::process::exit(1);
            }
        }));
    }
    {
        let p = pipeline.clone();
        let a = Arc::clone(&access);
        let port = pipeline.config.net_sbs_in_port;
        tasks.push(tokio::spawn(async move {
            if let Err(e) = run_sbs_input_listener(port, p, a).await {
                error!("SBS input server: {e}");
                std::process::exit(1);
            }
        }));
    }
    {
        let p = pipeline.clone();
        let a = Arc::clone(&access);
        let port = pipeline.config.net_http_port;
        tasks.push(tokio::spawn(async move {
            if let Err(e) = http::run_server(port, p, a).await {
                error!("HTTP server: {e}");
                std::process::exit(1);
            }
        }));
    }

    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

/// Serve one broadcast channel (RAW or SBS output) to every client.
async fn run_broadcast_listener(
    service: ServiceTag,
    port: u16,
    tx: broadcast::Sender<String>,
    stats: Arc<Stats>,
    access: Arc<AccessControl>,
) -> Result<(), NetError> {
    let bind = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&bind)
        .await
        .map_err(|e| NetError::Bind(bind, e))?;
    info!("{} listening on port {}", service.name(), port);

    loop {
        let (socket, addr) = listener.accept().await?;
        if !access.allow(service, addr.ip()) {
            log_denied(&stats, service, addr.ip());
            drop(socket);
            continue;
        }
        debug!("{} client connected: {}", service.name(), addr);

        let mut rx = tx.subscribe();
        tokio::spawn(async move {
            let mut socket = socket;
            loop {
                match rx.recv().await {
                    Ok(line) => {
                        if socket.write_all(line.as_bytes()).await.is_err()
                            || socket.write_all(b"\n").await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("client {} lagged {} messages", addr, n);
                        continue;
                    }
                    Err(_) => break,
                }
            }
            debug!("client disconnected: {}", addr);
        });
    }
}

async fn run_raw_input_listener(
    port: u16,
    pipeline: Pipeline,
    access: Arc<AccessControl>,
) -> Result<(), NetError> {
    let bind = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&bind)
        .await
        .map_err(|e| NetError::Bind(bind, e))?;
    info!("raw-in listening on port {}", port);

    loop {
        let (socket, addr) = listener.accept().await?;
        if !access.allow(ServiceTag::RawIn, addr.ip()) {
            log_denied(&pipeline.stats, ServiceTag::RawIn, addr.ip());
            drop(socket);
            continue;
        }
        debug!("raw-in client connected: {}", addr);

        let p = pipeline.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(socket).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                p.ingest_raw_line(&line);
            }
            debug!("raw-in client disconnected: {}", addr);
        });
    }
}

async fn run_sbs_input_listener(
    port: u16,
    pipeline: Pipeline,
    access: Arc<AccessControl>,
) -> Result<(), NetError> {
    let bind = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&bind)
        .await
        .map_err(|e| NetError::Bind(bind, e))?;
    info!("sbs-in listening on port {}", port);

    loop {
        let (socket, addr) = listener.accept().await?;
        if !access.allow(ServiceTag::SbsIn, addr.ip()) {
            log_denied(&pipeline.stats, ServiceTag::SbsIn, addr.ip());
            drop(socket);
            continue;
        }
        debug!("sbs-in client connected: {}", addr);

        let p = pipeline.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(socket).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                p.ingest_sbs_line(&line);
            }
            debug!("sbs-in client disconnected: {}", addr);
        });
    }
}

/// Pull a RAW feed from an upstream host. Failure is fatal to the caller.
pub async fn run_raw_in_client(addr: String, pipeline: Pipeline) -> Result<(), NetError> {
    let stream = connect(&addr).await?;
    info!("raw-in connected to {}", addr);

    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => pipeline.ingest_raw_line(&line),
            Ok(None) => return Err(NetError::StreamClosed(addr)),
            Err(e) => return Err(NetError::Io(e)),
        }
    }
}

/// Pull an SBS feed from an upstream host. Failure is fatal to the caller.
pub async fn run_sbs_in_client(addr: String, pipeline: Pipeline) -> Result<(), NetError> {
    let stream = connect(&addr).await?;
    info!("sbs-in connected to {}", addr);

    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => pipeline.ingest_sbs_line(&line),
            Ok(None) => return Err(NetError::StreamClosed(addr)),
            Err(e) => return Err(NetError::Io(e)),
        }
    }
}

async fn connect(addr: &str) -> Result<TcpStream, NetError> {
    timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| NetError::ConnectTimeout(addr.to_string()))?
        .map_err(|e| NetError::Connect(addr.to_string(), e))
}

/// Deny-list rejection bookkeeping shared by every listener.
fn log_denied(stats: &Stats, service: ServiceTag, ip: IpAddr) {
    Stats::bump(&stats.denied_accepts);
    warn!("{}: denied connection from {}", service.name(), ip);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn pipeline() -> Pipeline {
        let config = Config::default();
        let store = Arc::new(RwLock::new(AircraftStore::new(
            StdDuration::from_millis(60_000),
            1,
            None,
        )));
        Pipeline::new(
            config,
            store,
            Arc::new(IcaoCache::new()),
            Arc::new(Stats::new()),
        )
    }

    #[test]
    fn cidr_v4_matching() {
        let cidr = Cidr::parse("10.0.0.0/8").unwrap();
        assert!(cidr.matches("10.1.2.3".parse().unwrap()));
        assert!(!cidr.matches("11.1.2.3".parse().unwrap()));

        let single = Cidr::parse("192.168.1.7").unwrap();
        assert!(single.matches("192.168.1.7".parse().unwrap()));
        assert!(!single.matches("192.168.1.8".parse().unwrap()));
    }

    #[test]
    fn cidr_v6_matching() {
        let cidr = Cidr::parse("2001:db8::/32").unwrap();
        assert!(cidr.matches("2001:db8::1".parse().unwrap()));
        assert!(!cidr.matches("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn cidr_v4_entry_catches_mapped_v6_peer() {
        let cidr = Cidr::parse("10.0.0.0/8").unwrap();
        assert!(cidr.matches("::ffff:10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn cidr_rejects_garbage() {
        assert!(Cidr::parse("not-an-address").is_none());
        assert!(Cidr::parse("10.0.0.0/33").is_none());
        assert!(Cidr::parse("::1/129").is_none());
    }

    #[test]
    fn access_control_denies_and_counts() {
        let access = AccessControl::new(vec![Cidr::parse("10.0.0.0/8").unwrap()]);
        let denied: IpAddr = "10.1.1.1".parse().unwrap();
        let allowed: IpAddr = "192.168.0.1".parse().unwrap();

        assert!(!access.allow(ServiceTag::RawIn, denied));
        assert!(access.allow(ServiceTag::RawIn, allowed));
        assert!(access.allow(ServiceTag::SbsIn, allowed));
        assert_eq!(access.peer_count(), 3);
    }

    #[test]
    fn heartbeats_count_without_side_effects() {
        let p = pipeline();
        let mut raw_rx = p.raw_tx.subscribe();

        for _ in 0..5 {
            p.ingest_raw_line("*0000;");
        }

        assert_eq!(Stats::get(&p.stats.raw_good), 5);
        assert!(p.store.read().is_empty(), "no aircraft from heart-beats");
        assert!(raw_rx.try_recv().is_err(), "no RAW_OUT emission");
    }

    #[test]
    fn raw_line_reaches_registry_and_fanout() {
        let p = pipeline();
        let mut raw_rx = p.raw_tx.subscribe();
        let mut sbs_rx = p.sbs_tx.subscribe();

        p.ingest_raw_line("*8D4840D6202CC371C32CE0576098;");

        assert_eq!(Stats::get(&p.stats.raw_good), 1);
        assert_eq!(Stats::get(&p.stats.good_crc), 1);
        let store = p.store.read();
        let a = store.get(0x4840D6).expect("aircraft created");
        assert_eq!(a.flight, "KLM1023");
        drop(store);

        assert_eq!(
            raw_rx.try_recv().unwrap(),
            "*8D4840D6202CC371C32CE0576098;"
        );
        let row = sbs_rx.try_recv().unwrap();
        assert!(row.starts_with("MSG,1,1,1,4840D6,1,"), "{row}");
        assert!(row.contains("KLM1023"), "{row}");
    }

    #[test]
    fn corrupted_raw_line_is_repaired_and_counted() {
        let p = pipeline();
        // Flip one hex-visible bit of the KLM frame (byte 5: 2C -> 2D).
        p.ingest_raw_line("*8D4840D6202DC371C32CE0576098;");

        assert_eq!(Stats::get(&p.stats.single_bit_fixed), 1);
        assert_eq!(Stats::get(&p.stats.good_crc), 1);
        assert!(p.store.read().get(0x4840D6).is_some());
    }

    #[test]
    fn malformed_raw_lines_hit_the_right_counters() {
        let p = pipeline();
        p.ingest_raw_line("");
        p.ingest_raw_line("   ");
        p.ingest_raw_line("garbage");
        p.ingest_raw_line("*XYZ;");

        assert_eq!(Stats::get(&p.stats.raw_empty), 2);
        assert_eq!(Stats::get(&p.stats.raw_unrecognized), 2);
        assert_eq!(Stats::get(&p.stats.raw_good), 0);
    }

    #[test]
    fn sbs_records_are_classified_and_applied() {
        let p = pipeline();
        p.ingest_sbs_line("STA,,5,1,4B1621");
        p.ingest_sbs_line(
            "MSG,3,1,1,40621D,1,2024/03/01,12:00:00.000,2024/03/01,12:00:00.000,,38000,,,52.25,3.91,,,0,0,0,0",
        );
        p.ingest_sbs_line("totally wrong");

        assert_eq!(Stats::get(&p.stats.sbs_other), 1);
        assert_eq!(Stats::get(&p.stats.sbs_msg), 1);
        assert_eq!(Stats::get(&p.stats.sbs_unrecognized), 1);
        assert_eq!(
            p.store.read().get(0x40621D).unwrap().position,
            Some((52.25, 3.91))
        );
    }

    #[test]
    fn bad_crc_raw_line_is_not_dispatched() {
        let p = pipeline();
        // DF4 with an address nobody vouched for.
        p.ingest_raw_line("*20000F1F684A6C;");
        assert_eq!(Stats::get(&p.stats.raw_good), 1);
        assert_eq!(Stats::get(&p.stats.icao_cache_misses), 1);
        assert!(p.store.read().is_empty());
    }
}
