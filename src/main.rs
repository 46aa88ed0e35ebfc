//! rx1090: Mode S / ADS-B receiver, decoder and multi-protocol relay.
//!
//! Samples come from a local RTL-SDR (via `rtl_sdr`), a remote rtl_tcp
//! server, or a replay file; decoded traffic fans out over RAW, SBS and
//! HTTP while RAW and SBS feeds from other receivers merge back in.

mod aircraft;
mod config;
mod cpr;
mod crc;
mod decoder;
mod demodulator;
mod geo;
mod http;
mod icao;
mod magnitude;
mod network;
mod rtl_tcp;
mod sbs;
mod stats;

use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::aircraft::{AircraftStore, ShowState};
use crate::config::Config;
use crate::decoder::ModesMessage;
use crate::demodulator::{Demodulator, MODES_DATA_LEN, MODES_OVERLAP_LEN};
use crate::icao::IcaoCache;
use crate::network::{AccessControl, Cidr, Pipeline};
use crate::stats::Stats;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_args();

    // Logging would fight the interactive display for the terminal.
    if !config.interactive {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
        info!("rx1090 starting");
    }

    let cache = Arc::new(IcaoCache::new());
    let stats = Arc::new(Stats::new());
    let home = config.receiver_lat.zip(config.receiver_lon);
    let store = Arc::new(RwLock::new(AircraftStore::new(
        Duration::from_secs(config.interactive_ttl),
        config.min_messages,
        home,
    )));

    let mut deny = Vec::new();
    for entry in &config.deny {
        match Cidr::parse(entry) {
            Some(cidr) => deny.push(cidr),
            None => warn!("ignoring malformed deny entry {entry:?}"),
        }
    }
    let access = Arc::new(AccessControl::new(deny));

    let pipeline = Pipeline::new(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&stats),
    );

    let (msg_tx, msg_rx): (Sender<ModesMessage>, Receiver<ModesMessage>) = bounded(1024);

    // Decoded messages are consumed off the async runtime: registry
    // updates, console output and network fan-out.
    let processor = {
        let pipeline = pipeline.clone();
        let config = config.clone();
        std::thread::spawn(move || process_messages(msg_rx, pipeline, config))
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        if config.net {
            let p = pipeline.clone();
            let a = Arc::clone(&access);
            tokio::spawn(async move {
                if let Err(e) = network::run_servers(p, a).await {
                    error!("network services failed: {e}");
                    std::process::exit(1);
                }
            });
        }

        if let Some(ref addr) = config.raw_in_connect {
            let p = pipeline.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                if let Err(e) = network::run_raw_in_client(addr, p).await {
                    error!("raw feed failed: {e}");
                    std::process::exit(1);
                }
            });
        }
        if let Some(ref addr) = config.sbs_in_connect {
            let p = pipeline.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                if let Err(e) = network::run_sbs_in_client(addr, p).await {
                    error!("SBS feed failed: {e}");
                    std::process::exit(1);
                }
            });
        }

        // Stale-track eviction and dead-reckoning tick.
        {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                loop {
                    interval.tick().await;
                    let now = Instant::now();
                    let mut store = store.write();
                    store.remove_stale(now);
                    store.propagate_estimates(now);
                }
            });
        }

        let display = if config.interactive {
            let store = Arc::clone(&store);
            let config = config.clone();
            Some(tokio::spawn(async move {
                interactive_display(store, config).await;
            }))
        } else {
            None
        };

        // Sample acquisition.
        if !config.net_only {
            run_acquisition(&config, &cache, &stats, msg_tx.clone()).await;
        }
        drop(msg_tx);

        if config.interactive {
            println!("\nInput finished. Press Ctrl+C to exit...");
            tokio::signal::ctrl_c().await.ok();
        } else if config.net_only || config.rtl_tcp.is_some() {
            info!("waiting for network traffic, Ctrl+C to exit");
            tokio::signal::ctrl_c().await.ok();
        }

        if let Some(handle) = display {
            handle.abort();
        }
    });

    // Dropping the runtime cancels the remaining tasks and with them the
    // last decode-channel senders, which lets the processor drain and exit.
    drop(rt);
    drop(pipeline);
    processor.join().ok();

    if config.stats {
        println!("{stats}");
    }
    Ok(())
}

/// Pick and run the configured sample source until it ends or fails.
async fn run_acquisition(
    config: &Config,
    cache: &Arc<IcaoCache>,
    stats: &Arc<Stats>,
    msg_tx: Sender<ModesMessage>,
) {
    let demodulator = Arc::new(Demodulator::new(
        config.clone(),
        Arc::clone(cache),
        Arc::clone(stats),
    ));

    if let Some(filename) = config.filename.clone() {
        if !config.interactive {
            info!("reading samples from {filename}");
        }
        let d = Arc::clone(&demodulator);
        let result =
            tokio::task::spawn_blocking(move || d.process_file(&filename, &msg_tx)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("error reading sample file: {e}"),
            Err(e) => error!("sample reader panicked: {e}"),
        }
    } else if config.rtl_tcp.is_some() {
        let d = Arc::clone(&demodulator);
        let cfg = config.clone();
        tokio::spawn(async move {
            if let Err(e) = rtl_tcp::run_client(cfg, d, msg_tx).await {
                error!("rtl_tcp source failed: {e}");
                std::process::exit(1);
            }
        });
    } else {
        if let Err(e) = run_rtlsdr_subprocess(config, &demodulator, &msg_tx).await {
            error!("RTL-SDR input failed: {e}");
            if !config.interactive {
                eprintln!("\nMake sure rtl-sdr is installed and the dongle is plugged in,");
                eprintln!("or use --ifile, --rtl-tcp or --net-only instead.");
            }
        }
    }
}

/// Read IQ samples from the stock `rtl_sdr` capture tool.
async fn run_rtlsdr_subprocess(
    config: &Config,
    demodulator: &Demodulator,
    msg_tx: &Sender<ModesMessage>,
) -> Result<(), Box<dyn std::error::Error>> {
    use std::process::Stdio;
    use tokio::io::AsyncReadExt;
    use tokio::process::Command;

    let mut cmd = Command::new("rtl_sdr");
    cmd.arg("-d")
        .arg(config.dev_index.to_string())
        .arg("-f")
        .arg(config.freq.to_string())
        .arg("-s")
        .arg(config.sample_rate.to_string())
        .arg("-p")
        .arg(config.freq_correction.to_string())
        .arg("-g")
        .arg(if config.gain < 0 {
            "0".to_string()
        } else if config.gain == config::GAIN_MAX {
            "49.6".to_string()
        } else {
            format!("{:.1}", config.gain as f64 / 10.0)
        })
        .arg("-")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn()?;
    let mut stdout = child.stdout.take().ok_or("no stdout from rtl_sdr")?;

    let mut data = vec![127u8; MODES_OVERLAP_LEN + MODES_DATA_LEN];

    loop {
        data.copy_within(MODES_DATA_LEN.., 0);

        let mut filled = 0;
        while filled < MODES_DATA_LEN {
            match stdout
                .read(&mut data[MODES_OVERLAP_LEN + filled..])
                .await
            {
                Ok(0) => return Ok(()),
                Ok(n) => filled += n,
                Err(e) => return Err(e.into()),
            }
        }

        demodulator.process_iq(&data, msg_tx);
    }
}

/// Drain the decode channel: registry plus console plus network fan-out.
fn process_messages(rx: Receiver<ModesMessage>, pipeline: Pipeline, config: Config) {
    while let Ok(mm) = rx.recv() {
        pipeline.dispatch(&mm);

        if config.interactive {
            continue;
        }
        if config.raw {
            println!("{}", mm.to_raw_string());
        } else if config.onlyaddr {
            println!("{:06X}", mm.icao_address());
        } else {
            println!("{mm}");
        }
    }
}

/// Live aircraft table, refreshed four times a second.
async fn interactive_display(store: Arc<RwLock<AircraftStore>>, config: Config) {
    const RED: &str = "\x1B[91m";
    const YELLOW: &str = "\x1B[93m";
    const DIM: &str = "\x1B[2m";
    const BOLD: &str = "\x1B[1m";
    const RESET: &str = "\x1B[0m";

    let has_home = store.read().home().is_some();

    loop {
        tokio::time::sleep(Duration::from_millis(250)).await;

        print!("\x1B[2J\x1B[H");

        if has_home {
            println!(
                "{BOLD}{:<7} {:<9} {:>5} {:>7} {:>5} {:>4} {:>6} {:>8} {:>7} {:>6} {:>4}{RESET}",
                "Hex", "Flight", "Sq", "Alt", "Spd", "Trk", "VRt", "Dist", "RSSI", "Msgs", "Age"
            );
        } else {
            println!(
                "{BOLD}{:<7} {:<9} {:>5} {:>7} {:>5} {:>4} {:>6} {:>9} {:>10} {:>7} {:>6} {:>4}{RESET}",
                "Hex", "Flight", "Sq", "Alt", "Spd", "Trk", "VRt", "Lat", "Lon", "RSSI", "Msgs",
                "Age"
            );
        }
        let width = if has_home { 81 } else { 97 };
        println!("{}", "-".repeat(width));

        let store = store.read();
        let now = Instant::now();
        let mut aircraft: Vec<_> = store.all().collect();
        aircraft.sort_by(|a, b| b.seen.cmp(&a.seen));
        let count = aircraft.len();

        for a in aircraft.iter().take(config.interactive_rows) {
            let color = match a.squawk {
                7500 | 7700 => RED,
                7600 => YELLOW,
                _ if a.show == ShowState::LastTime => DIM,
                _ => "",
            };

            let (alt, spd) = if config.metric {
                ((a.altitude as f64 / 3.2808) as i32, (a.speed as f64 * 1.852) as u16)
            } else {
                (a.altitude, a.speed)
            };
            let alt = if alt != 0 { alt.to_string() } else { String::new() };
            let spd = if spd != 0 { spd.to_string() } else { String::new() };
            let trk = if a.track_valid {
                a.track.to_string()
            } else {
                String::new()
            };
            let sq = if a.squawk != 0 {
                format!("{:04}", a.squawk)
            } else {
                String::new()
            };
            let rssi = if a.rssi.is_empty() {
                String::new()
            } else {
                format!("{:.1}", a.rssi.power_db())
            };
            let vrt = a.vert_rate.map(|r| format!("{r:+}")).unwrap_or_default();

            if has_home {
                let dist = match a.est_distance_km.or(a.distance_km) {
                    Some(km) if config.metric => format!("{km:.1}km"),
                    Some(km) => format!("{:.1}nm", km * 0.539957),
                    None => String::new(),
                };
                println!(
                    "{color}{:<7} {:<9} {:>5} {:>7} {:>5} {:>4} {:>6} {:>8} {:>7} {:>6} {:>3}s{RESET}",
                    a.hex_addr,
                    a.flight,
                    sq,
                    alt,
                    spd,
                    trk,
                    vrt,
                    dist,
                    rssi,
                    a.messages,
                    a.age_secs(now)
                );
            } else {
                let (lat, lon) = match a.position {
                    Some((lat, lon)) => (format!("{lat:.4}"), format!("{lon:.4}")),
                    None => (String::new(), String::new()),
                };
                println!(
                    "{color}{:<7} {:<9} {:>5} {:>7} {:>5} {:>4} {:>6} {:>9} {:>10} {:>7} {:>6} {:>3}s{RESET}",
                    a.hex_addr,
                    a.flight,
                    sq,
                    alt,
                    spd,
                    trk,
                    vrt,
                    lat,
                    lon,
                    rssi,
                    a.messages,
                    a.age_secs(now)
                );
            }

            match a.squawk {
                7500 => println!("{RED}  HIJACK (7500){RESET}"),
                7600 => println!("{YELLOW}  RADIO FAILURE (7600){RESET}"),
                7700 => println!("{RED}  EMERGENCY (7700){RESET}"),
                _ => {}
            }
        }

        println!("{}", "-".repeat(width));
        println!(
            "Aircraft: {count} | {} | Ctrl+C to exit",
            if config.metric { "metric" } else { "imperial" }
        );
        io::stdout().flush().ok();
    }
}
