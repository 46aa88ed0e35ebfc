//! Configuration and command-line parsing.

use std::env;

/// Sentinel for "maximum supported gain".
pub const GAIN_MAX: i32 = 999_999;

#[derive(Debug, Clone)]
pub struct Config {
    // Device settings
    pub dev_index: u32,
    /// Tenths of dB; negative requests auto gain, `GAIN_MAX` the top value.
    pub gain: i32,
    pub enable_agc: bool,
    pub freq: u32,
    pub sample_rate: u32,
    /// Frequency correction in ppm.
    pub freq_correction: i32,

    // Input
    pub filename: Option<String>,
    pub loop_file: bool,
    /// Remote SDR, `host:port`.
    pub rtl_tcp: Option<String>,

    // Processing
    pub fix_errors: bool,
    pub check_crc: bool,
    pub aggressive: bool,

    // Output
    pub raw: bool,
    pub onlyaddr: bool,
    pub metric: bool,
    pub interactive: bool,
    pub interactive_rows: usize,
    /// Seconds of silence before an aircraft is dropped.
    pub interactive_ttl: u64,
    /// Messages required before an aircraft shows up in output.
    pub min_messages: u64,

    // Receiver position, used for distances and receiver.json
    pub receiver_lat: Option<f64>,
    pub receiver_lon: Option<f64>,

    // Networking
    pub net: bool,
    pub net_only: bool,
    pub net_ro_port: u16,
    pub net_ri_port: u16,
    pub net_http_port: u16,
    pub net_sbs_port: u16,
    pub net_sbs_in_port: u16,
    /// Pull a RAW feed from this `host:port` instead of listening.
    pub raw_in_connect: Option<String>,
    /// Pull an SBS feed from this `host:port` instead of listening.
    pub sbs_in_connect: Option<String>,
    /// CIDR deny-list entries, v4 or v6.
    pub deny: Vec<String>,

    // Web
    pub web_dir: Option<String>,
    pub web_index: String,

    pub stats: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dev_index: 0,
            gain: GAIN_MAX,
            enable_agc: false,
            freq: 1_090_000_000,
            sample_rate: 2_000_000,
            freq_correction: 0,
            filename: None,
            loop_file: false,
            rtl_tcp: None,
            fix_errors: true,
            check_crc: true,
            aggressive: false,
            raw: false,
            onlyaddr: false,
            metric: false,
            interactive: false,
            interactive_rows: 15,
            interactive_ttl: 60,
            min_messages: 1,
            receiver_lat: None,
            receiver_lon: None,
            net: false,
            net_only: false,
            net_ro_port: 30002,
            net_ri_port: 30001,
            net_http_port: 8080,
            net_sbs_port: 30003,
            net_sbs_in_port: 30004,
            raw_in_connect: None,
            sbs_in_connect: None,
            deny: Vec::new(),
            web_dir: None,
            web_index: "gmap.html".to_string(),
            stats: false,
        }
    }
}

impl Config {
    pub fn from_args() -> Self {
        Self::parse(env::args().skip(1))
    }

    fn parse(args: impl Iterator<Item = String>) -> Self {
        let args: Vec<String> = args.collect();
        let mut config = Config::default();

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--device-index" => {
                    i += 1;
                    config.dev_index = args.get(i).and_then(|s| s.parse().ok()).unwrap_or(0);
                }
                "--gain" => {
                    i += 1;
                    config.gain = args
                        .get(i)
                        .and_then(|s| s.parse::<f64>().ok())
                        .map(|g| (g * 10.0) as i32)
                        .unwrap_or(GAIN_MAX);
                }
                "--enable-agc" => config.enable_agc = true,
                "--freq" => {
                    i += 1;
                    config.freq = args
                        .get(i)
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(1_090_000_000);
                }
                "--ppm" => {
                    i += 1;
                    config.freq_correction =
                        args.get(i).and_then(|s| s.parse().ok()).unwrap_or(0);
                }
                "--ifile" => {
                    i += 1;
                    config.filename = args.get(i).cloned();
                }
                "--loop" => config.loop_file = true,
                "--rtl-tcp" => {
                    i += 1;
                    config.rtl_tcp = args.get(i).cloned();
                }
                "--no-fix" => config.fix_errors = false,
                "--no-crc-check" => config.check_crc = false,
                "--aggressive" => config.aggressive = true,
                "--raw" => config.raw = true,
                "--onlyaddr" => config.onlyaddr = true,
                "--metric" => config.metric = true,
                "--imperial" => config.metric = false,
                "--interactive" => config.interactive = true,
                "--interactive-rows" => {
                    i += 1;
                    config.interactive_rows =
                        args.get(i).and_then(|s| s.parse().ok()).unwrap_or(15);
                }
                "--interactive-ttl" => {
                    i += 1;
                    config.interactive_ttl =
                        args.get(i).and_then(|s| s.parse().ok()).unwrap_or(60);
                }
                "--min-messages" => {
                    i += 1;
                    config.min_messages = args.get(i).and_then(|s| s.parse().ok()).unwrap_or(1);
                }
                "--lat" => {
                    i += 1;
                    config.receiver_lat = args.get(i).and_then(|s| s.parse().ok());
                }
                "--lon" => {
                    i += 1;
                    config.receiver_lon = args.get(i).and_then(|s| s.parse().ok());
                }
                "--net" => config.net = true,
                "--net-only" => {
                    config.net = true;
                    config.net_only = true;
                }
                "--net-ro-port" => {
                    i += 1;
                    config.net_ro_port =
                        args.get(i).and_then(|s| s.parse().ok()).unwrap_or(30002);
                }
                "--net-ri-port" => {
                    i += 1;
                    config.net_ri_port =
                        args.get(i).and_then(|s| s.parse().ok()).unwrap_or(30001);
                }
                "--net-http-port" => {
                    i += 1;
                    config.net_http_port =
                        args.get(i).and_then(|s| s.parse().ok()).unwrap_or(8080);
                }
                "--net-sbs-port" => {
                    i += 1;
                    config.net_sbs_port =
                        args.get(i).and_then(|s| s.parse().ok()).unwrap_or(30003);
                }
                "--net-sbs-in-port" => {
                    i += 1;
                    config.net_sbs_in_port =
                        args.get(i).and_then(|s| s.parse().ok()).unwrap_or(30004);
                }
                "--net-connect-raw" => {
                    i += 1;
                    config.raw_in_connect = args.get(i).cloned();
                }
                "--net-connect-sbs" => {
                    i += 1;
                    config.sbs_in_connect = args.get(i).cloned();
                }
                "--deny" => {
                    i += 1;
                    if let Some(entry) = args.get(i) {
                        config.deny.push(entry.clone());
                    }
                }
                "--web-dir" => {
                    i += 1;
                    config.web_dir = args.get(i).cloned();
                }
                "--web-index" => {
                    i += 1;
                    if let Some(index) = args.get(i) {
                        config.web_index = index.trim_start_matches('/').to_string();
                    }
                }
                "--stats" => config.stats = true,
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown option: {other}");
                    print_help();
                    std::process::exit(1);
                }
            }
            i += 1;
        }

        config
    }
}

fn print_help() {
    println!(
        r#"rx1090 - Mode S / ADS-B receiver, decoder and relay

Usage: rx1090 [OPTIONS]

Options:
  --device-index <N>      Select RTL device (default: 0)
  --gain <db>             Set gain in dB (default: max; negative for auto)
  --enable-agc            Enable automatic gain control
  --freq <hz>             Tune frequency (default: 1090 MHz)
  --ppm <n>               Frequency correction in ppm (default: 0)
  --ifile <filename>      Read IQ samples from a file ('-' for stdin)
  --loop                  With --ifile, replay the file forever
  --rtl-tcp <host:port>   Read IQ samples from a remote rtl_tcp server
  --no-fix                Disable single-bit CRC repair
  --no-crc-check          Accept frames with bad CRC (discouraged)
  --aggressive            Also try two-bit CRC repair (more CPU)
  --raw                   Print frames as raw hex lines
  --onlyaddr              Print only ICAO addresses
  --metric                Use metric units in interactive mode
  --imperial              Use imperial units in interactive mode
  --interactive           Live table of aircraft on the terminal
  --interactive-rows <N>  Max rows in interactive mode (default: 15)
  --interactive-ttl <s>   Drop aircraft after <s> idle seconds (default: 60)
  --min-messages <N>      Messages needed before an aircraft shows (default: 1)
  --lat <degrees>         Receiver latitude for distance calculation
  --lon <degrees>         Receiver longitude for distance calculation
  --net                   Enable network services
  --net-only              Network services without any local SDR input
  --net-ro-port <port>    RAW output port (default: 30002)
  --net-ri-port <port>    RAW input port (default: 30001)
  --net-http-port <port>  HTTP server port (default: 8080)
  --net-sbs-port <port>   SBS output port (default: 30003)
  --net-sbs-in-port <p>   SBS input port (default: 30004)
  --net-connect-raw <h:p> Pull a RAW feed from an upstream host
  --net-connect-sbs <h:p> Pull an SBS feed from an upstream host
  --deny <cidr>           Refuse connections from this range (repeatable)
  --web-dir <dir>         Serve web assets from a directory
  --web-index <file>      Page '/' redirects to (default: gmap.html)
  --stats                 Print statistics on exit
  --help                  Show this help
"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.freq, 1_090_000_000);
        assert_eq!(c.sample_rate, 2_000_000);
        assert_eq!(c.net_ro_port, 30002);
        assert!(c.fix_errors);
        assert!(c.check_crc);
        assert!(!c.aggressive);
    }

    #[test]
    fn gain_is_stored_in_tenths() {
        assert_eq!(parse(&["--gain", "40.2"]).gain, 402);
        assert_eq!(parse(&["--gain", "-10"]).gain, -100);
        assert_eq!(parse(&[]).gain, GAIN_MAX);
    }

    #[test]
    fn net_only_implies_net() {
        let c = parse(&["--net-only"]);
        assert!(c.net && c.net_only);
    }

    #[test]
    fn deny_entries_accumulate() {
        let c = parse(&["--deny", "10.0.0.0/8", "--deny", "2001:db8::/32"]);
        assert_eq!(c.deny, vec!["10.0.0.0/8", "2001:db8::/32"]);
    }

    #[test]
    fn connectors_and_ports() {
        let c = parse(&[
            "--net",
            "--net-connect-raw",
            "feed.example:30002",
            "--net-sbs-in-port",
            "31004",
            "--rtl-tcp",
            "sdr.local:1234",
        ]);
        assert_eq!(c.raw_in_connect.as_deref(), Some("feed.example:30002"));
        assert_eq!(c.net_sbs_in_port, 31004);
        assert_eq!(c.rtl_tcp.as_deref(), Some("sdr.local:1234"));
    }

    #[test]
    fn web_index_strips_leading_slash() {
        let c = parse(&["--web-index", "/map.html"]);
        assert_eq!(c.web_index, "map.html");
    }
}
