//! Minimal HTTP server for the JSON feeds and the bundled map page.
//!
//! Hand-rolled over `TcpStream` rather than a framework: the surface is
//! five fixed routes plus static files, served either from a directory
//! on disk or from the compiled-in bundle.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::aircraft::Aircraft;
use crate::network::{AccessControl, NetError, Pipeline, ServiceTag};
use crate::stats::Stats;

/// 1x1 transparent PNG served for both favicon flavors.
const FAVICON_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

/// Fallback index page when no web directory is configured.
const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>rx1090</title>
<style>
body { font-family: monospace; background: #101418; color: #d8dee9; margin: 2em; }
table { border-collapse: collapse; }
td, th { padding: 2px 12px; text-align: right; }
th { border-bottom: 1px solid #d8dee9; }
td:first-child, th:first-child { text-align: left; }
</style>
</head>
<body>
<h2>rx1090</h2>
<p id="status">loading...</p>
<table>
<thead><tr><th>Hex</th><th>Flight</th><th>Squawk</th><th>Alt</th><th>Spd</th><th>Trk</th><th>Lat</th><th>Lon</th><th>Msgs</th></tr></thead>
<tbody id="aircraft"></tbody>
</table>
<script>
async function refresh() {
  const r = await fetch('data/aircraft.json');
  const data = await r.json();
  document.getElementById('status').textContent =
    data.aircraft.length + ' aircraft, ' + data.messages + ' messages';
  document.getElementById('aircraft').innerHTML = data.aircraft.map(a =>
    '<tr><td>' + a.hex + '</td><td>' + (a.flight || '') + '</td><td>' +
    (a.squawk || '') + '</td><td>' + (a.altitude || '') + '</td><td>' +
    (a.speed || '') + '</td><td>' + (a.track || '') + '</td><td>' +
    (a.lat != null ? a.lat.toFixed(4) : '') + '</td><td>' +
    (a.lon != null ? a.lon.toFixed(4) : '') + '</td><td>' + a.messages +
    '</td></tr>').join('');
}
refresh();
setInterval(refresh, 1000);
</script>
</body>
</html>
"#;

/// Where static files come from.
pub trait AssetSource: Send + Sync {
    fn fetch(&self, path: &str) -> Option<Asset>;
}

pub struct Asset {
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

/// Static files read from a directory on disk.
pub struct DirAssets {
    root: PathBuf,
}

impl DirAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AssetSource for DirAssets {
    fn fetch(&self, path: &str) -> Option<Asset> {
        let rel = path.trim_start_matches('/');
        // Refuse anything that could escape the web root.
        if rel.is_empty() || rel.split('/').any(|c| c == ".." || c.is_empty()) {
            return None;
        }
        let full = self.root.join(rel);
        let body = std::fs::read(&full).ok()?;
        Some(Asset {
            content_type: content_type_for(&full),
            body,
        })
    }
}

/// The compiled-in bundle: just the status page.
pub struct EmbeddedAssets;

impl AssetSource for EmbeddedAssets {
    fn fetch(&self, path: &str) -> Option<Asset> {
        match path {
            "/gmap.html" | "/index.html" => Some(Asset {
                content_type: "text/html;charset=utf-8",
                body: INDEX_HTML.as_bytes().to_vec(),
            }),
            _ => None,
        }
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html;charset=utf-8",
        Some("js") => "application/javascript;charset=utf-8",
        Some("css") => "text/css;charset=utf-8",
        Some("json") => "application/json;charset=utf-8",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

#[derive(Serialize)]
struct LegacyAircraft {
    hex: String,
    flight: String,
    lat: f64,
    lon: f64,
    altitude: i32,
    track: u16,
    speed: u16,
}

#[derive(Serialize)]
struct AircraftJson {
    hex: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    flight: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    squawk: Option<String>,
    #[serde(rename = "category", skip_serializing_if = "Option::is_none")]
    category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lon: Option<f64>,
    altitude: i32,
    track: u16,
    speed: u16,
    messages: u64,
    seen: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    seen_pos: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rssi: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    distance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vert_rate: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ias: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tas: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mach: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    roll: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mag_hdg: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sel_alt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    baro: Option<f32>,
}

#[derive(Serialize)]
struct AircraftSnapshot {
    now: f64,
    messages: u64,
    aircraft: Vec<AircraftJson>,
}

#[derive(Serialize)]
struct ReceiverJson {
    version: &'static str,
    refresh: u64,
    history: u32,
    lat: f64,
    lon: f64,
}

fn legacy_entry(a: &Aircraft) -> LegacyAircraft {
    let (lat, lon) = a.position.unwrap_or((0.0, 0.0));
    LegacyAircraft {
        hex: a.hex_addr.clone(),
        flight: a.flight.clone(),
        lat,
        lon,
        altitude: a.altitude,
        track: a.track,
        speed: a.speed,
    }
}

fn extended_entry(a: &Aircraft, now: Instant) -> AircraftJson {
    AircraftJson {
        hex: a.hex_addr.clone(),
        flight: (!a.flight.is_empty()).then(|| a.flight.clone()),
        squawk: (a.squawk != 0).then(|| format!("{:04}", a.squawk)),
        category: a.category.clone(),
        lat: a.position.map(|p| p.0),
        lon: a.position.map(|p| p.1),
        altitude: a.altitude,
        track: a.track,
        speed: a.speed,
        messages: a.messages,
        seen: a.age_secs(now),
        seen_pos: a
            .position_time
            .map(|t| now.duration_since(t).as_secs()),
        rssi: (!a.rssi.is_empty()).then(|| a.rssi.power_db()),
        distance: a.distance_km,
        vert_rate: a.vert_rate,
        ias: a.indicated_airspeed,
        tas: a.true_airspeed,
        mach: a.mach,
        roll: a.roll_angle,
        mag_hdg: a.magnetic_heading,
        sel_alt: a.selected_altitude,
        baro: a.baro_setting,
    }
}

fn legacy_json(pipeline: &Pipeline) -> String {
    let store = pipeline.store.read();
    let list: Vec<LegacyAircraft> = store.all().map(legacy_entry).collect();
    serde_json::to_string(&list).unwrap_or_else(|_| "[]".into())
}

fn aircraft_json(pipeline: &Pipeline) -> String {
    let now = Instant::now();
    let unix_now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let store = pipeline.store.read();
    let snapshot = AircraftSnapshot {
        now: unix_now,
        messages: Stats::get(&pipeline.stats.messages),
        aircraft: store.all().map(|a| extended_entry(a, now)).collect(),
    };
    serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".into())
}

fn receiver_json(pipeline: &Pipeline) -> String {
    let home = pipeline.store.read().home();
    let json = ReceiverJson {
        version: env!("CARGO_PKG_VERSION"),
        refresh: 1000,
        history: 0,
        lat: home.map_or(0.0, |h| h.0),
        lon: home.map_or(0.0, |h| h.1),
    };
    serde_json::to_string(&json).unwrap_or_else(|_| "{}".into())
}

/// A routed response, before serialization.
pub struct Response {
    pub status: u16,
    pub reason: &'static str,
    pub content_type: &'static str,
    pub body: Vec<u8>,
    pub location: Option<String>,
    pub cors: bool,
}

impl Response {
    fn json(body: String) -> Self {
        Self {
            status: 200,
            reason: "OK",
            content_type: "application/json;charset=utf-8",
            body: body.into_bytes(),
            location: None,
            cors: true,
        }
    }

    fn asset(asset: Asset) -> Self {
        Self {
            status: 200,
            reason: "OK",
            content_type: asset.content_type,
            body: asset.body,
            location: None,
            cors: false,
        }
    }

    fn redirect(to: String) -> Self {
        Self {
            status: 301,
            reason: "Moved Permanently",
            content_type: "text/plain",
            body: Vec::new(),
            location: Some(to),
            cors: false,
        }
    }

    fn error(status: u16, reason: &'static str) -> Self {
        Self {
            status,
            reason,
            content_type: "text/plain",
            body: reason.as_bytes().to_vec(),
            location: None,
            cors: false,
        }
    }
}

/// Map one request to a response.
pub fn route(
    method: &str,
    path: &str,
    pipeline: &Pipeline,
    assets: &dyn AssetSource,
) -> Response {
    if method != "GET" && method != "HEAD" {
        return Response::error(400, "Bad Request");
    }

    // Strip any query string before matching.
    let path = path.split('?').next().unwrap_or(path);

    match path {
        "/" => Response::redirect(format!("/{}", pipeline.config.web_index)),
        "/data.json" => Response::json(legacy_json(pipeline)),
        "/data/aircraft.json" => Response::json(aircraft_json(pipeline)),
        "/data/receiver.json" => Response::json(receiver_json(pipeline)),
        "/favicon.png" | "/favicon.ico" => Response::asset(Asset {
            content_type: if path.ends_with("png") {
                "image/png"
            } else {
                "image/x-icon"
            },
            body: FAVICON_PNG.to_vec(),
        }),
        _ => match assets.fetch(path) {
            Some(asset) => Response::asset(asset),
            None => Response::error(404, "Not Found"),
        },
    }
}

pub async fn run_server(
    port: u16,
    pipeline: Pipeline,
    access: Arc<AccessControl>,
) -> Result<(), NetError> {
    let bind = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&bind)
        .await
        .map_err(|e| NetError::Bind(bind, e))?;
    info!("http listening on port {}", port);

    let assets: Arc<dyn AssetSource> = match pipeline.config.web_dir {
        Some(ref dir) => Arc::new(DirAssets::new(dir.clone())),
        None => Arc::new(EmbeddedAssets),
    };

    loop {
        let (socket, addr) = listener.accept().await?;
        if !access.allow(ServiceTag::Http, addr.ip()) {
            Stats::bump(&pipeline.stats.denied_accepts);
            drop(socket);
            continue;
        }

        let p = pipeline.clone();
        let a = Arc::clone(&assets);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, p, a).await {
                debug!("http {}: {}", addr, e);
            }
        });
    }
}

async fn handle_connection(
    socket: tokio::net::TcpStream,
    pipeline: Pipeline,
    assets: Arc<dyn AssetSource>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await? == 0 {
            return Ok(());
        }
        let request_line = request_line.trim().to_string();
        if request_line.is_empty() {
            continue;
        }

        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("");
        let path = parts.next().unwrap_or("/");
        let version = parts.next().unwrap_or("HTTP/1.0");

        // Drain headers, watching only the connection token.
        let mut connection_header = String::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await? == 0 {
                break;
            }
            let line = line.trim();
            if line.is_empty() {
                break;
            }
            if let Some(v) = line.to_ascii_lowercase().strip_prefix("connection:") {
                connection_header = v.trim().to_string();
            }
        }

        let keepalive = if version == "HTTP/1.1" {
            connection_header != "close"
        } else {
            connection_header == "keep-alive"
        };

        let response = route(method, path, &pipeline, assets.as_ref());

        let mut header = format!(
            "HTTP/1.1 {} {}\r\nServer: rx1090\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: {}\r\n",
            response.status,
            response.reason,
            response.content_type,
            response.body.len(),
            if keepalive { "keep-alive" } else { "close" },
        );
        if let Some(ref to) = response.location {
            header.push_str(&format!("Location: {to}\r\n"));
        }
        if response.cors {
            header.push_str("Access-Control-Allow-Origin: *\r\n");
        }
        header.push_str("\r\n");

        write_half.write_all(header.as_bytes()).await?;
        if method != "HEAD" {
            write_half.write_all(&response.body).await?;
        }
        write_half.flush().await?;

        if !keepalive {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aircraft::AircraftStore;
    use crate::config::Config;
    use crate::icao::IcaoCache;
    use parking_lot::RwLock;
    use std::time::Duration;

    fn pipeline() -> Pipeline {
        let store = Arc::new(RwLock::new(AircraftStore::new(
            Duration::from_millis(60_000),
            1,
            Some((51.5, -0.4)),
        )));
        Pipeline::new(
            Config::default(),
            store,
            Arc::new(IcaoCache::new()),
            Arc::new(Stats::new()),
        )
    }

    fn seed_klm(p: &Pipeline) {
        p.ingest_raw_line("*8D4840D6202CC371C32CE0576098;");
    }

    #[test]
    fn root_redirects_to_index() {
        let p = pipeline();
        let r = route("GET", "/", &p, &EmbeddedAssets);
        assert_eq!(r.status, 301);
        assert_eq!(r.location.as_deref(), Some("/gmap.html"));
    }

    #[test]
    fn non_get_is_rejected() {
        let p = pipeline();
        for method in ["POST", "PUT", "DELETE", "OPTIONS"] {
            let r = route(method, "/data.json", &p, &EmbeddedAssets);
            assert_eq!(r.status, 400, "{method}");
        }
        assert_eq!(route("HEAD", "/data.json", &p, &EmbeddedAssets).status, 200);
    }

    #[test]
    fn data_json_lists_seen_aircraft() {
        let p = pipeline();
        seed_klm(&p);
        let r = route("GET", "/data.json", &p, &EmbeddedAssets);
        assert_eq!(r.status, 200);
        assert!(r.cors);

        let body: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
        let list = body.as_array().expect("legacy body is a bare array");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["hex"], "4840D6");
        assert_eq!(list[0]["flight"], "KLM1023");
    }

    #[test]
    fn aircraft_json_has_envelope_and_optionals() {
        let p = pipeline();
        seed_klm(&p);
        let r = route("GET", "/data/aircraft.json", &p, &EmbeddedAssets);
        let body: serde_json::Value = serde_json::from_slice(&r.body).unwrap();

        assert!(body["now"].as_f64().unwrap() > 1.0e9);
        assert_eq!(body["messages"], 1);
        let ac = &body["aircraft"][0];
        assert_eq!(ac["hex"], "4840D6");
        assert_eq!(ac["flight"], "KLM1023");
        assert_eq!(ac["category"], "A0");
        assert!(ac.get("lat").is_none(), "no position yet");
        assert!(ac["seen"].as_u64().is_some());
    }

    #[test]
    fn receiver_json_reports_home() {
        let p = pipeline();
        let r = route("GET", "/data/receiver.json", &p, &EmbeddedAssets);
        let body: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["refresh"], 1000);
        assert_eq!(body["lat"], 51.5);
        assert_eq!(body["lon"], -0.4);
    }

    #[test]
    fn favicons_are_png_bytes() {
        let p = pipeline();
        let png = route("GET", "/favicon.png", &p, &EmbeddedAssets);
        assert_eq!(png.status, 200);
        assert_eq!(png.content_type, "image/png");
        assert_eq!(&png.body[..4], &[0x89, 0x50, 0x4E, 0x47]);

        let ico = route("GET", "/favicon.ico", &p, &EmbeddedAssets);
        assert_eq!(ico.status, 200);
        assert_eq!(ico.body, png.body);
    }

    #[test]
    fn unknown_path_is_404() {
        let p = pipeline();
        let r = route("GET", "/no/such/file", &p, &EmbeddedAssets);
        assert_eq!(r.status, 404);
    }

    #[test]
    fn embedded_bundle_serves_the_index() {
        let p = pipeline();
        let r = route("GET", "/gmap.html", &p, &EmbeddedAssets);
        assert_eq!(r.status, 200);
        assert!(r.content_type.starts_with("text/html"));
        assert!(String::from_utf8_lossy(&r.body).contains("rx1090"));
    }

    #[test]
    fn dir_assets_refuse_traversal() {
        let d = DirAssets::new("/tmp/definitely-missing-root");
        assert!(d.fetch("/../etc/passwd").is_none());
        assert!(d.fetch("/a//b").is_none());
        assert!(d.fetch("/missing.html").is_none());
    }

    #[test]
    fn query_strings_are_ignored_in_routing() {
        let p = pipeline();
        let r = route("GET", "/data.json?_=12345", &p, &EmbeddedAssets);
        assert_eq!(r.status, 200);
    }
}
