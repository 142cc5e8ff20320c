use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use zw_proto::{Coordinate, Zone, ZoneId};
use zw_store::{doctor as store_doctor, filter_by_name, find_zone, zone_detail, Auth, Credentials, Favorites, FileKv, KvZoneStore, ZoneStore};
use zw_track::doctor as track_doctor;
use zw_track::geo::haversine_m;
use zw_track::gnss::{GnssThresholds, NmeaInput, NmeaSource};
use zw_track::notify::{LogSink, NotificationSink, SpoolSink};
use zw_track::{LocationSource, Session, SessionHandle, WatchOptions, ZoneSelector};

#[derive(Debug, Parser)]
#[command(name = "zonewatch", version, about = "zonewatch - geofence entry/exit tracking")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Doctor,
    Login {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
    Logout,
    Whoami,
    Zones { #[command(subcommand)] cmd: ZonesCmd },
    Favorites { #[command(subcommand)] cmd: FavoritesCmd },
    /// Great-circle distance in metres between two points.
    Distance {
        #[arg(allow_negative_numbers = true)]
        lat1: f64,
        #[arg(allow_negative_numbers = true)]
        lon1: f64,
        #[arg(allow_negative_numbers = true)]
        lat2: f64,
        #[arg(allow_negative_numbers = true)]
        lon2: f64,
    },
    /// Track the active zone until Ctrl-C. Lines on stdin replace the
    /// active zone: `add <lat> <lon> <radius> <name>` or `here <radius> <name>`.
    Run,
}

#[derive(Debug, Subcommand)]
enum ZonesCmd {
    List {
        /// Case-insensitive name filter.
        #[arg(long)]
        query: Option<String>,
    },
    /// One zone with its favorite flag.
    Show { id: String },
    Add {
        #[arg(long)]
        name: String,
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,
        #[arg(long)]
        radius: f64,
        #[arg(long)]
        id: Option<String>,
    },
    /// Add a zone centred on the current position fix.
    Here {
        #[arg(long)]
        name: String,
        #[arg(long)]
        radius: f64,
    },
}

#[derive(Debug, Subcommand)]
enum FavoritesCmd {
    List,
    Add { id: String },
    Remove { id: String },
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    storage: StorageCfg,
    auth: Option<Credentials>,
    location: LocationCfg,
    #[serde(default)]
    session: SessionCfg,
    #[serde(default)]
    notify: NotifyCfg,
}

#[derive(Debug, serde::Deserialize)]
struct StorageCfg { path: String }

#[derive(Debug, serde::Deserialize)]
struct LocationCfg {
    source: String,
    nmea_device: Option<String>,
    nmea_file: Option<String>,
    baud: Option<u32>,
    loop_file: Option<bool>,
    replay_interval_ms: Option<u64>,
    high_accuracy: Option<bool>,
    min_distance_m: Option<f64>,
    min_sats: u8,
    max_hdop: f32,
    max_fix_age_s: u64,
}

#[derive(Debug, Default, serde::Deserialize)]
struct SessionCfg {
    #[serde(default)]
    zone_policy: ZoneSelector,
}

#[derive(Debug, serde::Deserialize)]
struct NotifyCfg {
    sink: String,
    spool_dir: Option<String>,
}

impl Default for NotifyCfg {
    fn default() -> Self {
        Self { sink: "log".to_string(), spool_dir: None }
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    parse_config(&s)
}

fn parse_config(s: &str) -> Result<Config> {
    toml::from_str(s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;
    let kv = FileKv::new(&cfg.storage.path);

    match cli.cmd {
        Command::Doctor => doctor(&cfg, &kv)?,
        Command::Login { username, password } => {
            let user = auth(&cfg, &kv).login(&username, &password)?;
            println!("logged in as {}", user);
        }
        Command::Logout => auth(&cfg, &kv).logout()?,
        Command::Whoami => match auth(&cfg, &kv).current_user()? {
            Some(u) => println!("{}", u),
            None => println!("not logged in"),
        },
        Command::Zones { cmd } => zones_cmd(&cfg, &kv, cmd).await?,
        Command::Favorites { cmd } => favorites_cmd(&cfg, &kv, cmd)?,
        Command::Distance { lat1, lon1, lat2, lon2 } => {
            println!("{:.1}", haversine_m(lat1, lon1, lat2, lon2));
        }
        Command::Run => run(&cfg, &kv).await?,
    }
    Ok(())
}

fn auth(cfg: &Config, kv: &FileKv) -> Auth<FileKv> {
    Auth::new(kv.clone(), cfg.auth.clone().unwrap_or_default())
}

fn require_user(cfg: &Config, kv: &FileKv) -> Result<String> {
    auth(cfg, kv).current_user()?.context("not logged in; run `zonewatch login` first")
}

fn doctor(cfg: &Config, kv: &FileKv) -> Result<()> {
    info!("doctor: starting");

    store_doctor::check_storage(&cfg.storage.path)?;
    let l = &cfg.location;
    track_doctor::check_gnss_thresholds(l.min_sats, l.max_hdop, l.max_fix_age_s)?;
    track_doctor::check_watch_options(&watch_options(cfg))?;
    match l.source.as_str() {
        "nmea-serial" => anyhow::ensure!(l.nmea_device.as_ref().map(|s| !s.is_empty()).unwrap_or(false), "location.nmea_device missing"),
        "nmea-file" => {
            let f = l.nmea_file.as_ref().context("location.nmea_file missing")?;
            anyhow::ensure!(Path::new(f).is_file(), "location.nmea_file not found: {}", f);
        }
        other => anyhow::bail!("unknown location.source: {}", other),
    }
    match cfg.notify.sink.as_str() {
        "log" => {}
        "spool" => {
            let dir = cfg.notify.spool_dir.as_ref().context("notify.spool_dir missing")?;
            let p = Path::new(dir);
            if p.exists() {
                anyhow::ensure!(p.is_dir(), "notify.spool_dir is not a dir: {}", dir);
            }
        }
        other => anyhow::bail!("unknown notify.sink: {}", other),
    }

    match auth(cfg, kv).current_user()? {
        Some(owner) => {
            let zones = KvZoneStore::new(kv.clone()).load_zones(&owner)?;
            for z in &zones {
                track_doctor::check_zone(z)?;
            }
            info!(owner = %owner, zones = zones.len(), "doctor: stored zones OK");
        }
        None => warn!("doctor: nobody logged in; stored zones not checked"),
    }

    info!("doctor: OK");
    Ok(())
}

async fn zones_cmd(cfg: &Config, kv: &FileKv, cmd: ZonesCmd) -> Result<()> {
    let owner = require_user(cfg, kv)?;
    let store = KvZoneStore::new(kv.clone());
    match cmd {
        ZonesCmd::List { query } => {
            let zones = filter_by_name(store.load_zones(&owner)?, query.as_deref().unwrap_or(""));
            for z in zones {
                print_zone(&z);
            }
        }
        ZonesCmd::Show { id } => {
            let id = ZoneId::new(id);
            let d = zone_detail(&store, &Favorites::new(kv.clone()), &owner, &id)?
                .with_context(|| format!("no stored zone with id {}", id))?;
            print_zone(&d.zone);
            println!("favorite: {}", if d.favorite { "yes" } else { "no" });
        }
        ZonesCmd::Add { name, lat, lon, radius, id } => {
            let id = id.map(ZoneId::new).unwrap_or_else(ZoneId::generate);
            let zone = Zone::new(id, name, Coordinate::new(lat, lon), radius);
            track_doctor::check_zone(&zone)?;
            store.append_zone(&owner, &zone)?;
            print_zone(&zone);
        }
        ZonesCmd::Here { name, radius } => {
            let mut src = location_source(cfg)?;
            anyhow::ensure!(src.request_permission().await, "location unavailable (see logs)");
            let here = src.current_position().await.context("current position")?;
            let zone = Zone::new(ZoneId::generate(), name, here, radius);
            track_doctor::check_zone(&zone)?;
            store.append_zone(&owner, &zone)?;
            print_zone(&zone);
        }
    }
    Ok(())
}

fn favorites_cmd(cfg: &Config, kv: &FileKv, cmd: FavoritesCmd) -> Result<()> {
    let owner = require_user(cfg, kv)?;
    let favs = Favorites::new(kv.clone());
    match cmd {
        FavoritesCmd::List => {
            for z in favs.list(&owner)? {
                print_zone(&z);
            }
        }
        FavoritesCmd::Add { id } => {
            let id = ZoneId::new(id);
            let zone = find_zone(&KvZoneStore::new(kv.clone()), &owner, &id)?
                .with_context(|| format!("no stored zone with id {}", id))?;
            let out = favs.add(&owner, &zone)?;
            println!("{} favorites", out.len());
        }
        FavoritesCmd::Remove { id } => {
            let out = favs.remove(&owner, &ZoneId::new(id))?;
            println!("{} favorites", out.len());
        }
    }
    Ok(())
}

async fn run(cfg: &Config, kv: &FileKv) -> Result<()> {
    info!("run: starting");
    let owner = require_user(cfg, kv)?;

    let mut src = location_source(cfg)?;
    let sink = notification_sink(cfg)?;
    let mut session = Session::new(owner, KvZoneStore::new(kv.clone()), sink, cfg.session.zone_policy.clone())
        .with_watch_options(watch_options(cfg));

    let (handle, commands) = SessionHandle::channel(8);
    let interrupt = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("run: interrupt received");
            if let Err(e) = interrupt.shutdown().await {
                warn!("run: shutdown: {:#}", e);
            }
        }
    });

    // blocking stdin reads stay off the runtime so shutdown never waits on them
    let (line_tx, mut lines) = mpsc::channel::<String>(8);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if line_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    let zone_lines = tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            if let Err(e) = zone_line(&handle, &line).await {
                warn!("run: {:#}", e);
            }
        }
    });

    session.run(&mut src, commands).await;
    zone_lines.abort();

    let st = session.state();
    info!(
        position = ?st.current_position,
        zone = ?st.active_zone.as_ref().map(|a| a.zone.id.to_string()),
        inside = st.is_inside,
        "run: stopped"
    );
    Ok(())
}

#[derive(Debug, PartialEq)]
enum ZoneLine {
    Add { center: Coordinate, radius: f64, name: String },
    Here { radius: f64, name: String },
}

/// Parses one stdin line of `run`. Blank lines yield `None`.
fn parse_zone_line(line: &str) -> Result<Option<ZoneLine>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let mut number = |what: &str| -> Result<f64> {
        let w = words.next().with_context(|| format!("missing {}", what))?;
        w.parse().with_context(|| format!("bad {}: {}", what, w))
    };
    let cmd = match verb {
        "add" => {
            let center = Coordinate::new(number("latitude")?, number("longitude")?);
            let radius = number("radius")?;
            ZoneLine::Add { center, radius, name: String::new() }
        }
        "here" => ZoneLine::Here { radius: number("radius")?, name: String::new() },
        other => anyhow::bail!("unknown zone command: {} (expected add or here)", other),
    };
    let rest = words.collect::<Vec<_>>().join(" ");
    anyhow::ensure!(!rest.is_empty(), "missing zone name");
    Ok(Some(match cmd {
        ZoneLine::Add { center, radius, .. } => ZoneLine::Add { center, radius, name: rest },
        ZoneLine::Here { radius, .. } => ZoneLine::Here { radius, name: rest },
    }))
}

/// Makes the zone described by `line` the session's active zone.
async fn zone_line(handle: &SessionHandle, line: &str) -> Result<()> {
    let Some(cmd) = parse_zone_line(line)? else {
        return Ok(());
    };
    let zone = match cmd {
        ZoneLine::Add { center, radius, name } => Zone::new(ZoneId::generate(), name, center, radius),
        ZoneLine::Here { radius, name } => {
            let here = handle.current_position().await?.context("no position fix yet")?;
            Zone::new(ZoneId::generate(), name, here, radius)
        }
    };
    track_doctor::check_zone(&zone)?;
    let status = handle.update_zone(zone.clone()).await?;
    print_zone(&zone);
    println!("active zone ({:?})", status);
    Ok(())
}

fn print_zone(z: &Zone) {
    println!("{}  {}  {}  r={}m", z.id, z.name, z.center, z.radius_m);
}

fn watch_options(cfg: &Config) -> WatchOptions {
    let d = WatchOptions::default();
    WatchOptions {
        high_accuracy: cfg.location.high_accuracy.unwrap_or(d.high_accuracy),
        min_distance_m: cfg.location.min_distance_m.unwrap_or(d.min_distance_m),
    }
}

fn location_source(cfg: &Config) -> Result<NmeaSource> {
    let l = &cfg.location;
    let input = match l.source.as_str() {
        "nmea-serial" => NmeaInput::Serial {
            dev: l.nmea_device.clone().context("location.nmea_device missing")?,
            baud: l.baud.unwrap_or(115200),
        },
        "nmea-file" => NmeaInput::File {
            path: l.nmea_file.clone().context("location.nmea_file missing")?.into(),
            loop_file: l.loop_file.unwrap_or(false),
            pace: Duration::from_millis(l.replay_interval_ms.unwrap_or(100)),
        },
        other => anyhow::bail!("unknown location.source: {}", other),
    };
    let thresholds = GnssThresholds { min_sats: l.min_sats, max_hdop: l.max_hdop, max_fix_age_s: l.max_fix_age_s };
    Ok(NmeaSource::new(input, thresholds))
}

fn notification_sink(cfg: &Config) -> Result<Box<dyn NotificationSink>> {
    Ok(match cfg.notify.sink.as_str() {
        "log" => Box::new(LogSink),
        "spool" => Box::new(SpoolSink::new(cfg.notify.spool_dir.clone().context("notify.spool_dir missing")?)),
        other => anyhow::bail!("unknown notify.sink: {}", other),
    })
}
