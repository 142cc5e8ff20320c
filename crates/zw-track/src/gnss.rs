use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};
use zw_proto::Coordinate;

use crate::geo::DistanceTo;
use crate::location::{LocationError, LocationSource, Subscription, WatchOptions};

#[derive(Debug, Clone)]
pub struct FixQuality {
    pub sats: u8,
    pub hdop: f32,
    pub fix_age_s: u64,
}

#[derive(Debug, Clone)]
pub struct GnssFix {
    pub lat: f64,
    pub lon: f64,
    pub quality: FixQuality,
    pub ts: OffsetDateTime,
}

impl GnssFix {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lon)
    }
}

/// Gate applied to fixes in high-accuracy mode.
#[derive(Debug, Clone, Deserialize)]
pub struct GnssThresholds {
    pub min_sats: u8,
    pub max_hdop: f32,
    pub max_fix_age_s: u64,
}

impl Default for GnssThresholds {
    fn default() -> Self {
        Self { min_sats: 4, max_hdop: 5.0, max_fix_age_s: 5 }
    }
}

impl GnssThresholds {
    pub fn check(&self, fix: &GnssFix) -> Result<Coordinate, LocationError> {
        let q = &fix.quality;
        if q.sats >= self.min_sats && q.hdop <= self.max_hdop && q.fix_age_s <= self.max_fix_age_s {
            Ok(fix.coordinate())
        } else {
            Err(LocationError::PoorFix { sats: q.sats, hdop: q.hdop, fix_age_s: q.fix_age_s })
        }
    }
}

#[derive(Debug, Clone)]
pub enum NmeaInput {
    Serial { dev: String, baud: u32 },
    /// Replay file. `pace` is slept before each fix; `loop_file` rewinds at EOF.
    File { path: PathBuf, loop_file: bool, pace: Duration },
}

enum Reader {
    Serial(BufReader<SerialStream>),
    File { r: BufReader<File>, loop_file: bool, pace: Duration, fixes_this_pass: usize },
}

/// Open NMEA input plus the per-epoch state needed to build fixes.
struct NmeaStream {
    reader: Reader,
    parser: NmeaParser,
}

impl NmeaStream {
    async fn open(input: &NmeaInput) -> Result<Self> {
        let reader = match input {
            NmeaInput::Serial { dev, baud } => {
                let port = tokio_serial::new(dev, *baud).open_native_async()
                    .with_context(|| format!("open serial {}", dev))?;
                Reader::Serial(BufReader::new(port))
            }
            NmeaInput::File { path, loop_file, pace } => {
                let f = File::open(path).await
                    .with_context(|| format!("open nmea file {}", path.display()))?;
                Reader::File { r: BufReader::new(f), loop_file: *loop_file, pace: *pace, fixes_this_pass: 0 }
            }
        };
        Ok(Self { reader, parser: NmeaParser::default() })
    }

    /// `None` once a non-looping file is exhausted.
    async fn next_fix(&mut self) -> Result<Option<GnssFix>> {
        let mut line = String::new();
        loop {
            line.clear();
            let fix = match &mut self.reader {
                Reader::Serial(r) => {
                    let n = r.read_line(&mut line).await?;
                    anyhow::ensure!(n > 0, "serial port closed");
                    self.parser.parse_line(line.trim())
                }
                Reader::File { r, loop_file, fixes_this_pass, .. } => {
                    let n = r.read_line(&mut line).await?;
                    if n > 0 {
                        self.parser.parse_line(line.trim())
                    } else if let Some(fix) = self.parser.finish() {
                        Some(fix)
                    } else {
                        // a looping file with no usable sentence would spin forever
                        if !*loop_file || *fixes_this_pass == 0 {
                            return Ok(None);
                        }
                        r.seek(SeekFrom::Start(0)).await?;
                        *fixes_this_pass = 0;
                        self.parser = NmeaParser::default();
                        continue;
                    }
                }
            };
            if let Some(fix) = fix {
                if let Reader::File { pace, fixes_this_pass, .. } = &mut self.reader {
                    *fixes_this_pass += 1;
                    if !pace.is_zero() {
                        tokio::time::sleep(*pace).await;
                    }
                }
                return Ok(Some(fix));
            }
        }
    }
}

/// Sentences sharing one UTC time field.
#[derive(Debug)]
struct Epoch {
    utc: String,
    rmc: Option<(f64, f64)>,
    gga: Option<(u8, f32)>,
    seen: OffsetDateTime,
    emitted: bool,
}

impl Epoch {
    fn new(utc: &str) -> Self {
        Self { utc: utc.to_string(), rmc: None, gga: None, seen: OffsetDateTime::now_utc(), emitted: false }
    }

    /// The fix once both halves are in.
    fn paired(&mut self) -> Option<GnssFix> {
        self.gga?;
        self.take()
    }

    fn take(&mut self) -> Option<GnssFix> {
        if self.emitted {
            return None;
        }
        let (lat, lon) = self.rmc?;
        self.emitted = true;
        let now = OffsetDateTime::now_utc();
        // an RMC without its GGA carries no quality information
        let (sats, hdop) = self.gga.unwrap_or((0, 99.9));
        let fix_age_s = (now - self.seen).whole_seconds().max(0) as u64;
        Some(GnssFix { lat, lon, quality: FixQuality { sats, hdop, fix_age_s }, ts: now })
    }
}

// Minimal NMEA parsing, GGA and RMC paired on their UTC time field:
// - GGA: satellites + hdop
// - RMC: lat/lon
// A fix is emitted once both halves of an epoch are in, in either order.
// An RMC whose GGA never arrives is flushed when the next epoch starts.
#[derive(Debug, Default)]
struct NmeaParser {
    epoch: Option<Epoch>,
}

impl NmeaParser {
    fn parse_line(&mut self, s: &str) -> Option<GnssFix> {
        if s.starts_with("$GNGGA") || s.starts_with("$GPGGA") {
            let parts: Vec<&str> = s.split(',').collect();
            if parts.len() > 9 {
                let sats: u8 = parts[7].parse().unwrap_or(0);
                let hdop: f32 = parts[8].parse().unwrap_or(99.9);
                let stale = self.begin(parts[1]);
                let epoch = self.epoch.as_mut()?;
                epoch.gga = Some((sats, hdop));
                return stale.or_else(|| epoch.paired());
            }
            return None;
        }

        if s.starts_with("$GNRMC") || s.starts_with("$GPRMC") {
            let parts: Vec<&str> = s.split(',').collect();
            // parts[1]=hhmmss.ss, parts[2]=A|V, parts[3]=lat ddmm.mmmm, parts[4]=N/S, parts[5]=lon dddmm.mmmm, parts[6]=E/W
            if parts.len() > 6 && parts[2] == "A" {
                let lat = parse_deg_min(parts[3], parts[4])?;
                let lon = parse_deg_min(parts[5], parts[6])?;
                let stale = self.begin(parts[1]);
                let epoch = self.epoch.as_mut()?;
                epoch.rmc = Some((lat, lon));
                return stale.or_else(|| epoch.paired());
            }
        }

        None
    }

    /// Switches to the epoch stamped `utc`, flushing an unpaired RMC from
    /// the previous one.
    fn begin(&mut self, utc: &str) -> Option<GnssFix> {
        if self.epoch.as_ref().is_some_and(|e| e.utc == utc) {
            return None;
        }
        let stale = self.finish();
        self.epoch = Some(Epoch::new(utc));
        stale
    }

    /// Takes the pending RMC-only fix, if any.
    fn finish(&mut self) -> Option<GnssFix> {
        self.epoch.as_mut()?.take()
    }
}

fn parse_deg_min(v: &str, hemi: &str) -> Option<f64> {
    if v.is_empty() { return None; }
    // lat: ddmm.mmmm, lon: dddmm.mmmm
    let dot = v.find('.')?;
    let deg_len = if dot > 4 { 3 } else { 2 };
    let deg: f64 = v.get(..deg_len)?.parse().ok()?;
    let min: f64 = v.get(deg_len..)?.parse().ok()?;
    let mut out = deg + (min / 60.0);
    if hemi == "S" || hemi == "W" { out = -out; }
    Some(out)
}

/// NMEA 0183 receiver as a [`LocationSource`]. Permission means the device
/// or replay file could be opened.
pub struct NmeaSource {
    input: NmeaInput,
    thresholds: GnssThresholds,
    stream: Option<NmeaStream>,
    subscribed: Arc<AtomicBool>,
    next_sub_id: u64,
}

impl NmeaSource {
    pub fn new(input: NmeaInput, thresholds: GnssThresholds) -> Self {
        Self { input, thresholds, stream: None, subscribed: Arc::new(AtomicBool::new(false)), next_sub_id: 1 }
    }

    /// True while a subscription task owns the input.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    fn stream_mut(&mut self) -> Result<&mut NmeaStream, LocationError> {
        if self.is_subscribed() {
            return Err(LocationError::Busy("stream handed to subscription"));
        }
        self.stream.as_mut().ok_or(LocationError::PermissionDenied)
    }
}

#[async_trait]
impl LocationSource for NmeaSource {
    /// Reopens the input once a finished subscription has released it.
    async fn request_permission(&mut self) -> bool {
        if self.stream.is_some() || self.is_subscribed() {
            return true;
        }
        match NmeaStream::open(&self.input).await {
            Ok(s) => {
                info!("gnss: input opened ({:?})", self.input);
                self.stream = Some(s);
                true
            }
            Err(e) => {
                warn!("gnss: cannot open input: {:#}", e);
                false
            }
        }
    }

    async fn current_position(&mut self) -> Result<Coordinate, LocationError> {
        let thresholds = self.thresholds.clone();
        let stream = self.stream_mut()?;
        match stream.next_fix().await {
            Ok(Some(fix)) => thresholds.check(&fix),
            Ok(None) => Err(LocationError::Unavailable("end of nmea input".to_string())),
            Err(e) => Err(LocationError::Io(format!("{:#}", e))),
        }
    }

    fn subscribe(&mut self, opts: WatchOptions) -> Result<Subscription, LocationError> {
        self.stream_mut()?;
        let mut stream = self.stream.take().ok_or(LocationError::PermissionDenied)?;
        self.subscribed.store(true, Ordering::Release);
        let subscribed = self.subscribed.clone();

        let id = self.next_sub_id;
        self.next_sub_id += 1;
        let thresholds = self.thresholds.clone();
        let (tx, sub) = Subscription::channel(id, 32);

        tokio::spawn(async move {
            let mut last: Option<Coordinate> = None;
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => break,
                    r = stream.next_fix() => r,
                };
                let update = match next {
                    Ok(Some(fix)) => {
                        let checked = if opts.high_accuracy { thresholds.check(&fix) } else { Ok(fix.coordinate()) };
                        match checked {
                            Ok(c) => {
                                if let Some(prev) = last {
                                    if prev.distance_to(&c) < opts.min_distance_m {
                                        continue;
                                    }
                                }
                                last = Some(c);
                                Ok(c)
                            }
                            Err(e) => Err(e),
                        }
                    }
                    Ok(None) => {
                        debug!(id, "gnss: end of input");
                        break;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(LocationError::Io(format!("{:#}", e)))).await;
                        break;
                    }
                };
                if tx.send(update).await.is_err() {
                    break;
                }
            }
            subscribed.store(false, Ordering::Release);
            debug!(id, "gnss: subscription task finished");
        });

        Ok(sub)
    }
}
