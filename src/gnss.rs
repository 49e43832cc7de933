//! GNSS receiver adapter (Quectel LC29H-class RTK module on a serial port).
//!
//! Opens the device in raw 8N1 mode, auto-detects the baud rate, configures
//! the module for 1 Hz GGA output, and turns the NMEA stream into
//! [`Position`] values.  RTCM correction bytes are written back over the
//! same port; reads and writes are serialised through one mutex so the two
//! directions never interleave mid-syscall.

use std::fs;
use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::sys::termios::{
    self, BaudRate, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg,
};
use serde::Serialize;

use crate::error::{Result, RoverError};
use crate::nmea::{self, Sentence, KNOTS_TO_MPS};

/// Baud rates probed during connect, most likely first.
const BAUD_CANDIDATES: [u32; 3] = [115200, 38400, 9600];
/// How long to listen for valid NMEA at each candidate rate.
const PROBE_WINDOW: Duration = Duration::from_secs(3);
/// GLL positions are used only when GGA has been absent this long.
const GGA_FALLBACK_AFTER: Duration = Duration::from_secs(5);
/// Consecutive parse/read failures before the link is torn down.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;
/// Parse failures beyond this count are logged at debug only.
const LOUD_ERROR_LIMIT: u64 = 3;
/// Position log throttle (unless the fix quality changes).
const POSITION_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Quectel proprietary configuration burst: GGA-only output at 1 Hz,
/// persisted to module flash.
const PQTM_DISABLE_ALL: &[u8] = b"$PQTMGNSSMSG,0,0,0,0,0,0*2A\r\n";
const PQTM_ENABLE_GGA: &[u8] = b"$PQTMGNSSMSG,1,0,0,0,0,0*2B\r\n";
const PQTM_SAVE: &[u8] = b"$PQTMSAVEPAR*53\r\n";

// ── Position ──────────────────────────────────────────────────────────────────

/// GNSS fix quality, from the GGA quality indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixQuality {
    NoFix,
    Single,
    Dgps,
    RtkFloat,
    RtkFixed,
}

impl FixQuality {
    /// Map the GGA quality indicator to a fix variant.
    fn from_gga_quality(quality: u8) -> Self {
        match quality {
            1 | 3 => FixQuality::Single,
            2 => FixQuality::Dgps,
            4 => FixQuality::RtkFixed,
            5 => FixQuality::RtkFloat,
            _ => FixQuality::NoFix,
        }
    }
}

impl std::fmt::Display for FixQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FixQuality::NoFix => "no fix",
            FixQuality::Single => "single",
            FixQuality::Dgps => "dgps",
            FixQuality::RtkFloat => "rtk float",
            FixQuality::RtkFixed => "rtk fixed",
        };
        f.write_str(s)
    }
}

/// One published GNSS fix.  Immutable after creation.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub lat:        f64,
    pub lon:        f64,
    /// Metres above mean sea level (0 for GLL-derived positions).
    pub altitude:   f64,
    pub satellites: u32,
    pub hdop:       f64,
    pub fix:        FixQuality,
    /// Course over ground in degrees [0, 360), from RMC/VTG.
    pub course:     Option<f64>,
    /// Ground speed in m/s, from RMC/VTG.
    pub speed:      Option<f64>,
    /// Monotonic capture time, for staleness checks.
    #[serde(skip)]
    pub timestamp:  Instant,
}

impl Position {
    pub fn age(&self) -> Duration {
        self.timestamp.elapsed()
    }
}

// ── Serial link ───────────────────────────────────────────────────────────────

/// An open serial device in raw mode.  All I/O goes through
/// [`GnssReceiver::link`], one lock acquisition per syscall.
struct SerialLink {
    file: fs::File,
    baud: u32,
}

impl SerialLink {
    fn open(port: &str, baud: u32) -> Result<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(port)
            .map_err(|e| RoverError::SerialUnavailable(format!("{port}: {e}")))?;
        configure_serial(&file, baud)?;
        Ok(SerialLink { file, baud })
    }

    /// Read whatever is available, waiting at most the VTIME timeout.
    /// Returns an empty slice length on timeout.
    fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }

    fn write_all_drain(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all(data)?;
        // File::flush is a no-op on a tty; tcdrain pushes the bytes out.
        termios::tcdrain(&self.file)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(())
    }
}

/// Configure the serial port for raw NMEA/RTCM traffic (8N1, no echo, no
/// signals).  VMIN=0/VTIME=10 gives reads a 1 s timeout so the shared lock
/// is never held indefinitely.
fn configure_serial(file: &fs::File, baud: u32) -> Result<()> {
    let mut t = termios::tcgetattr(file)
        .map_err(|e| RoverError::SerialUnavailable(e.to_string()))?;

    // Raw input: no canonical mode, no echo, no signals
    t.local_flags &= !(
        LocalFlags::ICANON |
        LocalFlags::ECHO   |
        LocalFlags::ECHOE  |
        LocalFlags::ISIG
    );
    // No output processing
    t.output_flags &= !OutputFlags::OPOST;
    // Disable software flow control and strip/parity
    t.input_flags &= !(
        InputFlags::IXON   |
        InputFlags::IXOFF  |
        InputFlags::IXANY  |
        InputFlags::ISTRIP |
        InputFlags::INPCK
    );
    // 8 data bits, no parity, 1 stop bit, enable receiver, ignore modem ctrl
    t.control_flags |= ControlFlags::CS8 | ControlFlags::CREAD | ControlFlags::CLOCAL;
    t.control_flags &= !(ControlFlags::CSIZE | ControlFlags::CSTOPB | ControlFlags::PARENB);

    // VMIN=0, VTIME=10: return whatever arrives within 1.0 s
    t.control_chars[termios::SpecialCharacterIndices::VMIN as usize] = 0;
    t.control_chars[termios::SpecialCharacterIndices::VTIME as usize] = 10;

    let baud_rate = match baud {
        9600   => BaudRate::B9600,
        19200  => BaudRate::B19200,
        38400  => BaudRate::B38400,
        57600  => BaudRate::B57600,
        115200 => BaudRate::B115200,
        _      => BaudRate::B115200,
    };

    termios::cfsetospeed(&mut t, baud_rate)
        .map_err(|e| RoverError::SerialUnavailable(e.to_string()))?;
    termios::cfsetispeed(&mut t, baud_rate)
        .map_err(|e| RoverError::SerialUnavailable(e.to_string()))?;
    termios::tcsetattr(file, SetArg::TCSANOW, &t)
        .map_err(|e| RoverError::SerialUnavailable(e.to_string()))?;

    Ok(())
}

// ── Receiver adapter ──────────────────────────────────────────────────────────

/// Parser-side state, touched only by the position-reader thread.
struct ParseState {
    line_buf:           Vec<u8>,
    last_gga:           Option<Instant>,
    /// HDOP / satellites-in-use cache from GSA, used for GLL fallbacks.
    gsa_hdop:           f64,
    gsa_satellites:     u32,
    /// Latest course/speed enrichment from RMC/VTG.
    course:             Option<f64>,
    speed_mps:          Option<f64>,
    consecutive_errors: u32,
    checksum_errors:    u64,
    format_errors:      u64,
    last_position_log:  Option<Instant>,
    last_fix:           Option<FixQuality>,
}

impl ParseState {
    fn new() -> Self {
        ParseState {
            line_buf:           Vec::new(),
            last_gga:           None,
            gsa_hdop:           0.0,
            gsa_satellites:     0,
            course:             None,
            speed_mps:          None,
            consecutive_errors: 0,
            checksum_errors:    0,
            format_errors:      0,
            last_position_log:  None,
            last_fix:           None,
        }
    }
}

/// Serial GNSS receiver: NMEA downlink, RTCM uplink.
pub struct GnssReceiver {
    port:  String,
    link:  Mutex<Option<SerialLink>>,
    parse: Mutex<ParseState>,
}

impl GnssReceiver {
    pub fn new(port: &str) -> Self {
        GnssReceiver {
            port:  port.to_string(),
            link:  Mutex::new(None),
            parse: Mutex::new(ParseState::new()),
        }
    }

    /// Probe the candidate baud rates, keep the first that produces valid
    /// NMEA, then send the module configuration burst.
    pub fn connect(&self) -> Result<()> {
        info!("connecting to GNSS receiver on {}", self.port);
        for &baud in &BAUD_CANDIDATES {
            debug!("probing {} at {baud} baud", self.port);
            match self.try_connect(baud) {
                Ok(link) => {
                    info!("GNSS receiver connected at {baud} baud");
                    *self.link.lock().unwrap() = Some(link);
                    *self.parse.lock().unwrap() = ParseState::new();
                    self.configure_module()?;
                    return Ok(());
                }
                Err(e) => debug!("no NMEA at {baud} baud: {e}"),
            }
        }
        Err(RoverError::SerialUnavailable(format!(
            "no NMEA traffic on {} at any candidate baud rate",
            self.port
        )))
    }

    fn try_connect(&self, baud: u32) -> Result<SerialLink> {
        let mut link = SerialLink::open(&self.port, baud)?;
        let mut seen = Vec::new();
        let mut buf = [0u8; 512];
        let deadline = Instant::now() + PROBE_WINDOW;
        while Instant::now() < deadline {
            let n = link.read_chunk(&mut buf)?;
            if n > 0 {
                seen.extend_from_slice(&buf[..n]);
                if looks_like_nmea(&seen) {
                    return Ok(link);
                }
            }
        }
        Err(RoverError::SerialUnavailable(format!(
            "no NMEA within {PROBE_WINDOW:?}"
        )))
    }

    /// Enable GGA-only output at 1 Hz and persist to flash.  The module
    /// wants breathing room between proprietary commands.
    fn configure_module(&self) -> Result<()> {
        info!("configuring receiver for 1 Hz GGA output");
        for (cmd, what) in [
            (PQTM_DISABLE_ALL, "disable all NMEA output"),
            (PQTM_ENABLE_GGA, "enable GGA"),
            (PQTM_SAVE, "persist configuration"),
        ] {
            debug!("{what}: {}", String::from_utf8_lossy(cmd).trim());
            let mut guard = self.link.lock().unwrap();
            match guard.as_mut() {
                Some(link) => link.write_all_drain(cmd)?,
                None => {
                    return Err(RoverError::SerialUnavailable(
                        "link closed during configuration".into(),
                    ))
                }
            }
            drop(guard);
            std::thread::sleep(Duration::from_secs(1));
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.link.lock().unwrap().is_some()
    }

    pub fn baud(&self) -> Option<u32> {
        self.link.lock().unwrap().as_ref().map(|l| l.baud)
    }

    /// Drop the serial link.  A later `connect()` starts from scratch.
    pub fn close(&self) {
        if self.link.lock().unwrap().take().is_some() {
            info!("GNSS serial link closed");
        }
    }

    /// Read from the port and return at most one new position.
    ///
    /// `Ok(None)` means no complete position-bearing sentence arrived yet.
    /// `Err` means the link is gone and was torn down; the coordinator may
    /// call `connect()` again.
    pub fn read_position(&self) -> Result<Option<Position>> {
        let mut buf = [0u8; 512];
        let n = {
            let mut guard = self.link.lock().unwrap();
            let link = guard
                .as_mut()
                .ok_or_else(|| RoverError::SerialUnavailable(self.port.clone()))?;
            match link.read_chunk(&mut buf) {
                Ok(n) => n,
                Err(e) => {
                    warn!("GNSS serial read failed: {e}");
                    guard.take();
                    return Err(RoverError::SerialUnavailable(e.to_string()));
                }
            }
        };

        let mut state = self.parse.lock().unwrap();
        state.line_buf.extend_from_slice(&buf[..n]);
        // Never clear the buffer on corruption: in-flight valid sentences
        // would be lost with it.  Only parsed bytes are consumed.
        while let Some(line) = next_line(&mut state.line_buf) {
            if let Some(position) = self.handle_line(&mut state, &line) {
                state.consecutive_errors = 0;
                return Ok(Some(position));
            }
            if state.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                warn!(
                    "{} consecutive NMEA errors, dropping GNSS link",
                    state.consecutive_errors
                );
                self.link.lock().unwrap().take();
                return Err(RoverError::Nmea("persistent sentence corruption".into()));
            }
        }
        Ok(None)
    }

    /// Process one line; returns a position if the sentence yields one.
    fn handle_line(&self, state: &mut ParseState, line: &str) -> Option<Position> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if !line.starts_with('$') {
            state.format_errors += 1;
            state.consecutive_errors += 1;
            return None;
        }
        if line.contains('*') && !nmea::checksum_ok(line) {
            state.checksum_errors += 1;
            state.consecutive_errors += 1;
            if state.checksum_errors <= LOUD_ERROR_LIMIT {
                warn!("NMEA checksum failure: {line}");
            } else {
                debug!("NMEA checksum failure: {line}");
            }
            return None;
        }

        let sentence = match nmea::parse_sentence(line) {
            Some(s) => s,
            None => {
                state.format_errors += 1;
                state.consecutive_errors += 1;
                if state.format_errors <= LOUD_ERROR_LIMIT {
                    warn!("malformed NMEA sentence: {line}");
                }
                return None;
            }
        };
        state.consecutive_errors = 0;

        match sentence {
            Sentence::Gga(gga) => {
                state.last_gga = Some(Instant::now());
                self.position_from_gga(state, &gga)
            }
            Sentence::Gll(gll) => {
                let stale = state
                    .last_gga
                    .map(|t| t.elapsed() >= GGA_FALLBACK_AFTER)
                    .unwrap_or(true);
                if stale {
                    debug!("using GLL fallback (no GGA for ≥{GGA_FALLBACK_AFTER:?})");
                    self.position_from_gll(state, &gll)
                } else {
                    None
                }
            }
            Sentence::Gsa(gsa) => {
                if let Some(hdop) = gsa.hdop {
                    state.gsa_hdop = hdop;
                }
                state.gsa_satellites = gsa.satellites_used;
                None
            }
            Sentence::Rmc(rmc) => {
                if rmc.valid {
                    update_course_speed(state, rmc.course_deg, rmc.speed_knots);
                }
                None
            }
            Sentence::Vtg(vtg) => {
                update_course_speed(state, vtg.course_deg, vtg.speed_knots);
                None
            }
            Sentence::Other(id) => {
                debug!("ignoring NMEA sentence type {id}");
                None
            }
        }
    }

    fn position_from_gga(&self, state: &mut ParseState, gga: &nmea::GgaFields) -> Option<Position> {
        if !gga.lat.is_finite() || !(-90.0..=90.0).contains(&gga.lat) {
            warn!("GGA rejected: latitude {} out of range", gga.lat);
            return None;
        }
        if !gga.lon.is_finite() || !(-180.0..=180.0).contains(&gga.lon) {
            warn!("GGA rejected: longitude {} out of range", gga.lon);
            return None;
        }

        let mut satellites = gga.satellites.unwrap_or(0);
        if satellites > 50 {
            warn!("GGA satellite count {satellites} clamped to 50");
            satellites = 50;
        }
        let mut hdop = gga.hdop.unwrap_or(0.0);
        if !(0.0..=50.0).contains(&hdop) {
            warn!("GGA HDOP {hdop} clamped to [0, 50]");
            hdop = hdop.max(0.0).min(50.0);
        }
        let altitude = gga.altitude.unwrap_or(0.0);
        if !(-1000.0..=10000.0).contains(&altitude) {
            warn!("GGA reports suspicious altitude {altitude} m");
        }

        let fix = FixQuality::from_gga_quality(gga.quality);
        if fix != FixQuality::NoFix && satellites < 4 {
            warn!("GGA claims a fix with only {satellites} satellites");
        }

        self.log_position(state, gga.lat, gga.lon, satellites, hdop, fix);

        Some(Position {
            lat: gga.lat,
            lon: gga.lon,
            altitude,
            satellites,
            hdop,
            fix,
            course: state.course,
            speed: state.speed_mps,
            timestamp: Instant::now(),
        })
    }

    fn position_from_gll(&self, state: &mut ParseState, gll: &nmea::GllFields) -> Option<Position> {
        if !gll.lat.is_finite()
            || !gll.lon.is_finite()
            || !(-90.0..=90.0).contains(&gll.lat)
            || !(-180.0..=180.0).contains(&gll.lon)
        {
            warn!("GLL rejected: coordinates out of range");
            return None;
        }
        let fix = if gll.valid { FixQuality::Single } else { FixQuality::NoFix };
        Some(Position {
            lat: gll.lat,
            lon: gll.lon,
            altitude: 0.0,
            satellites: state.gsa_satellites,
            hdop: state.gsa_hdop,
            fix,
            course: state.course,
            speed: state.speed_mps,
            timestamp: Instant::now(),
        })
    }

    /// Throttled position logging; fix-quality transitions always log.
    fn log_position(
        &self,
        state: &mut ParseState,
        lat: f64,
        lon: f64,
        satellites: u32,
        hdop: f64,
        fix: FixQuality,
    ) {
        let transition = state.last_fix != Some(fix);
        let due = state
            .last_position_log
            .map(|t| t.elapsed() >= POSITION_LOG_INTERVAL)
            .unwrap_or(true);
        if transition || due {
            match fix {
                FixQuality::RtkFixed => info!(
                    "RTK FIXED: ({lat:.6}, {lon:.6}) sats={satellites} hdop={hdop:.1}"
                ),
                FixQuality::RtkFloat => info!(
                    "RTK float: ({lat:.6}, {lon:.6}) sats={satellites} hdop={hdop:.1}"
                ),
                _ => info!(
                    "fix: ({lat:.6}, {lon:.6}) sats={satellites} hdop={hdop:.1} quality={fix}"
                ),
            }
            state.last_position_log = Some(Instant::now());
            state.last_fix = Some(fix);
        }
    }

    /// Write raw RTCM bytes to the receiver and drain the port.
    ///
    /// The parser upstream is authoritative about framing; a missing
    /// preamble here only warns.
    pub fn write_rtcm(&self, data: &[u8]) -> Result<bool> {
        if data.is_empty() {
            return Ok(true);
        }
        if data[0] != 0xD3 {
            warn!("RTCM write without 0xD3 preamble (first byte {:#04x})", data[0]);
        }
        let mut guard = self.link.lock().unwrap();
        let link = guard
            .as_mut()
            .ok_or_else(|| RoverError::SerialUnavailable(self.port.clone()))?;
        match link.write_all_drain(data) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("RTCM serial write failed: {e}");
                Err(RoverError::Io(e))
            }
        }
    }

    /// (checksum, format) sentence error counters.
    pub fn error_counters(&self) -> (u64, u64) {
        let state = self.parse.lock().unwrap();
        (state.checksum_errors, state.format_errors)
    }
}

/// Extract the next complete `\r\n`- or `\n`-terminated line from `buf`.
fn next_line(buf: &mut Vec<u8>) -> Option<String> {
    let nl = buf.iter().position(|&b| b == b'\n')?;
    let line: Vec<u8> = buf.drain(..=nl).collect();
    Some(String::from_utf8_lossy(&line).into_owned())
}

/// Probe acceptance: a `$` sentence mentioning one of the always-on types.
fn looks_like_nmea(data: &[u8]) -> bool {
    let text = String::from_utf8_lossy(data);
    text.contains('$')
        && (text.contains("GGA") || text.contains("RMC") || text.contains("GSV"))
}

/// Validate and fold RMC/VTG course/speed into the enrichment cache.
/// Out-of-range values are dropped without logging; they are advisory only.
fn update_course_speed(state: &mut ParseState, course: Option<f64>, speed_knots: Option<f64>) {
    if let Some(c) = course {
        if (0.0..=360.0).contains(&c) {
            state.course = Some(c % 360.0);
        }
    }
    if let Some(k) = speed_knots {
        if (0.0..1000.0).contains(&k) {
            state.speed_mps = Some(k * KNOTS_TO_MPS);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmea::checksum;

    fn receiver() -> GnssReceiver {
        GnssReceiver::new("/dev/null")
    }

    fn feed(rx: &GnssReceiver, line: &str) -> Option<Position> {
        let mut state = rx.parse.lock().unwrap();
        rx.handle_line(&mut state, line)
    }

    fn sentence(body: &str) -> String {
        format!("${}*{:02X}", body, checksum(body))
    }

    #[test]
    fn gga_yields_position() {
        let rx = receiver();
        let line = sentence("GNGGA,120000,5213.7800,N,02100.7320,E,4,12,0.8,110.0,M,0.0,M,,");
        let pos = feed(&rx, &line).expect("position");
        assert_eq!(pos.fix, FixQuality::RtkFixed);
        assert_eq!(pos.satellites, 12);
        assert!((pos.lat - 52.2297).abs() < 1e-3);
    }

    #[test]
    fn out_of_range_coordinates_rejected() {
        let rx = receiver();
        // lat 95°: degrees 95, minutes 00.0
        let line = sentence("GNGGA,120000,9500.0000,N,02100.0000,E,1,08,1.0,100.0,M,0.0,M,,");
        assert!(feed(&rx, &line).is_none());
        let line = sentence("GNGGA,120000,5213.0000,N,20000.0000,E,1,08,1.0,100.0,M,0.0,M,,");
        assert!(feed(&rx, &line).is_none());
    }

    #[test]
    fn satellites_and_hdop_clamped_not_rejected() {
        let rx = receiver();
        let line = sentence("GNGGA,120000,5213.0000,N,02100.0000,E,1,70,60.0,100.0,M,0.0,M,,");
        let pos = feed(&rx, &line).expect("position");
        assert_eq!(pos.satellites, 50);
        assert!((pos.hdop - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn quality_mapping() {
        let rx = receiver();
        for (q, fix) in [
            (0, FixQuality::NoFix),
            (1, FixQuality::Single),
            (2, FixQuality::Dgps),
            (3, FixQuality::Single),
            (4, FixQuality::RtkFixed),
            (5, FixQuality::RtkFloat),
        ] {
            let line = sentence(&format!(
                "GNGGA,120000,5213.0000,N,02100.0000,E,{q},08,1.0,100.0,M,0.0,M,,"
            ));
            let pos = feed(&rx, &line).expect("position");
            assert_eq!(pos.fix, fix, "quality {q}");
        }
    }

    #[test]
    fn gll_ignored_while_gga_fresh() {
        let rx = receiver();
        let gga = sentence("GNGGA,120000,5213.0000,N,02100.0000,E,1,08,1.0,100.0,M,0.0,M,,");
        assert!(feed(&rx, &gga).is_some());
        let gll = sentence("GNGLL,5213.0000,N,02100.0000,E,120001,A");
        assert!(feed(&rx, &gll).is_none());
    }

    #[test]
    fn gll_fallback_without_gga() {
        let rx = receiver();
        // GSA first so the fallback has sat/HDOP estimates.
        let gsa = sentence("GPGSA,A,3,04,05,09,12,24,25,,,,,,,2.5,1.3,2.1");
        assert!(feed(&rx, &gsa).is_none());
        let gll = sentence("GNGLL,5213.0000,N,02100.0000,E,120001,A");
        let pos = feed(&rx, &gll).expect("fallback position");
        assert_eq!(pos.fix, FixQuality::Single);
        assert_eq!(pos.satellites, 6);
        assert!((pos.hdop - 1.3).abs() < 1e-9);
        assert_eq!(pos.altitude, 0.0);
    }

    #[test]
    fn rmc_vtg_enrich_course_and_speed() {
        let rx = receiver();
        let rmc = sentence("GNRMC,120000,A,5213.0000,N,02100.0000,E,3.9,84.4,010126,,,D");
        assert!(feed(&rx, &rmc).is_none());
        let gga = sentence("GNGGA,120001,5213.0000,N,02100.0000,E,1,08,1.0,100.0,M,0.0,M,,");
        let pos = feed(&rx, &gga).expect("position");
        assert!((pos.course.unwrap() - 84.4).abs() < 1e-9);
        assert!((pos.speed.unwrap() - 3.9 * KNOTS_TO_MPS).abs() < 1e-9);
    }

    #[test]
    fn invalid_course_dropped_silently() {
        let rx = receiver();
        let vtg = sentence("GNVTG,400.0,T,,M,5.0,N,9.3,K");
        assert!(feed(&rx, &vtg).is_none());
        let gga = sentence("GNGGA,120001,5213.0000,N,02100.0000,E,1,08,1.0,100.0,M,0.0,M,,");
        let pos = feed(&rx, &gga).expect("position");
        assert!(pos.course.is_none());
        assert!((pos.speed.unwrap() - 5.0 * KNOTS_TO_MPS).abs() < 1e-9);
    }

    #[test]
    fn checksum_failures_counted() {
        let rx = receiver();
        assert!(feed(&rx, "$GNGGA,120000,5213.0000,N,02100.0000,E,1,08,1.0,100.0,M,0.0,M,,*00").is_none());
        let (checksum_errors, _) = rx.error_counters();
        assert_eq!(checksum_errors, 1);
    }

    #[test]
    fn next_line_splits_on_crlf() {
        let mut buf = b"$GNGGA,a*00\r\n$GNR".to_vec();
        let line = next_line(&mut buf).unwrap();
        assert_eq!(line.trim(), "$GNGGA,a*00");
        assert_eq!(buf, b"$GNR");
        assert!(next_line(&mut buf).is_none());
    }
}
