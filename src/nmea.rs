//! NMEA 0183 sentence handling.
//!
//! Parses the sentence types the receiver emits (GGA/GLL/GSA/RMC/VTG into
//! typed field structs; everything else is reported as `Other`) and
//! synthesises the GGA sentences uplinked to the NTRIP caster.
//!
//! Coordinates on the wire are DDMM.MMMM with a hemisphere letter; all
//! values leaving this module are decimal degrees.

use chrono::Utc;

/// Conversion factor from knots (NMEA speed unit) to m/s.
pub const KNOTS_TO_MPS: f64 = 0.514444;

/// A parsed NMEA sentence, talker prefix stripped.
#[derive(Debug, Clone, PartialEq)]
pub enum Sentence {
    Gga(GgaFields),
    Gll(GllFields),
    Gsa(GsaFields),
    Rmc(RmcFields),
    Vtg(VtgFields),
    /// Recognised framing but a sentence type we do not consume.
    Other(String),
}

/// GGA fix data.  `quality` is the raw indicator (0..9).
#[derive(Debug, Clone, PartialEq)]
pub struct GgaFields {
    pub lat:        f64,
    pub lon:        f64,
    pub quality:    u8,
    pub satellites: Option<u32>,
    pub hdop:       Option<f64>,
    pub altitude:   Option<f64>,
}

/// GLL position, with an A/V validity flag.
#[derive(Debug, Clone, PartialEq)]
pub struct GllFields {
    pub lat:   f64,
    pub lon:   f64,
    pub valid: bool,
}

/// GSA: active satellites and dilution of precision.
#[derive(Debug, Clone, PartialEq)]
pub struct GsaFields {
    pub satellites_used: u32,
    pub hdop:            Option<f64>,
}

/// RMC recommended minimum: course over ground and speed.
#[derive(Debug, Clone, PartialEq)]
pub struct RmcFields {
    pub valid:       bool,
    pub course_deg:  Option<f64>,
    pub speed_knots: Option<f64>,
}

/// VTG: track made good and ground speed.
#[derive(Debug, Clone, PartialEq)]
pub struct VtgFields {
    pub course_deg:  Option<f64>,
    pub speed_knots: Option<f64>,
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Validate the XOR checksum of an NMEA sentence (the part between $ and *).
pub fn checksum_ok(sentence: &str) -> bool {
    let inner = sentence.trim_start_matches('$');
    let mut parts = inner.splitn(2, '*');
    let body = match parts.next() {
        Some(b) => b,
        None => return false,
    };
    let expected_hex = match parts.next() {
        Some(h) => h.trim(),
        None => return false,
    };
    let expected: u8 = match u8::from_str_radix(expected_hex, 16) {
        Ok(v) => v,
        Err(_) => return false,
    };
    checksum(body) == expected
}

/// XOR checksum over a sentence body (between `$` and `*`).
pub fn checksum(body: &str) -> u8 {
    body.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Parse one trimmed NMEA line into a [`Sentence`].
///
/// Returns `None` for lines that are not sentence-shaped (no `$`, too few
/// fields) or that fail the checksum.  Callers that need to count checksum
/// failures separately should call [`checksum_ok`] first.
pub fn parse_sentence(line: &str) -> Option<Sentence> {
    let line = line.trim();
    if !line.starts_with('$') {
        return None;
    }
    if line.contains('*') && !checksum_ok(line) {
        return None;
    }

    let body = line.trim_start_matches('$');
    let body = body.split('*').next().unwrap_or(body);
    let fields: Vec<&str> = body.split(',').collect();
    if fields.is_empty() || fields[0].len() < 5 {
        return None;
    }

    // Strip the two-letter talker (GP/GN/GL/GA/GB…): "GNGGA" → "GGA".
    let msg_id = &fields[0][2..];
    match msg_id {
        "GGA" => parse_gga(&fields).map(Sentence::Gga),
        "GLL" => parse_gll(&fields).map(Sentence::Gll),
        "GSA" => parse_gsa(&fields).map(Sentence::Gsa),
        "RMC" => parse_rmc(&fields).map(Sentence::Rmc),
        "VTG" => parse_vtg(&fields).map(Sentence::Vtg),
        other => Some(Sentence::Other(other.to_string())),
    }
}

/// $GxGGA,time,lat,N,lon,E,quality,numSV,HDOP,alt,M,geoid,M,age,station
fn parse_gga(f: &[&str]) -> Option<GgaFields> {
    if f.len() < 10 {
        return None;
    }
    let lat = nmea_to_decimal(f[2], f[3])?;
    let lon = nmea_to_decimal(f[4], f[5])?;
    let quality: u8 = f[6].parse().ok()?;
    Some(GgaFields {
        lat,
        lon,
        quality,
        satellites: f[7].parse().ok(),
        hdop:       f[8].parse().ok(),
        altitude:   f[9].parse().ok(),
    })
}

/// $GxGLL,lat,N,lon,E,time,status
fn parse_gll(f: &[&str]) -> Option<GllFields> {
    if f.len() < 7 {
        return None;
    }
    let lat = nmea_to_decimal(f[1], f[2])?;
    let lon = nmea_to_decimal(f[3], f[4])?;
    Some(GllFields {
        lat,
        lon,
        valid: f[6] == "A",
    })
}

/// $GxGSA,mode,fixType,sv01..sv12,PDOP,HDOP,VDOP
fn parse_gsa(f: &[&str]) -> Option<GsaFields> {
    if f.len() < 18 {
        return None;
    }
    let satellites_used = f[3..15].iter().filter(|s| !s.is_empty()).count() as u32;
    Some(GsaFields {
        satellites_used,
        hdop: f[16].parse().ok(),
    })
}

/// $GxRMC,time,status,lat,N,lon,E,speed,course,date,…
fn parse_rmc(f: &[&str]) -> Option<RmcFields> {
    if f.len() < 9 {
        return None;
    }
    Some(RmcFields {
        valid:       f[2] == "A",
        speed_knots: f[7].parse().ok(),
        course_deg:  f[8].parse().ok(),
    })
}

/// $GxVTG,courseT,T,courseM,M,speedN,N,speedK,K
fn parse_vtg(f: &[&str]) -> Option<VtgFields> {
    if f.len() < 6 {
        return None;
    }
    Some(VtgFields {
        course_deg:  f[1].parse().ok(),
        speed_knots: f[5].parse().ok(),
    })
}

/// Convert NMEA coordinate (DDDMM.mmm) + hemisphere indicator to decimal degrees.
fn nmea_to_decimal(coord: &str, hemi: &str) -> Option<f64> {
    if coord.is_empty() {
        return None;
    }
    // Find the decimal point to split degrees from minutes
    let dot = coord.find('.')?;
    if dot < 2 {
        return None;
    }
    let deg_digits = dot - 2;
    let degrees: f64 = coord[..deg_digits].parse().ok()?;
    let minutes: f64 = coord[deg_digits..].parse().ok()?;
    let mut decimal = degrees + minutes / 60.0;
    if hemi == "S" || hemi == "W" {
        decimal = -decimal;
    }
    Some(decimal)
}

// ── Synthesis (caster uplink) ─────────────────────────────────────────────────

/// Build a GGA sentence from a decimal-degree position, for NTRIP uplink.
///
/// The caster only uses the rough location to select correction data, so a
/// fixed quality indicator of 1 (autonomous) is sufficient.
pub fn build_gga(lat: f64, lon: f64, altitude: f64, satellites: u8, hdop: f64) -> String {
    let time = Utc::now().format("%H%M%S");

    let lat_abs = lat.abs();
    let lat_deg = lat_abs.floor();
    let lat_min = (lat_abs - lat_deg) * 60.0;
    let lat_ns = if lat >= 0.0 { "N" } else { "S" };

    let lon_abs = lon.abs();
    let lon_deg = lon_abs.floor();
    let lon_min = (lon_abs - lon_deg) * 60.0;
    let lon_ew = if lon >= 0.0 { "E" } else { "W" };

    let body = format!(
        "GNGGA,{time},{:02}{:07.4},{lat_ns},{:03}{:07.4},{lon_ew},1,{:02},{:.1},{:.1},M,0.0,M,,",
        lat_deg as u32, lat_min, lon_deg as u32, lon_min, satellites, hdop, altitude
    );
    format!("${}*{:02X}\r\n", body, checksum(&body))
}

/// Fallback GGA with a fixed central-European location, used until the
/// receiver produces a first fix.
pub fn build_dummy_gga() -> String {
    let time = Utc::now().format("%H%M%S");
    let body = format!("GNGGA,{time},5213.0000,N,02100.0000,E,1,08,1.0,100.0,M,0.0,M,,");
    format!("${}*{:02X}\r\n", body, checksum(&body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn parse_gga_sentence() {
        let line = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
        match parse_sentence(line) {
            Some(Sentence::Gga(g)) => {
                assert_relative_eq!(g.lat, 48.1173, epsilon = 1e-4);
                assert_relative_eq!(g.lon, 11.5166, epsilon = 1e-3);
                assert_eq!(g.quality, 1);
                assert_eq!(g.satellites, Some(8));
                assert_relative_eq!(g.hdop.unwrap(), 0.9);
                assert_relative_eq!(g.altitude.unwrap(), 545.4);
            }
            other => panic!("expected GGA, got {other:?}"),
        }
    }

    #[test]
    fn parse_rmc_sentence() {
        let line = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";
        match parse_sentence(line) {
            Some(Sentence::Rmc(r)) => {
                assert!(r.valid);
                assert_relative_eq!(r.speed_knots.unwrap(), 22.4);
                assert_relative_eq!(r.course_deg.unwrap(), 84.4);
            }
            other => panic!("expected RMC, got {other:?}"),
        }
    }

    #[test]
    fn parse_vtg_sentence() {
        let body = "GNVTG,054.7,T,034.4,M,005.5,N,010.2,K";
        let line = format!("${}*{:02X}", body, checksum(body));
        match parse_sentence(&line) {
            Some(Sentence::Vtg(v)) => {
                assert_relative_eq!(v.course_deg.unwrap(), 54.7);
                assert_relative_eq!(v.speed_knots.unwrap(), 5.5);
            }
            other => panic!("expected VTG, got {other:?}"),
        }
    }

    #[test]
    fn parse_gsa_counts_satellites() {
        let body = "GPGSA,A,3,04,05,,09,12,,,24,,,,,2.5,1.3,2.1";
        let line = format!("${}*{:02X}", body, checksum(body));
        match parse_sentence(&line) {
            Some(Sentence::Gsa(g)) => {
                assert_eq!(g.satellites_used, 5);
                assert_relative_eq!(g.hdop.unwrap(), 1.3);
            }
            other => panic!("expected GSA, got {other:?}"),
        }
    }

    #[test]
    fn bad_checksum_rejected() {
        let line = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*00";
        assert!(parse_sentence(line).is_none());
    }

    #[test]
    fn southern_western_hemispheres_negative() {
        let body = "GPGLL,3342.6618,S,07036.7701,W,225444,A";
        let line = format!("${}*{:02X}", body, checksum(body));
        match parse_sentence(&line) {
            Some(Sentence::Gll(g)) => {
                assert!(g.lat < 0.0 && g.lon < 0.0);
                assert_relative_eq!(g.lat, -33.7110, epsilon = 1e-3);
            }
            other => panic!("expected GLL, got {other:?}"),
        }
    }

    #[test]
    fn build_gga_round_trips() {
        let gga = build_gga(52.2297, 21.0122, 110.5, 9, 1.2);
        assert!(gga.starts_with("$GNGGA,"));
        assert!(gga.ends_with("\r\n"));
        assert!(checksum_ok(gga.trim_end()));
        match parse_sentence(gga.trim_end()) {
            Some(Sentence::Gga(g)) => {
                assert_relative_eq!(g.lat, 52.2297, epsilon = 1e-5);
                assert_relative_eq!(g.lon, 21.0122, epsilon = 1e-5);
                assert_eq!(g.satellites, Some(9));
            }
            other => panic!("expected GGA, got {other:?}"),
        }
    }

    #[test]
    fn dummy_gga_is_valid() {
        let gga = build_dummy_gga();
        assert!(checksum_ok(gga.trim_end()));
        assert!(parse_sentence(gga.trim_end()).is_some());
    }
}
