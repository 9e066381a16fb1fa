use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Modified Julian Date of the unix epoch.
pub const MJD_UNIX_EPOCH: f64 = 40587.0;

pub fn unix_to_mjd(unix: f64) -> f64 {
    unix / 86400.0 + MJD_UNIX_EPOCH
}

pub fn mjd_to_unix(mjd: f64) -> f64 {
    (mjd - MJD_UNIX_EPOCH) * 86400.0
}

pub fn datetime_to_unix(t: OffsetDateTime) -> f64 {
    t.unix_timestamp_nanos() as f64 / 1e9
}

/// One row of a schedule. Validity bounds are MJD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: i64,
    pub ra: f64,
    pub dec: f64,
    pub filter: String,
    /// Total visit exposure, split evenly across dither positions.
    pub exposure_time: f64,
    pub valid_start: f64,
    pub valid_stop: f64,
    #[serde(default)]
    pub priority: f64,
    #[serde(default)]
    pub observed: bool,
    /// Number of dither positions for the visit; 0 means the full sequence.
    #[serde(default)]
    pub dither_number: u32,
}

impl Observation {
    /// Eligible iff `now ∈ [valid_start, valid_stop)` and not yet observed.
    pub fn is_eligible(&self, now_mjd: f64) -> bool {
        !self.observed && self.valid_start <= now_mjd && now_mjd < self.valid_stop
    }

    pub fn is_expired(&self, now_mjd: f64) -> bool {
        now_mjd >= self.valid_stop
    }

    pub fn has_valid_window(&self) -> bool {
        self.valid_start <= self.valid_stop
    }
}

/// Pointing offset applied for one exposure of a visit, in arcseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DitherOffset {
    pub ra_arcsec: f64,
    pub dec_arcsec: f64,
}

impl DitherOffset {
    pub fn apply(&self, ra_deg: f64, dec_deg: f64) -> (f64, f64) {
        (ra_deg + self.ra_arcsec / 3600.0, dec_deg + self.dec_arcsec / 3600.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(start: f64, stop: f64) -> Observation {
        Observation {
            id: 1,
            ra: 10.0,
            dec: 20.0,
            filter: "J".into(),
            exposure_time: 30.0,
            valid_start: start,
            valid_stop: stop,
            priority: 0.0,
            observed: false,
            dither_number: 0,
        }
    }

    #[test]
    fn mjd_conversion_matches_epoch() {
        assert_eq!(unix_to_mjd(0.0), 40587.0);
        assert_eq!(unix_to_mjd(86400.0), 40588.0);
        assert!((mjd_to_unix(unix_to_mjd(1_700_000_000.0)) - 1_700_000_000.0).abs() < 1e-3);
    }

    #[test]
    fn eligibility_window_is_half_open() {
        let o = obs(100.0, 101.0);
        assert!(!o.is_eligible(99.999));
        assert!(o.is_eligible(100.0));
        assert!(o.is_eligible(100.5));
        assert!(!o.is_eligible(101.0));
        assert!(o.is_expired(101.0));
    }

    #[test]
    fn observed_is_never_eligible() {
        let mut o = obs(100.0, 101.0);
        o.observed = true;
        assert!(!o.is_eligible(100.5));
    }

    #[test]
    fn dither_offsets_are_arcseconds() {
        let d = DitherOffset { ra_arcsec: 36.0, dec_arcsec: -7.2 };
        let (ra, dec) = d.apply(10.0, 20.0);
        assert!((ra - 10.01).abs() < 1e-9);
        assert!((dec - 19.998).abs() < 1e-9);
    }
}
