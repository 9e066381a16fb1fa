/**
 * SIMULATED DEVICES - Stand-ins for the camera, mount, dome and ephemeris daemons
 *
 * ROLE:
 * Answers the same methods the supervisor sends to real hardware daemons,
 * with just enough physics to walk the observatory through a night:
 * the detector cools toward its setpoint, the mount and the dome shutter
 * take time to move, and the sun altitude is whatever the operator sets.
 *
 * OPERATION:
 * - Time is passed in explicitly so the behaviour is deterministic
 * - `ping` and `getState` are answered by every device
 * - Unknown methods are refused with an error reply
 */

use observatory_kernel::bus::{GET_STATE_METHOD, PING_METHOD};
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};

pub type Reply = Result<Value, String>;

#[derive(Debug, Clone)]
pub struct SimTimings {
    pub cool_down: Duration,
    pub warm_up: Duration,
    pub slew: Duration,
    pub shutter: Duration,
}

impl Default for SimTimings {
    fn default() -> Self {
        Self {
            cool_down: Duration::from_secs(20),
            warm_up: Duration::from_secs(20),
            slew: Duration::from_secs(5),
            shutter: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Tec {
    Off,
    Cooling(Instant),
    Warming(Instant),
}

pub struct CameraSim {
    tec: Tec,
    timings: SimTimings,
    exposures: u64,
    last_exposure: Option<Value>,
    observing_defaults: bool,
}

impl CameraSim {
    pub fn new(timings: SimTimings) -> Self {
        Self { tec: Tec::Off, timings, exposures: 0, last_exposure: None, observing_defaults: false }
    }

    fn at_setpoint(&self, now: Instant) -> bool {
        matches!(self.tec, Tec::Cooling(t) if now.duration_since(t) >= self.timings.cool_down)
    }

    fn warmed_up(&self, now: Instant) -> bool {
        match self.tec {
            Tec::Off => true,
            Tec::Warming(t) => now.duration_since(t) >= self.timings.warm_up,
            Tec::Cooling(_) => false,
        }
    }

    fn handle(&mut self, method: &str, args: &[Value], now: Instant) -> Reply {
        match method {
            "startup" => {
                self.tec = Tec::Cooling(now);
                Ok(json!("cooling"))
            }
            "stop_cooling" => {
                self.tec = Tec::Warming(now);
                self.observing_defaults = false;
                Ok(json!("warming"))
            }
            "set_observing_defaults" => {
                self.observing_defaults = true;
                Ok(json!("ok"))
            }
            "flush_buffers" => Ok(json!("ok")),
            "do_exposure" => {
                if !self.at_setpoint(now) {
                    return Err("detector not at setpoint".into());
                }
                let exposure_s = args.first().and_then(Value::as_f64).ok_or("do_exposure needs an exposure time")?;
                if exposure_s < 0.0 {
                    return Err(format!("negative exposure time {exposure_s}"));
                }
                self.exposures += 1;
                self.last_exposure = Some(Value::Array(args.to_vec()));
                Ok(json!(self.exposures))
            }
            other => Err(format!("unknown method {other}")),
        }
    }

    fn state(&self, now: Instant) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("tec_at_setpoint".into(), json!(self.at_setpoint(now)));
        m.insert("warmed_up".into(), json!(self.warmed_up(now)));
        m.insert("observing_defaults".into(), json!(self.observing_defaults));
        m.insert("exposures".into(), json!(self.exposures));
        m.insert("last_exposure".into(), self.last_exposure.clone().unwrap_or(Value::Null));
        m
    }
}

pub struct MountSim {
    ra: f64,
    dec: f64,
    slew_until: Option<Instant>,
    slew_time: Duration,
}

impl MountSim {
    pub fn new(timings: &SimTimings) -> Self {
        Self { ra: 0.0, dec: 90.0, slew_until: None, slew_time: timings.slew }
    }

    fn handle(&mut self, method: &str, args: &[Value], now: Instant) -> Reply {
        match method {
            "goto_ra_dec" => {
                let (Some(ra), Some(dec)) = (args.first().and_then(Value::as_f64), args.get(1).and_then(Value::as_f64))
                else {
                    return Err("goto_ra_dec needs ra and dec in degrees".into());
                };
                if !(0.0..360.0).contains(&ra) || !(-90.0..=90.0).contains(&dec) {
                    return Err(format!("target out of range: {ra}, {dec}"));
                }
                self.ra = ra;
                self.dec = dec;
                self.slew_until = Some(now + self.slew_time);
                Ok(json!("ok"))
            }
            "park" => {
                self.ra = 0.0;
                self.dec = 90.0;
                self.slew_until = Some(now + self.slew_time);
                Ok(json!("ok"))
            }
            other => Err(format!("unknown method {other}")),
        }
    }

    fn state(&self, now: Instant) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("ra".into(), json!(self.ra));
        m.insert("dec".into(), json!(self.dec));
        m.insert("mount_is_slewing".into(), json!(self.slew_until.is_some_and(|t| now < t)));
        m
    }
}

pub struct DomeSim {
    open: bool,
    moving_until: Option<Instant>,
    travel: Duration,
}

impl DomeSim {
    pub fn new(timings: &SimTimings) -> Self {
        Self { open: false, moving_until: None, travel: timings.shutter }
    }

    fn handle(&mut self, method: &str, now: Instant) -> Reply {
        let open = match method {
            "open_shutter" => true,
            "close_shutter" => false,
            other => return Err(format!("unknown method {other}")),
        };
        if self.open != open {
            self.open = open;
            self.moving_until = Some(now + self.travel);
        }
        Ok(json!("ok"))
    }

    fn state(&self, now: Instant) -> Map<String, Value> {
        let moving = self.moving_until.is_some_and(|t| now < t);
        let mut m = Map::new();
        m.insert("shutter_moving".into(), json!(moving));
        m.insert("shutter_open".into(), json!(self.open && !moving));
        m.insert("shutter_closed".into(), json!(!self.open && !moving));
        m
    }
}

pub struct EphemSim {
    sun_alt: f64,
}

impl EphemSim {
    pub fn new(sun_alt: f64) -> Self {
        Self { sun_alt }
    }

    fn handle(&mut self, method: &str, args: &[Value]) -> Reply {
        match method {
            "set_sun_alt" => {
                self.sun_alt = args.first().and_then(Value::as_f64).ok_or("set_sun_alt needs an altitude")?;
                Ok(json!(self.sun_alt))
            }
            other => Err(format!("unknown method {other}")),
        }
    }
}

pub enum SimDevice {
    Camera(CameraSim),
    Mount(MountSim),
    Dome(DomeSim),
    Ephem(EphemSim),
}

impl SimDevice {
    /// Builds the simulation for a daemon name; names starting with `cam`
    /// are cameras.
    pub fn for_daemon(name: &str, timings: &SimTimings, sun_alt: f64) -> Option<Self> {
        if name.starts_with("cam") {
            Some(SimDevice::Camera(CameraSim::new(timings.clone())))
        } else if name == "mount" {
            Some(SimDevice::Mount(MountSim::new(timings)))
        } else if name == "dome" {
            Some(SimDevice::Dome(DomeSim::new(timings)))
        } else if name == "ephem" {
            Some(SimDevice::Ephem(EphemSim::new(sun_alt)))
        } else {
            None
        }
    }

    pub fn state(&self, now: Instant) -> Map<String, Value> {
        match self {
            SimDevice::Camera(c) => c.state(now),
            SimDevice::Mount(m) => m.state(now),
            SimDevice::Dome(d) => d.state(now),
            SimDevice::Ephem(e) => {
                let mut m = Map::new();
                m.insert("sun_alt".into(), json!(e.sun_alt));
                m
            }
        }
    }

    pub fn handle(&mut self, method: &str, args: &[Value], now: Instant) -> Reply {
        match method {
            PING_METHOD => Ok(json!("pong")),
            GET_STATE_METHOD => Ok(Value::Object(self.state(now))),
            _ => match self {
                SimDevice::Camera(c) => c.handle(method, args, now),
                SimDevice::Mount(m) => m.handle(method, args, now),
                SimDevice::Dome(d) => d.handle(method, now),
                SimDevice::Ephem(e) => e.handle(method, args),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timings() -> SimTimings {
        SimTimings {
            cool_down: Duration::from_secs(10),
            warm_up: Duration::from_secs(4),
            slew: Duration::from_secs(2),
            shutter: Duration::from_secs(3),
        }
    }

    #[test]
    fn camera_cools_then_exposes_then_warms() {
        let t0 = Instant::now();
        let mut cam = SimDevice::for_daemon("camera", &timings(), 0.0).unwrap();
        assert_eq!(cam.state(t0)["warmed_up"], json!(true));
        cam.handle("startup", &[], t0).unwrap();
        assert_eq!(cam.state(t0 + Duration::from_secs(5))["tec_at_setpoint"], json!(false));
        assert!(cam.handle("do_exposure", &[json!(30.0)], t0).is_err());

        let cold = t0 + Duration::from_secs(10);
        assert_eq!(cam.state(cold)["tec_at_setpoint"], json!(true));
        assert_eq!(cam.handle("do_exposure", &[json!(30.0), json!("J"), json!(7), json!(0)], cold), Ok(json!(1)));
        assert_eq!(cam.state(cold)["last_exposure"], json!([30.0, "J", 7, 0]));

        cam.handle("stop_cooling", &[], cold).unwrap();
        assert_eq!(cam.state(cold)["warmed_up"], json!(false));
        assert_eq!(cam.state(cold + Duration::from_secs(4))["warmed_up"], json!(true));
    }

    #[test]
    fn mount_reports_slewing_until_it_arrives() {
        let t0 = Instant::now();
        let mut mount = SimDevice::for_daemon("mount", &timings(), 0.0).unwrap();
        mount.handle("goto_ra_dec", &[json!(150.0), json!(-12.5)], t0).unwrap();
        let s = mount.state(t0 + Duration::from_secs(1));
        assert_eq!(s["mount_is_slewing"], json!(true));
        assert_eq!(s["ra"], json!(150.0));
        assert_eq!(mount.state(t0 + Duration::from_secs(2))["mount_is_slewing"], json!(false));
        assert!(mount.handle("goto_ra_dec", &[json!(400.0), json!(0.0)], t0).is_err());
        assert!(mount.handle("goto_ra_dec", &[json!("north")], t0).is_err());
    }

    #[test]
    fn dome_shutter_travels_before_reporting_open() {
        let t0 = Instant::now();
        let mut dome = SimDevice::for_daemon("dome", &timings(), 0.0).unwrap();
        assert_eq!(dome.state(t0)["shutter_closed"], json!(true));
        dome.handle("open_shutter", &[], t0).unwrap();
        let s = dome.state(t0 + Duration::from_secs(1));
        assert_eq!((s["shutter_moving"].clone(), s["shutter_open"].clone()), (json!(true), json!(false)));
        assert_eq!(dome.state(t0 + Duration::from_secs(3))["shutter_open"], json!(true));
        // Repeating the command does not restart the travel.
        dome.handle("open_shutter", &[], t0 + Duration::from_secs(3)).unwrap();
        assert_eq!(dome.state(t0 + Duration::from_secs(3))["shutter_open"], json!(true));
    }

    #[test]
    fn every_device_answers_ping_and_get_state() {
        let now = Instant::now();
        let mut ephem = SimDevice::for_daemon("ephem", &timings(), -20.0).unwrap();
        assert_eq!(ephem.handle(PING_METHOD, &[], now), Ok(json!("pong")));
        assert_eq!(ephem.handle(GET_STATE_METHOD, &[], now), Ok(json!({"sun_alt": -20.0})));
        ephem.handle("set_sun_alt", &[json!(4.0)], now).unwrap();
        assert_eq!(ephem.state(now)["sun_alt"], json!(4.0));
        assert_eq!(ephem.handle("open", &[], now), Err("unknown method open".to_string()));
        assert!(SimDevice::for_daemon("chiller", &timings(), 0.0).is_none());
    }
}
