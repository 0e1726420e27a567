//! Stateful solar charge-controller simulator for local development.
//!
//! Models what the field monitor reports:
//! - Diurnal PV curve (sunrise at a quarter period, sunset at three quarters)
//! - Cloud cover as a mean-reverting random walk
//! - Battery state of charge integrated from charge and load power
//! - Daily and lifetime energy counters
//! - Switchable load output with low-voltage disconnect

use std::f64::consts::PI;
use std::fmt;

use serde::Serialize;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1): sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Weather presets
// ---------------------------------------------------------------------------

/// Selectable via the `SIM_WEATHER` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weather {
    /// Full sun with a little haze.
    Clear,
    /// Passing clouds; output swings between 30% and 100%.
    Cloudy,
    /// Thick cover all day.
    Overcast,
}

impl Weather {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cloudy" => Self::Cloudy,
            "overcast" => Self::Overcast,
            _ => Self::Clear,
        }
    }

    /// (mean clear-sky fraction, walk sigma, lower bound, upper bound)
    fn cloud_params(self) -> (f64, f64, f64, f64) {
        match self {
            Self::Clear => (0.95, 0.01, 0.85, 1.0),
            Self::Cloudy => (0.65, 0.12, 0.3, 1.0),
            Self::Overcast => (0.25, 0.03, 0.15, 0.4),
        }
    }
}

impl fmt::Display for Weather {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clear => write!(f, "clear"),
            Self::Cloudy => write!(f, "cloudy"),
            Self::Overcast => write!(f, "overcast"),
        }
    }
}

// ---------------------------------------------------------------------------
// Telemetry payload (nested layout the bridge decodes)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    pub device_id: String,
    pub pv: Pv,
    pub battery: Battery,
    pub load: Load,
    pub energy: Energy,
    pub rssi: i64,
    pub uptime: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pv {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Battery {
    pub voltage: f64,
    pub charge_current: f64,
    pub charge_power: f64,
    pub temperature: f64,
    pub soc: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Load {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Energy {
    pub today_kwh: f64,
    pub total_kwh: f64,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

const CHARGE_EFFICIENCY: f64 = 0.95;
/// Load output is cut below this state of charge.
const LOW_VOLTAGE_DISCONNECT_SOC: f64 = 10.0;

pub struct SolarSim {
    device_id: String,
    weather: Weather,
    day_period_s: f64,

    panel_peak_w: f64,
    battery_wh: f64,
    load_w: f64,

    cloud: f64,
    soc: f64,
    load_enabled: bool,
    energy_today_kwh: f64,
    energy_total_kwh: f64,
    day_index: Option<i64>,
}

impl SolarSim {
    /// `day_period_s` is the length of one simulated day. Use 86400 for real
    /// time or something like 600 for fast iteration.
    pub fn new(device_id: impl Into<String>, weather: Weather, day_period_s: f64) -> Self {
        let (mean, _, _, _) = weather.cloud_params();
        Self {
            device_id: device_id.into(),
            weather,
            day_period_s,
            panel_peak_w: 100.0,
            battery_wh: 12.8 * 20.0,
            load_w: 6.0,
            cloud: mean,
            soc: 60.0,
            load_enabled: true,
            energy_today_kwh: 0.0,
            energy_total_kwh: 12.5,
            day_index: None,
        }
    }

    pub fn set_load(&mut self, enabled: bool) {
        self.load_enabled = enabled;
    }

    #[cfg(test)]
    pub fn soc(&self) -> f64 {
        self.soc
    }

    /// Fraction of peak irradiance at simulated time `now_s`, 0 at night.
    fn sun(&self, now_s: f64) -> f64 {
        let phase = (now_s / self.day_period_s).rem_euclid(1.0);
        if !(0.25..0.75).contains(&phase) {
            return 0.0;
        }
        (PI * (phase - 0.25) / 0.5).sin().max(0.0)
    }

    fn step_cloud(&mut self) {
        let (mean, sigma, lo, hi) = self.weather.cloud_params();
        let pull = 0.1 * (mean - self.cloud);
        self.cloud = (self.cloud + pull + gaussian(0.0, sigma)).clamp(lo, hi);
    }

    /// Advance the model by `dt_s` seconds ending at `now_s` and return the
    /// reading the monitor would publish.
    pub fn tick(&mut self, now_s: f64, dt_s: f64, uptime_s: u64) -> Telemetry {
        let day = (now_s / self.day_period_s).floor() as i64;
        if self.day_index.is_some_and(|d| d != day) {
            self.energy_today_kwh = 0.0;
        }
        self.day_index = Some(day);

        self.step_cloud();
        let irradiance = self.sun(now_s) * self.cloud;

        let mut pv_power = if irradiance > 0.0 {
            (self.panel_peak_w * irradiance + gaussian(0.0, 0.5)).max(0.0)
        } else {
            0.0
        };
        let load_on = self.load_enabled && self.soc > LOW_VOLTAGE_DISCONNECT_SOC;
        let load_power = if load_on {
            (self.load_w * (1.0 + gaussian(0.0, 0.03))).max(0.0)
        } else {
            0.0
        };

        // A full battery only absorbs what the load draws.
        let mut charge_power = pv_power * CHARGE_EFFICIENCY;
        if self.soc >= 100.0 {
            charge_power = charge_power.min(load_power);
            pv_power = charge_power / CHARGE_EFFICIENCY;
        }

        let net_wh = (charge_power - load_power) * dt_s / 3600.0;
        self.soc = (self.soc + net_wh / self.battery_wh * 100.0).clamp(0.0, 100.0);

        let harvested_kwh = pv_power * dt_s / 3_600_000.0;
        self.energy_today_kwh += harvested_kwh;
        self.energy_total_kwh += harvested_kwh;

        let batt_voltage = 11.9 + 0.016 * self.soc + if charge_power > 1.0 { 0.3 } else { 0.0 };
        let pv_voltage = if irradiance > 0.0 {
            17.0 + 2.0 * irradiance + gaussian(0.0, 0.1)
        } else {
            0.4 + fastrand::f64() * 0.2
        };
        let load_voltage = if load_on { batt_voltage - 0.05 } else { 0.0 };

        Telemetry {
            device_id: self.device_id.clone(),
            pv: Pv {
                voltage: round2(pv_voltage),
                current: round2(pv_power / pv_voltage),
                power: round2(pv_power),
            },
            battery: Battery {
                voltage: round2(batt_voltage),
                charge_current: round2(charge_power / batt_voltage),
                charge_power: round2(charge_power),
                temperature: round2(20.0 + 8.0 * irradiance + gaussian(0.0, 0.2)),
                soc: round2(self.soc),
            },
            load: Load {
                voltage: round2(load_voltage),
                current: if load_on { round2(load_power / load_voltage) } else { 0.0 },
                power: round2(load_power),
                enabled: self.load_enabled,
            },
            energy: Energy {
                today_kwh: (self.energy_today_kwh * 1000.0).round() / 1000.0,
                total_kwh: (self.energy_total_kwh * 1000.0).round() / 1000.0,
            },
            rssi: (gaussian(-62.0, 3.0).round() as i64).clamp(-100, -30),
            uptime: uptime_s,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: f64 = 600.0;
    const NOON: f64 = DAY / 2.0;
    const MIDNIGHT: f64 = 0.0;

    #[test]
    fn night_produces_no_pv_power() {
        let mut sim = SolarSim::new("sim", Weather::Clear, DAY);
        for _ in 0..20 {
            let t = sim.tick(MIDNIGHT, 10.0, 0);
            assert_eq!(t.pv.power, 0.0);
            assert_eq!(t.battery.charge_power, 0.0);
        }
    }

    #[test]
    fn clear_noon_is_near_peak() {
        let mut sim = SolarSim::new("sim", Weather::Clear, DAY);
        let t = sim.tick(NOON, 10.0, 0);
        assert!(t.pv.power > 75.0, "noon output too low: {}", t.pv.power);
        assert!(t.pv.power <= 105.0, "noon output too high: {}", t.pv.power);
    }

    #[test]
    fn overcast_yields_less_than_clear() {
        let avg = |weather| {
            let mut sim = SolarSim::new("sim", weather, DAY);
            (0..50).map(|_| sim.tick(NOON, 1.0, 0).pv.power).sum::<f64>() / 50.0
        };
        assert!(avg(Weather::Overcast) < avg(Weather::Clear));
    }

    #[test]
    fn disabled_load_draws_nothing() {
        let mut sim = SolarSim::new("sim", Weather::Clear, DAY);
        sim.set_load(false);
        let t = sim.tick(MIDNIGHT, 10.0, 0);
        assert_eq!(t.load.power, 0.0);
        assert_eq!(t.load.current, 0.0);
        assert!(!t.load.enabled);
    }

    #[test]
    fn load_drains_battery_at_night() {
        let mut sim = SolarSim::new("sim", Weather::Clear, DAY);
        let start = sim.soc();
        for _ in 0..100 {
            sim.tick(MIDNIGHT, 60.0, 0);
        }
        assert!(sim.soc() < start);
    }

    #[test]
    fn sun_charges_battery_with_load_off() {
        let mut sim = SolarSim::new("sim", Weather::Clear, DAY);
        sim.set_load(false);
        let start = sim.soc();
        for _ in 0..100 {
            sim.tick(NOON, 60.0, 0);
        }
        assert!(sim.soc() > start);
    }

    #[test]
    fn soc_stays_within_bounds() {
        let mut sim = SolarSim::new("sim", Weather::Clear, DAY);
        for i in 0..2000 {
            let t = sim.tick(NOON, 600.0, i);
            assert!((0.0..=100.0).contains(&t.battery.soc));
        }
        sim.set_load(true);
        for i in 0..2000 {
            let t = sim.tick(MIDNIGHT, 600.0, i);
            assert!((0.0..=100.0).contains(&t.battery.soc));
        }
    }

    #[test]
    fn low_voltage_disconnect_cuts_load() {
        let mut sim = SolarSim::new("sim", Weather::Clear, DAY);
        for _ in 0..5000 {
            sim.tick(MIDNIGHT, 600.0, 0);
        }
        let t = sim.tick(MIDNIGHT, 600.0, 0);
        assert!(t.battery.soc <= LOW_VOLTAGE_DISCONNECT_SOC);
        assert_eq!(t.load.power, 0.0);
        assert!(t.load.enabled, "the output switch itself stays on");
    }

    #[test]
    fn energy_today_resets_on_new_day_total_keeps_growing() {
        let mut sim = SolarSim::new("sim", Weather::Clear, DAY);
        sim.set_load(false);
        let first = sim.tick(NOON, 60.0, 0);
        let second = sim.tick(NOON + 1.0, 60.0, 0);
        assert!(second.energy.today_kwh >= first.energy.today_kwh);

        let next_day = sim.tick(DAY + MIDNIGHT, 60.0, 0);
        assert_eq!(next_day.energy.today_kwh, 0.0);
        assert!(next_day.energy.total_kwh >= second.energy.total_kwh);
    }

    #[test]
    fn telemetry_serializes_nested_layout() {
        let mut sim = SolarSim::new("esp32-sim", Weather::Clear, DAY);
        let json = serde_json::to_value(sim.tick(NOON, 10.0, 42)).unwrap();

        assert_eq!(json["device_id"], "esp32-sim");
        assert_eq!(json["uptime"], 42);
        for key in ["voltage", "current", "power"] {
            assert!(json["pv"][key].is_number(), "pv.{key}");
        }
        for key in ["voltage", "charge_current", "charge_power", "temperature", "soc"] {
            assert!(json["battery"][key].is_number(), "battery.{key}");
        }
        assert!(json["load"]["enabled"].is_boolean());
        assert!(json["energy"]["today_kwh"].is_number());
        assert!(json["energy"]["total_kwh"].is_number());
    }

    #[test]
    fn weather_from_str_lossy() {
        assert_eq!(Weather::from_str_lossy("clear"), Weather::Clear);
        assert_eq!(Weather::from_str_lossy("CLOUDY"), Weather::Cloudy);
        assert_eq!(Weather::from_str_lossy("Overcast"), Weather::Overcast);
        assert_eq!(Weather::from_str_lossy("hail"), Weather::Clear);
        assert_eq!(Weather::from_str_lossy(""), Weather::Clear);
    }

    #[test]
    fn weather_display() {
        assert_eq!(Weather::Clear.to_string(), "clear");
        assert_eq!(Weather::Cloudy.to_string(), "cloudy");
        assert_eq!(Weather::Overcast.to_string(), "overcast");
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let mean = (0..n).map(|_| approx_std_normal()).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.15, "mean should be near zero: {mean}");
    }
}
