use std::{fmt, sync::Arc};

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub const INITIAL_TEMPERATURE: f64 = 68.2;
pub const INITIAL_HUMIDITY: f64 = 45.0;
pub const MINIMUM_HUMIDITY: f64 = 30.0;
pub const MAXIMUM_HUMIDITY: f64 = 80.0;

/// Source of randomness for the simulation. Tests plug in fixed sequences.
pub trait Entropy: Send {
    /// Uniform value in `[0, 1)`.
    fn unit(&mut self) -> f64;

    /// True with probability `1 / n`.
    fn one_in(&mut self, n: u32) -> bool;

    /// Uniform integer in `low..=high`.
    fn between(&mut self, low: u32, high: u32) -> u32;
}

pub struct SystemEntropy(StdRng);

impl SystemEntropy {
    pub fn new() -> Self {
        SystemEntropy(StdRng::from_entropy())
    }

    #[cfg(test)]
    pub fn seeded(seed: u64) -> Self {
        SystemEntropy(StdRng::seed_from_u64(seed))
    }
}

impl Default for SystemEntropy {
    fn default() -> Self {
        Self::new()
    }
}

impl Entropy for SystemEntropy {
    fn unit(&mut self) -> f64 {
        self.0.gen::<f64>()
    }

    fn one_in(&mut self, n: u32) -> bool {
        self.0.gen_ratio(1, n)
    }

    fn between(&mut self, low: u32, high: u32) -> u32 {
        self.0.gen_range(low..=high)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ClimateMode {
    Heating,
    Cooling,
    Idle,
}

impl fmt::Display for ClimateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClimateMode::Heating => "Heating",
            ClimateMode::Cooling => "Cooling",
            ClimateMode::Idle => "Idle",
        };

        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClimateState {
    pub current_temperature: f64,
    pub target_temperature: f64,
    pub current_humidity: f64,
    pub mode: ClimateMode,
}

impl Default for ClimateState {
    fn default() -> Self {
        ClimateState {
            current_temperature: INITIAL_TEMPERATURE,
            target_temperature: INITIAL_TEMPERATURE,
            current_humidity: INITIAL_HUMIDITY,
            mode: ClimateMode::Idle,
        }
    }
}

/// Climate state shared between the telemetry loop and the gateway callbacks.
/// Every read-modify-write goes through this one lock.
pub type SharedClimate = Arc<Mutex<ClimateState>>;

pub fn mk_shared_climate() -> SharedClimate {
    Arc::new(Mutex::new(ClimateState::default()))
}

impl ClimateState {
    /// Advance the simulated room by one step. Returns a warning event when the
    /// simulated system decides to raise one.
    pub fn tick(&mut self, entropy: &mut dyn Entropy) -> Option<String> {
        match self.mode {
            ClimateMode::Heating => {
                self.current_temperature += entropy.unit();

                if self.current_temperature >= self.target_temperature {
                    self.current_temperature = self.target_temperature;
                    self.mode = ClimateMode::Idle;
                }
            }
            ClimateMode::Cooling => {
                self.current_temperature -= entropy.unit();

                if self.current_temperature <= self.target_temperature {
                    self.current_temperature = self.target_temperature;
                    self.mode = ClimateMode::Idle;
                }
            }
            ClimateMode::Idle => {}
        }

        let humidity_deviation = entropy.unit();
        if entropy.one_in(2) {
            self.current_humidity += humidity_deviation;
        } else {
            self.current_humidity -= humidity_deviation;
        }
        self.current_humidity = self.current_humidity.clamp(MINIMUM_HUMIDITY, MAXIMUM_HUMIDITY);

        if entropy.one_in(5) {
            Some(format!(
                "Warning: system error code {}",
                entropy.between(1, 1000)
            ))
        } else {
            None
        }
    }
}
