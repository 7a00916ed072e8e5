use color_eyre::Result;
use eyre::eyre;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::climate::{ClimateMode, ClimateState, SharedClimate};

pub const BUILDING_ID: &str = "B.12345";
pub const ROOM_NUMBER: u32 = 12;
pub const TARGET_TEMPERATURE_KEY: &str = "TargetTemperature";

/// Desired properties as pushed by the operator side. Unknown keys (including
/// `$version` metadata) are kept but ignored.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct DesiredProperties(pub Map<String, Value>);

impl DesiredProperties {
    /// Target temperature, if present and non-null.
    pub fn target_temperature(&self) -> Result<Option<f64>> {
        match self.0.get(TARGET_TEMPERATURE_KEY) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value.as_f64().map(Some).ok_or_else(|| {
                eyre!(
                    "Desired {} is not a number: {}",
                    TARGET_TEMPERATURE_KEY,
                    value
                )
            }),
        }
    }
}

impl From<Value> for DesiredProperties {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => DesiredProperties(map),
            _ => DesiredProperties::default(),
        }
    }
}

/// Full twin document as returned by the hub.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Twin {
    #[serde(default)]
    pub desired: DesiredProperties,
    #[serde(default)]
    pub reported: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReportedProperties {
    #[serde(rename = "BuildingID")]
    pub building_id: &'static str,
    #[serde(rename = "RoomNumber")]
    pub room_number: u32,
    #[serde(rename = "TargetTemperature")]
    pub target_temperature: f64,
}

pub fn build_reported(state: &ClimateState) -> ReportedProperties {
    ReportedProperties {
        building_id: BUILDING_ID,
        room_number: ROOM_NUMBER,
        target_temperature: state.target_temperature,
    }
}

/// Take over the desired target temperature and decide whether to heat or
/// cool towards it. Returns whether anything was applied.
///
/// A room already at the target resolves to Cooling.
pub fn apply_desired(state: &mut ClimateState, desired: &DesiredProperties) -> Result<bool> {
    let Some(target) = desired.target_temperature()? else {
        return Ok(false);
    };

    state.target_temperature = target;

    if state.current_temperature >= target {
        state.mode = ClimateMode::Cooling;
    } else {
        state.mode = ClimateMode::Heating;
    }

    Ok(true)
}

/// Apply desired properties to the shared climate under its lock. Failures are
/// logged and swallowed; returns false when the patch was rejected.
pub async fn sync_desired(climate: &SharedClimate, desired: &DesiredProperties) -> bool {
    let mut state = climate.lock().await;

    match apply_desired(&mut state, desired) {
        Ok(true) => {
            log::info!(
                "Target temperature set to {}, climate control is now {}",
                state.target_temperature,
                state.mode
            );
            true
        }
        Ok(false) => true,
        Err(e) => {
            log::error!("Failed to apply desired properties: {:?}", e);
            false
        }
    }
}
