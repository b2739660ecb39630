//! Statistics derived from the number of uniquely confirmed bicycles.
//!
//! This is a pure function of the registry size. Both the stream overlay and
//! the statistics endpoint go through [`snapshot`], so the two always agree
//! for the same count.

use serde::{Serialize, Serializer};

/// Fuel cost saved per bicycle, in PHP.
pub const FUEL_SAVED_PER_BIKE: f64 = 112.0;
/// Calories burned per bicycle, in kcal.
pub const CALORIES_PER_BIKE: f64 = 317.0;
/// Carbon emission avoided per bicycle, in kg CO2.
pub const CARBON_PER_BIKE: f64 = 3.74;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct StatisticsSnapshot {
    pub count: u64,
    #[serde(serialize_with = "two_decimals")]
    pub fuel_saved: f64,
    #[serde(serialize_with = "two_decimals")]
    pub calories_burned: f64,
    #[serde(serialize_with = "two_decimals")]
    pub carbon_reduction: f64,
}

pub fn snapshot(count: u64) -> StatisticsSnapshot {
    let n = count as f64;
    StatisticsSnapshot {
        count,
        fuel_saved: n * FUEL_SAVED_PER_BIKE,
        calories_burned: n * CALORIES_PER_BIKE,
        carbon_reduction: n * CARBON_PER_BIKE,
    }
}

impl StatisticsSnapshot {
    /// Overlay lines drawn on every streamed frame.
    pub fn overlay_lines(&self) -> [String; 4] {
        [
            format!("Bicycle Count: {}", self.count),
            format!("Fuel Saved: PHP {:.2}", self.fuel_saved),
            format!("Calories Burned: {:.2} kcal", self.calories_burned),
            format!("Carbon Reduction: {:.2} kg", self.carbon_reduction),
        ]
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn two_decimals<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(round2(*value))
}
