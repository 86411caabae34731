//! Simulated sensor readings
//!
//! Readings are drawn in whole hundredths so the formatted value can never round up
//! past the upper bound of its range.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Temperature range in hundredths of a degree: [20.00, 35.00)
const TEMPERATURE_CENTI: Range<u32> = 2000..3500;
/// Humidity range in hundredths of a percent: [60.00, 80.00)
const HUMIDITY_CENTI: Range<u32> = 6000..8000;

/// One synthetic reading, both values formatted with exactly two fractional digits.
///
/// Fields are declared in key order so the JSON form is deterministic:
/// `{"humidity":"..","temperature":".."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub humidity: String,
    pub temperature: String,
}

impl TelemetrySample {
    /// Serialize to the publish payload
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Last generated reading together with the exact message that was published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastTelemetry {
    pub sample: TelemetrySample,
    pub message: String,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

/// Uniform random reading source. Not cryptographically strong.
#[derive(Debug)]
pub struct TelemetryGenerator {
    rng: StdRng,
}

impl TelemetryGenerator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible generator for tests
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn generate(&mut self) -> TelemetrySample {
        let temperature = self.rng.gen_range(TEMPERATURE_CENTI);
        let humidity = self.rng.gen_range(HUMIDITY_CENTI);
        TelemetrySample {
            humidity: format_centi(humidity),
            temperature: format_centi(temperature),
        }
    }
}

impl Default for TelemetryGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn format_centi(value: u32) -> String {
    format!("{}.{:02}", value / 100, value % 100)
}
