//! Deviation detection against per-class nominal bands.
//!
//! [`evaluate`] is the stateless check. [`BandRegistry`] resolves which band
//! applies to a device: the class whose configured prefix is the longest
//! match for the device id, else the default class.

use std::sync::Arc;

use crate::types::TelemetryReading;

/// Violation iff `|value - nominal| > nominal * tolerance_fraction`.
pub fn evaluate(reading: &TelemetryReading, nominal: f64, tolerance_fraction: f64) -> bool {
    exceeds_band(reading.value, nominal, tolerance_fraction)
}

fn exceeds_band(value: f64, nominal: f64, tolerance_fraction: f64) -> bool {
    (value - nominal).abs() > nominal * tolerance_fraction
}

/// Nominal band for one device class.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceBand {
    pub class: String,
    pub nominal: f64,
    pub tolerance_fraction: f64,
}

impl DeviceBand {
    pub fn new(class: impl Into<String>, nominal: f64, tolerance_fraction: f64) -> Self {
        Self {
            class: class.into(),
            nominal,
            tolerance_fraction,
        }
    }

    pub fn is_violated_by(&self, reading: &TelemetryReading) -> bool {
        evaluate(reading, self.nominal, self.tolerance_fraction)
    }

    /// Absolute allowed deviation.
    pub fn tolerance(&self) -> f64 {
        self.nominal * self.tolerance_fraction
    }
}

/// Device-id prefix to band lookup.
#[derive(Debug, Clone)]
pub struct BandRegistry {
    /// Sorted longest prefix first.
    prefixes: Vec<(String, Arc<DeviceBand>)>,
    default_band: Arc<DeviceBand>,
}

impl BandRegistry {
    pub fn new(default_band: DeviceBand) -> Self {
        Self {
            prefixes: Vec::new(),
            default_band: Arc::new(default_band),
        }
    }

    /// Route every device whose id starts with one of `prefixes` to `band`.
    #[must_use]
    pub fn with_class<I, S>(mut self, band: DeviceBand, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let band = Arc::new(band);
        for prefix in prefixes {
            self.prefixes.push((prefix.into(), Arc::clone(&band)));
        }
        self.prefixes
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        self
    }

    pub fn band_for(&self, device_id: &str) -> &DeviceBand {
        self.prefixes
            .iter()
            .find(|(prefix, _)| device_id.starts_with(prefix.as_str()))
            .map_or(&self.default_band, |(_, band)| band)
    }

    pub fn default_band(&self) -> &DeviceBand {
        &self.default_band
    }
}
