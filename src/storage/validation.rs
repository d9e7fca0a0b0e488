//! Ingest validation
//!
//! Every reading passes through [`Validator`] before it is routed to a
//! chunk. Structural problems (missing fields, quality outside 0..=100,
//! unknown status) and policy problems (low quality, future timestamps) are
//! refused. Values outside a sensor's configured band are accepted but
//! tagged with that sensor's anomaly status.

use crate::storage::error::ValidationError;
use crate::storage::policy::ValidationPolicy;
use crate::storage::types::{default_unit, RawReading, Reading, Status};

#[derive(Debug, Clone, Default)]
pub struct Validator {
    policy: ValidationPolicy,
}

impl Validator {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Validate a wire reading, filling defaults for quality, status and unit
    pub fn validate_raw(&self, raw: RawReading, now: i64) -> Result<Reading, ValidationError> {
        let time = raw.time.ok_or(ValidationError::MissingField("time"))?;
        let machine_id = required(raw.machine_id, "machine_id")?;
        let sensor_type = required(raw.sensor_type, "sensor_type")?;
        let location = required(raw.location, "location")?;
        let value = raw.value.ok_or(ValidationError::MissingField("value"))?;

        let quality = raw.quality.unwrap_or(100);
        if !(0..=100).contains(&quality) {
            return Err(ValidationError::QualityOutOfRange(quality));
        }

        let status = match raw.status.as_deref() {
            None => Status::Ok,
            Some(s) => s.trim().parse::<Status>()?,
        };

        let unit = match raw.unit {
            Some(unit) if !unit.trim().is_empty() => unit,
            _ => default_unit(&sensor_type).to_string(),
        };

        let reading = Reading {
            time,
            machine_id,
            sensor_type,
            location,
            value,
            unit,
            quality: quality as u8,
            status,
        };

        self.validate(reading, now)
    }

    /// Validate an already typed reading
    pub fn validate(&self, mut reading: Reading, now: i64) -> Result<Reading, ValidationError> {
        for (name, field) in [
            ("machine_id", &reading.machine_id),
            ("sensor_type", &reading.sensor_type),
            ("location", &reading.location),
        ] {
            if field.trim().is_empty() {
                return Err(ValidationError::EmptyField(name));
            }
        }

        if reading.quality > 100 {
            return Err(ValidationError::QualityOutOfRange(reading.quality as i64));
        }

        if !reading.value.is_finite() {
            return Err(ValidationError::NonFiniteValue);
        }

        if reading.time > now.saturating_add(self.policy.max_future_skew_ms) {
            return Err(ValidationError::FutureTimestamp {
                time: reading.time,
                skew_ms: self.policy.max_future_skew_ms,
            });
        }

        if reading.quality < self.policy.min_quality {
            return Err(ValidationError::LowQuality {
                quality: reading.quality,
                minimum: self.policy.min_quality,
            });
        }

        if reading.status == Status::Ok {
            if let Some(limits) = self.policy.sensors.get(&reading.sensor_type) {
                if !limits.contains(reading.value) {
                    tracing::debug!(
                        machine_id = %reading.machine_id,
                        sensor_type = %reading.sensor_type,
                        value = reading.value,
                        "Reading outside sensor limits, flagging as {}",
                        limits.flag
                    );
                    reading.status = limits.flag;
                }
            }
        }

        Ok(reading)
    }
}

fn required(field: Option<String>, name: &'static str) -> Result<String, ValidationError> {
    match field {
        None => Err(ValidationError::MissingField(name)),
        Some(s) if s.trim().is_empty() => Err(ValidationError::EmptyField(name)),
        Some(s) => Ok(s),
    }
}
