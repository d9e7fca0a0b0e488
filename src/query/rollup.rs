//! Hourly rollup accumulator
//!
//! Shared by the materializer (persisted buckets) and the query router
//! (ad hoc buckets past the watermark) so both compute a bucket the same way.

use crate::storage::types::{align_down, Bucket, Reading};
use std::collections::HashMap;

type BucketKey = (i64, String, String, String);

#[derive(Debug, Clone, Copy)]
struct Accumulator {
    sum: f64,
    min: f64,
    max: f64,
    count: u64,
    quality_sum: u64,
}

impl Accumulator {
    fn new(value: f64, quality: u8) -> Self {
        Self {
            sum: value,
            min: value,
            max: value,
            count: 1,
            quality_sum: quality as u64,
        }
    }

    fn add(&mut self, value: f64, quality: u8) {
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.count += 1;
        self.quality_sum += quality as u64;
    }
}

/// Groups readings into `(bucket, machine, sensor, location)` buckets
#[derive(Debug)]
pub struct Rollup {
    width: i64,
    groups: HashMap<BucketKey, Accumulator>,
}

impl Rollup {
    pub fn new(bucket_width_ms: i64) -> Self {
        Self {
            width: bucket_width_ms,
            groups: HashMap::new(),
        }
    }

    pub fn add(&mut self, reading: &Reading) {
        let key = (
            align_down(reading.time, self.width),
            reading.machine_id.clone(),
            reading.sensor_type.clone(),
            reading.location.clone(),
        );
        self.groups
            .entry(key)
            .and_modify(|acc| acc.add(reading.value, reading.quality))
            .or_insert_with(|| Accumulator::new(reading.value, reading.quality));
    }

    pub fn extend<'a>(&mut self, readings: impl IntoIterator<Item = &'a Reading>) {
        for reading in readings {
            self.add(reading);
        }
    }

    /// Number of buckets accumulated so far
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Buckets ordered newest hour first, then by machine, sensor, location
    pub fn finish(self) -> Vec<Bucket> {
        let mut buckets: Vec<Bucket> = self
            .groups
            .into_iter()
            .map(|((hour, machine_id, sensor_type, location), acc)| Bucket {
                hour,
                machine_id,
                sensor_type,
                location,
                avg_value: acc.sum / acc.count as f64,
                min_value: acc.min,
                max_value: acc.max,
                sample_count: acc.count,
                quality_pct: acc.quality_sum as f64 / acc.count as f64,
            })
            .collect();
        sort_buckets(&mut buckets);
        buckets
    }
}

/// Sort buckets newest hour first, ties by machine, sensor, location
pub fn sort_buckets(buckets: &mut [Bucket]) {
    buckets.sort_by(|a, b| {
        b.hour
            .cmp(&a.hour)
            .then_with(|| a.machine_id.cmp(&b.machine_id))
            .then_with(|| a.sensor_type.cmp(&b.sensor_type))
            .then_with(|| a.location.cmp(&b.location))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::HOUR_MS;

    #[test]
    fn test_hourly_rollup() {
        let base = 10 * HOUR_MS;
        let mut rollup = Rollup::new(HOUR_MS);
        for (i, v) in [25.5, 26.1, 25.8, 26.0, 25.9].iter().enumerate() {
            rollup.add(
                &Reading::new(base + i as i64 * 60_000, "MACHINE_001", "temperature", *v)
                    .quality(90 + i as u8),
            );
        }
        rollup.add(&Reading::new(base + HOUR_MS, "MACHINE_001", "temperature", 30.0));

        let buckets = rollup.finish();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].hour, base + HOUR_MS);

        let b = &buckets[1];
        assert_eq!(b.hour, base);
        assert_eq!(b.sample_count, 5);
        assert!((b.avg_value - 25.86).abs() < 1e-9);
        assert_eq!(b.min_value, 25.5);
        assert_eq!(b.max_value, 26.1);
        assert!((b.quality_pct - 92.0).abs() < 1e-9);
    }

    #[test]
    fn test_locations_are_separate_buckets() {
        let mut rollup = Rollup::new(HOUR_MS);
        rollup.add(&Reading::new(0, "MACHINE_001", "pressure", 1.0).location("Plant_A"));
        rollup.add(&Reading::new(10, "MACHINE_001", "pressure", 1.2).location("Plant_B"));
        assert_eq!(rollup.len(), 2);

        let buckets = rollup.finish();
        assert_eq!(buckets[0].location, "Plant_A");
        assert_eq!(buckets[1].location, "Plant_B");
    }
}
