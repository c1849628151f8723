//! Sample extractor for Health Auto Export documents
//!
//! Normalizes the semi-structured export JSON into canonical `MetricSample`
//! and `Workout` values. Pure transformation over a fully loaded document:
//! the iterators borrow the `serde_json::Value` and produce values on demand,
//! so each call is restartable and nothing is materialized up front.
//!
//! Field naming varies between export versions, so each data point is probed
//! under both known names in a fixed preference order (`date` before `start`,
//! `qty` before `value`, `source` before `sources`). Points that yield no
//! timestamp or no value are dropped and counted, never raised.

use crate::types::{MetricSample, Workout, WorkoutHrSample};
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use serde_json::Value;

const EMPTY: &[Value] = &[];

/// Parse a Health Auto Export timestamp.
///
/// Accepts `"YYYY-MM-DD HH:MM:SS +HHMM"` first, then falls back to the bare
/// first 19 characters with no offset (treated as UTC). Returns `None` for
/// anything else; callers drop the record instead of failing the run.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    if raw.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S %z") {
        return Some(ts);
    }

    let head = raw.get(..19)?;
    let naive = NaiveDateTime::parse_from_str(head, "%Y-%m-%d %H:%M:%S").ok()?;
    Some(naive.and_utc().fixed_offset())
}

fn metrics_array(doc: &Value) -> &[Value] {
    doc.get("data")
        .and_then(|d| d.get("metrics"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(EMPTY)
}

fn workouts_array(doc: &Value) -> &[Value] {
    doc.get("data")
        .and_then(|d| d.get("workouts"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(EMPTY)
}

fn data_points(metric: &Value) -> &[Value] {
    metric
        .get("data")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(EMPTY)
}

fn str_field<'a>(obj: &'a Value, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn num_field(obj: &Value, key: &str) -> Option<f64> {
    obj.get(key).and_then(Value::as_f64)
}

/// Total number of metric data points in the document, parsable or not.
/// Used for drop accounting: `raw_written + skipped_raw` must equal this
/// for a full run.
pub fn total_metric_records(doc: &Value) -> usize {
    metrics_array(doc).iter().map(|m| data_points(m).len()).sum()
}

/// Total number of workout entries in the document, parsable or not.
pub fn total_workout_records(doc: &Value) -> usize {
    workouts_array(doc).len()
}

/// Lazy iterator over every metric data point in the document.
pub fn metric_samples(doc: &Value) -> SampleIter<'_> {
    SampleIter {
        metrics: metrics_array(doc),
        metric_idx: 0,
        point_idx: 0,
        dropped: 0,
    }
}

/// Lazy iterator over the document's workouts.
pub fn workouts(doc: &Value) -> WorkoutIter<'_> {
    WorkoutIter {
        workouts: workouts_array(doc),
        idx: 0,
        dropped: 0,
    }
}

pub struct SampleIter<'a> {
    metrics: &'a [Value],
    metric_idx: usize,
    point_idx: usize,
    dropped: usize,
}

impl SampleIter<'_> {
    /// Number of data points skipped so far (missing timestamp or value).
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl Iterator for SampleIter<'_> {
    type Item = MetricSample;

    fn next(&mut self) -> Option<MetricSample> {
        loop {
            let metric = self.metrics.get(self.metric_idx)?;
            let points = data_points(metric);

            let Some(point) = points.get(self.point_idx) else {
                self.metric_idx += 1;
                self.point_idx = 0;
                continue;
            };
            self.point_idx += 1;

            let raw_ts = str_field(point, "date").or_else(|| str_field(point, "start"));
            let Some(timestamp) = raw_ts.and_then(parse_timestamp) else {
                self.dropped += 1;
                continue;
            };

            let Some(value) = num_field(point, "qty").or_else(|| num_field(point, "value"))
            else {
                self.dropped += 1;
                continue;
            };

            let source = str_field(point, "source")
                .or_else(|| str_field(point, "sources"))
                .unwrap_or("");

            return Some(MetricSample {
                metric_name: str_field(metric, "name").unwrap_or("").to_string(),
                timestamp,
                value,
                unit: str_field(metric, "units").unwrap_or("").to_string(),
                source: source.to_string(),
            });
        }
    }
}

pub struct WorkoutIter<'a> {
    workouts: &'a [Value],
    idx: usize,
    dropped: usize,
}

impl WorkoutIter<'_> {
    /// Number of workout entries skipped so far (no parsable start time).
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl Iterator for WorkoutIter<'_> {
    type Item = Workout;

    fn next(&mut self) -> Option<Workout> {
        loop {
            let entry = self.workouts.get(self.idx)?;
            self.idx += 1;

            match parse_workout(entry) {
                Some(workout) => return Some(workout),
                None => {
                    self.dropped += 1;
                    continue;
                }
            }
        }
    }
}

fn parse_workout(w: &Value) -> Option<Workout> {
    let start = str_field(w, "start").and_then(parse_timestamp)?;
    let end = str_field(w, "end").and_then(parse_timestamp).unwrap_or(start);

    let distance = w.get("distance");
    let energy = w.get("activeEnergyBurned");
    let intensity = w.get("intensity");

    // stepCount is an array of interval entries with a qty each
    let total_steps = w
        .get("stepCount")
        .and_then(Value::as_array)
        .map(|steps| {
            steps
                .iter()
                .filter_map(|s| num_field(s, "qty"))
                .sum::<f64>()
        })
        .filter(|total| *total > 0.0)
        .map(|total| total as i64);

    // Per-workout heart-rate reduction happens once here, at parse time.
    // The export carries per-interval Avg/Max/Min; the summary statistics
    // are derived from the Avg series.
    let mut hr_values: Vec<f64> = Vec::new();
    let mut heart_rate_samples: Vec<WorkoutHrSample> = Vec::new();

    if let Some(hr_data) = w.get("heartRateData").and_then(Value::as_array) {
        for hr in hr_data {
            let avg = num_field(hr, "Avg");
            if let Some(avg) = avg {
                hr_values.push(avg);
            }
            if let (Some(ts), Some(avg)) =
                (str_field(hr, "date").and_then(parse_timestamp), avg)
            {
                heart_rate_samples.push(WorkoutHrSample {
                    timestamp: ts,
                    heart_rate: avg,
                });
            }
        }
    }

    let (avg_hr, max_hr, min_hr) = if hr_values.is_empty() {
        (None, None, None)
    } else {
        let sum: f64 = hr_values.iter().sum();
        let max = hr_values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let min = hr_values.iter().cloned().fold(f64::INFINITY, f64::min);
        (Some(sum / hr_values.len() as f64), Some(max), Some(min))
    };

    Some(Workout {
        workout_id: str_field(w, "id").unwrap_or("").to_string(),
        name: str_field(w, "name").unwrap_or("Unknown").to_string(),
        start,
        end,
        duration_seconds: num_field(w, "duration").unwrap_or(0.0),
        location: str_field(w, "location").unwrap_or("").to_string(),
        total_distance: distance.and_then(|d| num_field(d, "qty")),
        distance_unit: distance
            .and_then(|d| str_field(d, "units"))
            .unwrap_or("km")
            .to_string(),
        total_active_energy: energy.and_then(|e| num_field(e, "qty")),
        energy_unit: energy
            .and_then(|e| str_field(e, "units"))
            .unwrap_or("kJ")
            .to_string(),
        total_steps,
        avg_heart_rate: avg_hr,
        max_heart_rate: max_hr,
        min_heart_rate: min_hr,
        intensity: intensity.and_then(|i| num_field(i, "qty")),
        intensity_unit: intensity
            .and_then(|i| str_field(i, "units"))
            .unwrap_or("")
            .to_string(),
        heart_rate_samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_timestamp_with_offset() {
        let ts = parse_timestamp("2025-12-08 00:12:43 +0100").unwrap();
        assert_eq!(ts.offset().local_minus_utc(), 3600);
        assert_eq!(ts.format("%H:%M:%S").to_string(), "00:12:43");

        // Same instant expressed in UTC resolves equal.
        let utc = parse_timestamp("2025-12-07 23:12:43 +0000").unwrap();
        assert_eq!(ts, utc);
    }

    #[test]
    fn test_parse_timestamp_without_offset_is_utc() {
        let ts = parse_timestamp("2025-12-08 00:12:43").unwrap();
        assert_eq!(ts.offset().local_minus_utc(), 0);
        assert_eq!(ts.format("%H:%M:%S").to_string(), "00:12:43");
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("not-a-date").is_none());
        assert!(parse_timestamp("2025-13-99 99:99:99").is_none());
    }

    #[test]
    fn test_samples_field_name_variants() {
        let doc = json!({"data": {"metrics": [{
            "name": "heart_rate",
            "units": "bpm",
            "data": [
                {"date": "2025-01-05 10:05:00 +0000", "qty": 61.0, "source": "Watch"},
                {"start": "2025-01-05 10:06:00 +0000", "value": 62.0, "sources": "Watch|Phone"},
            ],
        }]}});

        let samples: Vec<_> = metric_samples(&doc).collect();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].metric_name, "heart_rate");
        assert_eq!(samples[0].unit, "bpm");
        assert_eq!(samples[0].value, 61.0);
        assert_eq!(samples[0].source, "Watch");
        assert_eq!(samples[1].value, 62.0);
        assert_eq!(samples[1].source, "Watch|Phone");
    }

    #[test]
    fn test_samples_drop_and_count_bad_records() {
        let doc = json!({"data": {"metrics": [{
            "name": "step_count",
            "units": "count",
            "data": [
                {"date": "not-a-date", "qty": 10.0},
                {"date": "2025-01-05 10:05:00 +0000"},
                {"date": "2025-01-05 10:06:00 +0000", "qty": 12.0},
            ],
        }]}});

        let mut iter = metric_samples(&doc);
        let kept: Vec<_> = iter.by_ref().collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].value, 12.0);
        assert_eq!(iter.dropped(), 2);
        assert_eq!(total_metric_records(&doc), 3);
    }

    #[test]
    fn test_samples_restartable_per_call() {
        let doc = json!({"data": {"metrics": [{
            "name": "heart_rate",
            "units": "bpm",
            "data": [{"date": "2025-01-05 10:05:00 +0000", "qty": 61.0}],
        }]}});

        assert_eq!(metric_samples(&doc).count(), 1);
        assert_eq!(metric_samples(&doc).count(), 1);
    }

    #[test]
    fn test_empty_document() {
        let doc = json!({});
        assert_eq!(metric_samples(&doc).count(), 0);
        assert_eq!(workouts(&doc).count(), 0);
        assert_eq!(total_metric_records(&doc), 0);
        assert_eq!(total_workout_records(&doc), 0);
    }

    #[test]
    fn test_workout_heart_rate_summary() {
        let doc = json!({"data": {"workouts": [{
            "id": "w1",
            "name": "Outdoor Run",
            "start": "2025-01-05 08:00:00 +0100",
            "end": "2025-01-05 08:30:00 +0100",
            "duration": 1800.0,
            "location": "Outdoor",
            "distance": {"qty": 5.2, "units": "km"},
            "activeEnergyBurned": {"qty": 1250.0, "units": "kJ"},
            "stepCount": [{"qty": 2000.0}, {"qty": 2500.0}],
            "heartRateData": [
                {"date": "2025-01-05 08:01:00 +0100", "Avg": 120.0, "Max": 130.0, "Min": 110.0},
                {"date": "2025-01-05 08:02:00 +0100", "Avg": 150.0, "Max": 160.0, "Min": 140.0},
                {"date": "2025-01-05 08:03:00 +0100", "Avg": 135.0},
            ],
        }]}});

        let parsed: Vec<_> = workouts(&doc).collect();
        assert_eq!(parsed.len(), 1);

        let w = &parsed[0];
        assert_eq!(w.workout_id, "w1");
        assert_eq!(w.total_steps, Some(4500));
        assert_eq!(w.total_distance, Some(5.2));
        assert_eq!(w.avg_heart_rate, Some(135.0));
        assert_eq!(w.max_heart_rate, Some(150.0));
        assert_eq!(w.min_heart_rate, Some(120.0));
        assert_eq!(w.heart_rate_samples.len(), 3);
        assert_eq!(w.heart_rate_samples[1].heart_rate, 150.0);
    }

    #[test]
    fn test_workout_without_start_is_dropped() {
        let doc = json!({"data": {"workouts": [
            {"id": "w1", "name": "Broken", "start": "garbage"},
            {"id": "w2", "name": "Walk", "start": "2025-01-05 09:00:00 +0000", "duration": 600.0},
        ]}});

        let mut iter = workouts(&doc);
        let kept: Vec<_> = iter.by_ref().collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].workout_id, "w2");
        // end falls back to start when absent
        assert_eq!(kept[0].end, kept[0].start);
        assert_eq!(iter.dropped(), 1);
    }
}
