use serde::Serialize;

use crate::limits::*;
use crate::model::{hour_of_day, Ms, MS_PER_HOUR};

use super::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Low,
    Medium,
    High,
}

fn tier_for(availability_pct: u8) -> Tier {
    match availability_pct {
        66.. => Tier::High,
        33.. => Tier::Medium,
        _ => Tier::Low,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PredictionBucket {
    /// Start of the hour-of-day bucket, e.g. "14:00".
    pub time: String,
    pub availability: u8,
    pub tier: Tier,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub destination: String,
    pub arrival_time: Ms,
    pub duration_hours: f64,
    /// 0–100, capped below 100 to signal residual uncertainty.
    pub confidence: u8,
    pub predictions: Vec<PredictionBucket>,
    pub recommended: Option<PredictionBucket>,
}

/// Monotone in the sample count, capped at MAX_CONFIDENCE.
fn confidence_for(samples: u64) -> u8 {
    let raw = 30.0 + 10.0 * ((1 + samples) as f64).ln();
    (raw.floor() as u64).min(MAX_CONFIDENCE as u64) as u8
}

impl Engine {
    /// Descriptive statistical forecast over the lot's occupancy history.
    /// Deterministic given the same history; degrades to a fixed
    /// low-confidence distribution when a destination has no samples instead
    /// of failing.
    pub fn predict(&self, destination: &str, arrival_time: Ms, duration_hours: f64) -> PredictionResult {
        let buckets = if duration_hours.is_finite() && duration_hours > 0.0 {
            (duration_hours.ceil() as usize).clamp(1, MAX_PREDICTION_BUCKETS)
        } else {
            1
        };

        let history = self.history.get(destination).map(|e| e.value().clone());

        let mut predictions = Vec::with_capacity(buckets);
        let mut window_samples: u64 = 0;
        for i in 0..buckets {
            let hour = hour_of_day(arrival_time + i as Ms * MS_PER_HOUR);
            let label = format!("{hour:02}:00");
            let (free, total) = history
                .as_ref()
                .map(|h| (h.free[hour as usize], h.total[hour as usize]))
                .unwrap_or((0, 0));
            window_samples += total;

            let availability = if total == 0 {
                DEFAULT_AVAILABILITY_PCT
            } else {
                ((100 * free / total) as u8).min(100)
            };
            predictions.push(PredictionBucket {
                time: label,
                availability,
                tier: tier_for(availability),
            });
        }

        let confidence = if window_samples == 0 {
            DEFAULT_CONFIDENCE
        } else {
            confidence_for(window_samples)
        };

        let recommended = predictions
            .iter()
            .max_by_key(|b| b.availability)
            .cloned();

        PredictionResult {
            destination: destination.to_string(),
            arrival_time,
            duration_hours,
            confidence,
            predictions,
            recommended,
        }
    }
}
