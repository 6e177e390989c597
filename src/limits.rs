//! Policy constants and guard-rail limits.

use crate::model::Ms;

// ── Pricing / rewards policy ─────────────────────────────────────

/// Flat surcharge added to a booking that requests EV charging.
pub const EV_SURCHARGE: f64 = 50.0;

/// Reward points granted per booked hour (floored over the whole duration).
pub const POINTS_PER_HOUR: f64 = 5.0;

/// Carbon credited per booked hour, in kilograms.
pub const CARBON_KG_PER_HOUR: f64 = 0.8;

/// Wallet balance shown per reward point.
pub const BALANCE_PER_POINT: f64 = 0.1;

// ── Booking validation ───────────────────────────────────────────

pub const MIN_DURATION_HOURS: f64 = 0.5;
pub const DURATION_STEP_HOURS: f64 = 0.5;
pub const MAX_DURATION_HOURS: f64 = 24.0;

// ── Hold lifecycle ───────────────────────────────────────────────

/// How long a pending/confirmed booking may sit unsettled before the
/// expiry sweep releases its spot.
pub const DEFAULT_HOLD_TTL_MS: Ms = 10 * 60 * 1000;

// ── Prediction policy ────────────────────────────────────────────

/// Confidence never exceeds this, to signal residual uncertainty.
pub const MAX_CONFIDENCE: u8 = 95;

/// Confidence reported when a destination has no history at all.
pub const DEFAULT_CONFIDENCE: u8 = 20;

/// Availability assumed per bucket when a destination has no history.
pub const DEFAULT_AVAILABILITY_PCT: u8 = 50;

// ── Guard rails ──────────────────────────────────────────────────

pub const MAX_SPOTS: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LOT_LEN: usize = 128;
pub const MAX_PREDICTION_BUCKETS: usize = 24;

/// Sessions minted from the identity provider live this long.
pub const SESSION_TTL_MS: Ms = 7 * 24 * 60 * 60 * 1000;
