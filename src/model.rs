use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub const MS_PER_HOUR: Ms = 3_600_000;

// ── Spots ────────────────────────────────────────────────────────

/// Presentation status of a spot. Never stored — always derived from the
/// active booking (if any) plus the latest sensor reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpotStatus {
    Available,
    Reserved,
    Occupied,
    SoonAvailable,
}

/// The exclusive claim a non-terminal booking places on a spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveHold {
    pub booking_id: Ulid,
    pub status: BookingStatus,
}

#[derive(Debug, Clone)]
pub struct SpotState {
    pub id: Ulid,
    /// Lot identifier; doubles as the destination key for prediction history.
    pub lot: String,
    pub slot_label: String,
    pub rate_per_hour: f64,
    pub ev_charging: bool,
    /// At most one booking in a non-terminal state may hold the spot.
    pub active_booking: Option<ActiveHold>,
    /// Latest raw sensor reading for the physical bay.
    pub sensor_occupied: bool,
    /// Set when a hold is released while the bay still reads occupied;
    /// cleared by the first sensor event reporting the bay free.
    pub awaiting_clear: bool,
}

impl SpotState {
    pub fn new(id: Ulid, lot: String, slot_label: String, rate_per_hour: f64, ev_charging: bool) -> Self {
        Self {
            id,
            lot,
            slot_label,
            rate_per_hour,
            ev_charging,
            active_booking: None,
            sensor_occupied: false,
            awaiting_clear: false,
        }
    }

    /// The single authoritative status derivation. All consumers go through
    /// this so a spot never shows different statuses to different callers.
    pub fn derived_status(&self) -> SpotStatus {
        match self.active_booking {
            Some(ActiveHold { status: BookingStatus::Active, .. }) => SpotStatus::Occupied,
            Some(_) => SpotStatus::Reserved,
            None if self.sensor_occupied && self.awaiting_clear => SpotStatus::SoonAvailable,
            None if self.sensor_occupied => SpotStatus::Occupied,
            None => SpotStatus::Available,
        }
    }
}

/// Spot as the API sees it, with the status materialized.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpotView {
    pub id: Ulid,
    pub lot: String,
    pub slot_label: String,
    pub rate_per_hour: f64,
    pub ev_charging: bool,
    pub status: SpotStatus,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Active,
    Completed,
    Cancelled,
    Expired,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Expired)
    }

    /// Statuses under which the booking holds its spot.
    pub fn holds_spot(self) -> bool {
        !self.is_terminal()
    }
}

/// Points and carbon granted at settlement. Stored on the booking so repeated
/// verify calls replay the same result instead of re-crediting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardGrant {
    pub points_earned: i64,
    pub carbon_saved: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Booking {
    pub id: Ulid,
    pub spot_id: Ulid,
    pub user_id: Ulid,
    pub duration_hours: f64,
    pub ev_charging: bool,
    /// rate × duration + EV surcharge, fixed at creation, never recomputed.
    pub amount: f64,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub start: Ms,
    pub end: Ms,
    pub order_id: Option<String>,
    pub reward: Option<RewardGrant>,
}

// ── Transactions ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub user_id: Ulid,
    pub amount: f64,
    pub payment_method: String,
    pub order_id: String,
    pub payment_id: String,
    pub status: TransactionStatus,
    pub created_at: Ms,
}

// ── Rewards ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RewardAccount {
    pub user_id: Ulid,
    pub points: i64,
    pub carbon_saved_kg: f64,
}

impl RewardAccount {
    pub fn new(user_id: Ulid) -> Self {
        Self { user_id, points: 0, carbon_saved_kg: 0.0 }
    }
}

// ── Users ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: Ulid,
    pub email: String,
    pub name: String,
    pub picture: Option<String>,
    pub created_at: Ms,
}

// ── Shared spaces ────────────────────────────────────────────────

/// A user-contributed parking space listing. Listings are advertisements,
/// not bookable inventory: they never enter the hold machinery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SharedSpace {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub name: String,
    pub location: String,
    pub rate_per_hour: f64,
    pub slot_type: String,
    pub available: bool,
    pub created_at: Ms,
}

// ── Prediction history ───────────────────────────────────────────

/// Historical occupancy samples for one lot, bucketed by hour of day.
/// The predictor only needs per-bucket counts, so that is all we keep.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LotHistory {
    pub free: [u64; 24],
    pub total: [u64; 24],
}

impl LotHistory {
    pub fn record(&mut self, hour_of_day: u8, free: bool) {
        let h = (hour_of_day % 24) as usize;
        self.total[h] += 1;
        if free {
            self.free[h] += 1;
        }
    }

    pub fn sample_count(&self) -> u64 {
        self.total.iter().sum()
    }
}

/// Bucket an absolute timestamp into its UTC hour of day.
pub fn hour_of_day(at: Ms) -> u8 {
    (at.div_euclid(MS_PER_HOUR).rem_euclid(24)) as u8
}

// ── WAL events ───────────────────────────────────────────────────

/// The event types — flat, no nesting. This is the WAL record format.
/// `PaymentVerified` carries the computed grant so replay never recomputes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    SpotRegistered {
        id: Ulid,
        lot: String,
        slot_label: String,
        rate_per_hour: f64,
        ev_charging: bool,
        // Sensor flags are false at registration; compaction snapshots use
        // them to restore live state.
        sensor_occupied: bool,
        awaiting_clear: bool,
    },
    SensorReported {
        spot_id: Ulid,
        occupied: bool,
        at: Ms,
    },
    UserRegistered {
        id: Ulid,
        email: String,
        name: String,
        picture: Option<String>,
        created_at: Ms,
    },
    UserUpdated {
        id: Ulid,
        name: String,
    },
    SharedSpaceListed {
        id: Ulid,
        owner_id: Ulid,
        name: String,
        location: String,
        rate_per_hour: f64,
        slot_type: String,
        created_at: Ms,
    },
    BookingCreated {
        id: Ulid,
        spot_id: Ulid,
        user_id: Ulid,
        duration_hours: f64,
        ev_charging: bool,
        amount: f64,
        created_at: Ms,
    },
    BookingCancelled {
        id: Ulid,
    },
    BookingExpired {
        id: Ulid,
    },
    OrderCreated {
        booking_id: Ulid,
        order_id: String,
    },
    PaymentVerified {
        booking_id: Ulid,
        transaction_id: Ulid,
        order_id: String,
        payment_id: String,
        points_earned: i64,
        carbon_saved: f64,
        at: Ms,
    },
    BookingClosed {
        id: Ulid,
    },
    /// Compaction-only: replaces the per-event sensor history of a lot.
    LotHistorySnapshot {
        lot: String,
        free: [u64; 24],
        total: [u64; 24],
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_derivation_prefers_booking_over_sensor() {
        let mut spot = SpotState::new(Ulid::new(), "lot_001".into(), "A1".into(), 50.0, false);
        assert_eq!(spot.derived_status(), SpotStatus::Available);

        spot.active_booking = Some(ActiveHold {
            booking_id: Ulid::new(),
            status: BookingStatus::Pending,
        });
        spot.sensor_occupied = true;
        assert_eq!(spot.derived_status(), SpotStatus::Reserved);

        spot.active_booking.as_mut().unwrap().status = BookingStatus::Confirmed;
        assert_eq!(spot.derived_status(), SpotStatus::Reserved);

        spot.active_booking.as_mut().unwrap().status = BookingStatus::Active;
        assert_eq!(spot.derived_status(), SpotStatus::Occupied);
    }

    #[test]
    fn status_soon_available_until_sensor_clears() {
        let mut spot = SpotState::new(Ulid::new(), "lot_001".into(), "A1".into(), 50.0, false);
        spot.sensor_occupied = true;
        spot.awaiting_clear = true;
        assert_eq!(spot.derived_status(), SpotStatus::SoonAvailable);

        // Walk-in occupancy without a recent release is plain occupied.
        spot.awaiting_clear = false;
        assert_eq!(spot.derived_status(), SpotStatus::Occupied);

        spot.sensor_occupied = false;
        assert_eq!(spot.derived_status(), SpotStatus::Available);
    }

    #[test]
    fn terminal_statuses_do_not_hold() {
        assert!(BookingStatus::Pending.holds_spot());
        assert!(BookingStatus::Confirmed.holds_spot());
        assert!(BookingStatus::Active.holds_spot());
        assert!(!BookingStatus::Completed.holds_spot());
        assert!(!BookingStatus::Cancelled.holds_spot());
        assert!(!BookingStatus::Expired.holds_spot());
    }

    #[test]
    fn hour_bucketing() {
        assert_eq!(hour_of_day(0), 0);
        assert_eq!(hour_of_day(MS_PER_HOUR), 1);
        assert_eq!(hour_of_day(25 * MS_PER_HOUR), 1);
        assert_eq!(hour_of_day(23 * MS_PER_HOUR + 1), 23);
        // Pre-epoch timestamps still land in a valid bucket.
        assert_eq!(hour_of_day(-MS_PER_HOUR), 23);
    }

    #[test]
    fn lot_history_counts() {
        let mut h = LotHistory::default();
        h.record(9, true);
        h.record(9, false);
        h.record(33, true); // wraps to hour 9
        assert_eq!(h.total[9], 3);
        assert_eq!(h.free[9], 2);
        assert_eq!(h.sample_count(), 3);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            id: Ulid::new(),
            spot_id: Ulid::new(),
            user_id: Ulid::new(),
            duration_hours: 1.5,
            ev_charging: true,
            amount: 125.0,
            created_at: 1_700_000_000_000,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
