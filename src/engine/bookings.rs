use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{clear_hold, now_ms, set_hold, Engine, EngineError};

fn validate_duration(duration_hours: f64) -> Result<(), EngineError> {
    if !duration_hours.is_finite() {
        return Err(EngineError::Validation("duration must be a number"));
    }
    if duration_hours < MIN_DURATION_HOURS {
        return Err(EngineError::Validation("duration below minimum"));
    }
    if duration_hours > MAX_DURATION_HOURS {
        return Err(EngineError::Validation("duration above maximum"));
    }
    let steps = duration_hours / DURATION_STEP_HOURS;
    if (steps - steps.round()).abs() > 1e-9 {
        return Err(EngineError::Validation("duration must step by half hours"));
    }
    Ok(())
}

impl Engine {
    /// Create a booking, taking the spot hold atomically. On Conflict no
    /// partial state is left behind: the booking is never inserted and the
    /// spot is untouched.
    pub async fn create_booking(
        &self,
        user_id: Ulid,
        spot_id: Ulid,
        duration_hours: f64,
        ev_charging: bool,
    ) -> Result<Booking, EngineError> {
        validate_duration(duration_hours)?;

        // Serialization point: holding this guard, nobody else can claim the spot.
        let mut spot = self.try_hold(&spot_id).await?;
        if ev_charging && !spot.ev_charging {
            return Err(EngineError::Validation("spot has no EV charging"));
        }

        let id = Ulid::new();
        let created_at = now_ms();
        let amount = spot.rate_per_hour * duration_hours
            + if ev_charging { EV_SURCHARGE } else { 0.0 };

        let event = Event::BookingCreated {
            id,
            spot_id,
            user_id,
            duration_hours,
            ev_charging,
            amount,
            created_at,
        };
        self.wal_append(&event).await?;

        let booking = Booking {
            id,
            spot_id,
            user_id,
            duration_hours,
            ev_charging,
            amount,
            status: BookingStatus::Pending,
            created_at,
            start: created_at,
            end: created_at + (duration_hours * MS_PER_HOUR as f64) as Ms,
            order_id: None,
            reward: None,
        };
        self.bookings.insert(
            id,
            std::sync::Arc::new(tokio::sync::RwLock::new(booking.clone())),
        );
        set_hold(&mut spot, id, BookingStatus::Pending);
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        Ok(booking)
    }

    /// Cancel a pending/confirmed booking. Only the owner may cancel; the
    /// hold is released immediately.
    pub async fn cancel_booking(&self, booking_id: Ulid, user_id: Ulid) -> Result<Booking, EngineError> {
        let booking_arc = self.booking(&booking_id).ok_or(EngineError::NotFound(booking_id))?;
        let mut booking = booking_arc.write().await;
        if booking.user_id != user_id {
            return Err(EngineError::Unauthorized(booking_id));
        }
        if !matches!(booking.status, BookingStatus::Pending | BookingStatus::Confirmed) {
            return Err(EngineError::Validation("booking is not cancellable"));
        }

        self.wal_append(&Event::BookingCancelled { id: booking_id }).await?;
        booking.status = BookingStatus::Cancelled;
        self.release_spot_of(&booking).await;
        Ok(booking.clone())
    }

    /// Explicitly end an active session before its booked duration elapses.
    pub async fn close_booking(&self, booking_id: Ulid, user_id: Ulid) -> Result<Booking, EngineError> {
        let booking_arc = self.booking(&booking_id).ok_or(EngineError::NotFound(booking_id))?;
        let mut booking = booking_arc.write().await;
        if booking.user_id != user_id {
            return Err(EngineError::Unauthorized(booking_id));
        }
        if booking.status != BookingStatus::Active {
            return Err(EngineError::Validation("booking is not active"));
        }

        self.wal_append(&Event::BookingClosed { id: booking_id }).await?;
        booking.status = BookingStatus::Completed;
        self.release_spot_of(&booking).await;
        Ok(booking.clone())
    }

    pub async fn bookings_for(&self, user_id: Ulid) -> Vec<Booking> {
        let mut out = Vec::new();
        for entry in self.bookings.iter() {
            let booking_arc = entry.value().clone();
            drop(entry);
            let guard = booking_arc.read().await;
            if guard.user_id == user_id {
                out.push(guard.clone());
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        out
    }

    /// Periodic sweep: expire unsettled bookings past the hold TTL and
    /// complete active sessions whose booked duration has elapsed. Every
    /// candidate is re-checked under its own write lock at the moment we act,
    /// so a concurrent verify or cancel wins cleanly.
    pub async fn sweep_stale(&self, now: Ms) -> (usize, usize) {
        let candidates: Vec<Ulid> = self
            .bookings
            .iter()
            .filter_map(|entry| {
                let guard = entry.value().try_read().ok()?;
                let stale = match guard.status {
                    BookingStatus::Pending | BookingStatus::Confirmed => {
                        guard.created_at + self.hold_ttl_ms <= now
                    }
                    BookingStatus::Active => guard.end <= now,
                    _ => false,
                };
                stale.then_some(guard.id)
            })
            .collect();

        let (mut expired, mut completed) = (0, 0);
        for id in candidates {
            match self.sweep_one(id, now).await {
                Ok(Some(BookingStatus::Expired)) => expired += 1,
                Ok(Some(_)) => completed += 1,
                Ok(None) => {} // state moved on since collection
                Err(e) => tracing::warn!("sweep skip {id}: {e}"),
            }
        }
        (expired, completed)
    }

    async fn sweep_one(&self, booking_id: Ulid, now: Ms) -> Result<Option<BookingStatus>, EngineError> {
        let Some(booking_arc) = self.booking(&booking_id) else { return Ok(None) };
        let mut booking = booking_arc.write().await;

        match booking.status {
            BookingStatus::Pending | BookingStatus::Confirmed
                if booking.created_at + self.hold_ttl_ms <= now =>
            {
                self.wal_append(&Event::BookingExpired { id: booking_id }).await?;
                booking.status = BookingStatus::Expired;
                self.release_spot_of(&booking).await;
                metrics::counter!(crate::observability::HOLDS_EXPIRED_TOTAL).increment(1);
                Ok(Some(BookingStatus::Expired))
            }
            BookingStatus::Active if booking.end <= now => {
                self.wal_append(&Event::BookingClosed { id: booking_id }).await?;
                booking.status = BookingStatus::Completed;
                self.release_spot_of(&booking).await;
                Ok(Some(BookingStatus::Completed))
            }
            _ => Ok(None),
        }
    }

    /// Mirror a booking's new non-terminal status onto its spot hold.
    pub(super) async fn sync_hold_status(&self, booking: &Booking) {
        if let Some(spot) = self.spot(&booking.spot_id) {
            let mut guard = spot.write().await;
            if matches!(guard.active_booking, Some(h) if h.booking_id == booking.id) {
                set_hold(&mut guard, booking.id, booking.status);
            }
        }
    }

    /// Release the spot hold owned by this booking, if still in force.
    pub(super) async fn release_spot_of(&self, booking: &Booking) {
        if let Some(spot) = self.spot(&booking.spot_id) {
            let mut guard = spot.write().await;
            if matches!(guard.active_booking, Some(h) if h.booking_id == booking.id) {
                clear_hold(&mut guard);
            }
        }
    }
}

#[cfg(test)]
mod unit {
    use super::*;

    #[test]
    fn duration_validation() {
        assert!(validate_duration(0.5).is_ok());
        assert!(validate_duration(2.0).is_ok());
        assert!(validate_duration(3.5).is_ok());
        assert!(validate_duration(24.0).is_ok());

        assert!(validate_duration(0.0).is_err());
        assert!(validate_duration(0.4).is_err());
        assert!(validate_duration(-1.0).is_err());
        assert!(validate_duration(1.25).is_err());
        assert!(validate_duration(24.5).is_err());
        assert!(validate_duration(f64::NAN).is_err());
        assert!(validate_duration(f64::INFINITY).is_err());
    }
}
