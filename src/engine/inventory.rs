use rand::Rng;
use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{apply_sensor, now_ms, Engine, EngineError};

fn view(spot: &SpotState) -> SpotView {
    SpotView {
        id: spot.id,
        lot: spot.lot.clone(),
        slot_label: spot.slot_label.clone(),
        rate_per_hour: spot.rate_per_hour,
        ev_charging: spot.ev_charging,
        status: spot.derived_status(),
    }
}

impl Engine {
    pub async fn register_spot(
        &self,
        lot: String,
        slot_label: String,
        rate_per_hour: f64,
        ev_charging: bool,
    ) -> Result<SpotView, EngineError> {
        if self.spots.len() >= MAX_SPOTS {
            return Err(EngineError::LimitExceeded("too many spots"));
        }
        if lot.is_empty() || lot.len() > MAX_LOT_LEN {
            return Err(EngineError::Validation("bad lot name"));
        }
        if slot_label.is_empty() || slot_label.len() > MAX_NAME_LEN {
            return Err(EngineError::Validation("bad slot label"));
        }
        if !rate_per_hour.is_finite() || rate_per_hour < 0.0 {
            return Err(EngineError::Validation("bad hourly rate"));
        }

        let id = Ulid::new();
        let event = Event::SpotRegistered {
            id,
            lot: lot.clone(),
            slot_label: slot_label.clone(),
            rate_per_hour,
            ev_charging,
            sensor_occupied: false,
            awaiting_clear: false,
        };
        self.wal_append(&event).await?;

        let spot = SpotState::new(id, lot, slot_label, rate_per_hour, ev_charging);
        let v = view(&spot);
        self.spots
            .insert(id, std::sync::Arc::new(tokio::sync::RwLock::new(spot)));
        Ok(v)
    }

    pub async fn get_spot(&self, id: &Ulid) -> Result<SpotView, EngineError> {
        let spot = self.spot(id).ok_or(EngineError::NotFound(*id))?;
        let guard = spot.read().await;
        Ok(view(&guard))
    }

    pub async fn list_spots(
        &self,
        status: Option<SpotStatus>,
        ev_charging: Option<bool>,
    ) -> Vec<SpotView> {
        let mut out = Vec::new();
        for entry in self.spots.iter() {
            let spot_arc = entry.value().clone();
            drop(entry);
            let guard = spot_arc.read().await;
            if ev_charging.is_some_and(|ev| guard.ev_charging != ev) {
                continue;
            }
            let v = view(&guard);
            if status.is_some_and(|s| v.status != s) {
                continue;
            }
            out.push(v);
        }
        out.sort_by(|a, b| a.slot_label.cmp(&b.slot_label).then(a.id.cmp(&b.id)));
        out
    }

    /// The single-writer serialization point per spot: acquires the spot's
    /// write guard and hands it out only if no non-terminal booking holds the
    /// spot. The caller completes the hold under this guard, so concurrent
    /// attempts resolve with exactly one winner.
    pub(super) async fn try_hold(
        &self,
        spot_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SpotState>, EngineError> {
        let spot = self.spot(spot_id).ok_or(EngineError::NotFound(*spot_id))?;
        let guard = spot.write_owned().await;
        if let Some(hold) = guard.active_booking {
            return Err(EngineError::Conflict(hold.booking_id));
        }
        Ok(guard)
    }

    /// Ingest one raw occupancy report. Never overrides an in-force hold —
    /// the derived status keeps preferring the booking — but the reading is
    /// always recorded for the prediction history.
    pub async fn apply_sensor_event(
        &self,
        spot_id: &Ulid,
        occupied: bool,
    ) -> Result<SpotStatus, EngineError> {
        let spot = self.spot(spot_id).ok_or(EngineError::NotFound(*spot_id))?;
        let mut guard = spot.write().await;

        let at = now_ms();
        let event = Event::SensorReported { spot_id: *spot_id, occupied, at };
        self.wal_append(&event).await?;

        self.history
            .entry(guard.lot.clone())
            .or_default()
            .record(hour_of_day(at), !occupied);
        apply_sensor(&mut guard, occupied);
        Ok(guard.derived_status())
    }

    /// Stand-in for the physical sensor network: each spot has a 10% chance
    /// of reporting a flipped occupancy state. Returns the number of events
    /// ingested.
    pub async fn simulate_sensor_sweep(&self) -> Result<usize, EngineError> {
        let spot_ids: Vec<Ulid> = self.spots.iter().map(|e| *e.key()).collect();
        let mut ingested = 0;
        for id in spot_ids {
            let flip = rand::thread_rng().gen_bool(0.1);
            if !flip {
                continue;
            }
            let occupied = {
                let Some(spot) = self.spot(&id) else { continue };
                let guard = spot.read().await;
                !guard.sensor_occupied
            };
            self.apply_sensor_event(&id, occupied).await?;
            ingested += 1;
        }
        Ok(ingested)
    }

    /// List a user-contributed space. Listings are advertisements only and
    /// never enter the booking hold machinery.
    pub async fn create_shared_space(
        &self,
        owner_id: Ulid,
        name: String,
        location: String,
        rate_per_hour: f64,
        slot_type: String,
    ) -> Result<SharedSpace, EngineError> {
        if self.shared_spaces.len() >= MAX_SPOTS {
            return Err(EngineError::LimitExceeded("too many shared spaces"));
        }
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(EngineError::Validation("bad space name"));
        }
        if location.is_empty() || location.len() > MAX_NAME_LEN {
            return Err(EngineError::Validation("bad location"));
        }
        if slot_type.is_empty() || slot_type.len() > MAX_NAME_LEN {
            return Err(EngineError::Validation("bad slot type"));
        }
        if !rate_per_hour.is_finite() || rate_per_hour < 0.0 {
            return Err(EngineError::Validation("bad hourly rate"));
        }

        let space = SharedSpace {
            id: Ulid::new(),
            owner_id,
            name,
            location,
            rate_per_hour,
            slot_type,
            available: true,
            created_at: now_ms(),
        };
        self.wal_append(&Event::SharedSpaceListed {
            id: space.id,
            owner_id: space.owner_id,
            name: space.name.clone(),
            location: space.location.clone(),
            rate_per_hour: space.rate_per_hour,
            slot_type: space.slot_type.clone(),
            created_at: space.created_at,
        })
        .await?;
        self.shared_spaces.insert(space.id, space.clone());
        Ok(space)
    }

    /// Available listings, newest first.
    pub fn list_shared_spaces(&self) -> Vec<SharedSpace> {
        let mut out: Vec<SharedSpace> = self
            .shared_spaces
            .iter()
            .filter(|e| e.value().available)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        out
    }

    /// Populate a fresh deployment with a sample lot. Idempotence is the
    /// caller's concern; repeated calls add more spots.
    pub async fn seed_spots(&self, count: usize) -> Result<Vec<SpotView>, EngineError> {
        const RATES: [f64; 4] = [30.0, 40.0, 50.0, 60.0];
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let spot = self
                .register_spot(
                    "lot_001".into(),
                    format!("A{}", i + 1),
                    RATES[i % RATES.len()],
                    i % 3 == 0,
                )
                .await?;
            out.push(spot);
        }
        Ok(out)
    }
}
