mod bookings;
mod error;
mod inventory;
mod predictor;
mod rewards;
mod settlement;

pub use error::EngineError;
pub use predictor::{PredictionBucket, PredictionResult, Tier};
pub use rewards::{LeaderboardEntry, RewardView};
pub use settlement::OrderView;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedSpot = Arc<RwLock<SpotState>>;
pub type SharedBooking = Arc<RwLock<Booking>>;
pub type SharedAccount = Arc<RwLock<RewardAccount>>;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Hold transitions ─────────────────────────────────────

/// Record or refresh the owning booking on a spot.
pub(super) fn set_hold(spot: &mut SpotState, booking_id: Ulid, status: BookingStatus) {
    spot.active_booking = Some(ActiveHold { booking_id, status });
}

/// Drop the hold. If the bay still reads occupied the spot surfaces as
/// soon_available until the sensor clears.
pub(super) fn clear_hold(spot: &mut SpotState) {
    spot.active_booking = None;
    spot.awaiting_clear = spot.sensor_occupied;
}

pub(super) fn apply_sensor(spot: &mut SpotState, occupied: bool) {
    spot.sensor_occupied = occupied;
    if !occupied {
        spot.awaiting_clear = false;
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    /// Spot inventory: the only legal mutation path for spot state.
    pub(super) spots: DashMap<Ulid, SharedSpot>,
    pub(super) bookings: DashMap<Ulid, SharedBooking>,
    /// Reward accounts, keyed by user id. Only the ledger writes them.
    pub(super) accounts: DashMap<Ulid, SharedAccount>,
    pub(super) users: DashMap<Ulid, User>,
    pub(super) users_by_email: DashMap<String, Ulid>,
    /// 1:1 with settled bookings, keyed by booking id.
    pub(super) transactions: DashMap<Ulid, Transaction>,
    /// User-contributed listings. Immutable once listed.
    pub(super) shared_spaces: DashMap<Ulid, SharedSpace>,
    /// Occupancy history per lot; the predictor's read-only input.
    pub(super) history: DashMap<String, LotHistory>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Serializes user creation so one email maps to exactly one user even
    /// under concurrent session exchanges.
    user_create: tokio::sync::Mutex<()>,
    /// Unsettled bookings older than this are expired by the sweep.
    pub hold_ttl_ms: Ms,
}

impl Engine {
    pub fn new(wal_path: PathBuf, hold_ttl_ms: Ms) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            spots: DashMap::new(),
            bookings: DashMap::new(),
            accounts: DashMap::new(),
            users: DashMap::new(),
            users_by_email: DashMap::new(),
            transactions: DashMap::new(),
            shared_spaces: DashMap::new(),
            history: DashMap::new(),
            wal_tx,
            user_create: tokio::sync::Mutex::new(()),
            hold_ttl_ms,
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds (no contention). Never block here: this runs inside an
        // async context.
        for event in &events {
            engine.apply_replay(event);
        }

        Ok(engine)
    }

    /// Write an event to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn spot(&self, id: &Ulid) -> Option<SharedSpot> {
        self.spots.get(id).map(|e| e.value().clone())
    }

    pub fn booking(&self, id: &Ulid) -> Option<SharedBooking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub fn user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn transaction_for(&self, booking_id: &Ulid) -> Option<Transaction> {
        self.transactions.get(booking_id).map(|e| e.value().clone())
    }

    /// Create or resume a user from a verified identity-provider profile.
    /// The engine never validates credentials itself.
    pub async fn ensure_user(
        &self,
        email: &str,
        name: &str,
        picture: Option<String>,
    ) -> Result<User, EngineError> {
        if let Some(user) = self.user_by_email(email) {
            return Ok(user);
        }
        if email.len() > crate::limits::MAX_NAME_LEN || name.len() > crate::limits::MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("identity field too long"));
        }

        // Creation is serialized: concurrent exchanges for the same identity
        // all pass the unlocked lookup, so re-check under the lock before
        // registering.
        let _claim = self.user_create.lock().await;
        if let Some(user) = self.user_by_email(email) {
            return Ok(user);
        }

        let user = User {
            id: Ulid::new(),
            email: email.to_string(),
            name: name.to_string(),
            picture,
            created_at: now_ms(),
        };
        let event = Event::UserRegistered {
            id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            picture: user.picture.clone(),
            created_at: user.created_at,
        };
        self.wal_append(&event).await?;
        self.insert_user(user.clone());
        Ok(user)
    }

    fn user_by_email(&self, email: &str) -> Option<User> {
        let id = *self.users_by_email.get(email)?;
        self.user(&id)
    }

    fn insert_user(&self, user: User) {
        self.accounts
            .entry(user.id)
            .or_insert_with(|| Arc::new(RwLock::new(RewardAccount::new(user.id))));
        let id = user.id;
        let email = user.email.clone();
        self.users.insert(id, user);
        // Email index last, so a visible mapping always resolves to a user.
        self.users_by_email.insert(email, id);
    }

    /// Rename a user. The rest of the profile comes from the identity
    /// provider and is not editable here.
    pub async fn update_profile(&self, user_id: Ulid, name: String) -> Result<User, EngineError> {
        if name.is_empty() || name.len() > crate::limits::MAX_NAME_LEN {
            return Err(EngineError::Validation("bad name"));
        }
        if !self.users.contains_key(&user_id) {
            return Err(EngineError::NotFound(user_id));
        }

        self.wal_append(&Event::UserUpdated { id: user_id, name: name.clone() })
            .await?;
        let mut user = self
            .users
            .get_mut(&user_id)
            .ok_or(EngineError::NotFound(user_id))?;
        user.name = name;
        Ok(user.clone())
    }

    /// Apply a replayed event. Locks are uncontended during startup replay.
    fn apply_replay(&self, event: &Event) {
        match event {
            Event::SpotRegistered {
                id,
                lot,
                slot_label,
                rate_per_hour,
                ev_charging,
                sensor_occupied,
                awaiting_clear,
            } => {
                let mut spot =
                    SpotState::new(*id, lot.clone(), slot_label.clone(), *rate_per_hour, *ev_charging);
                spot.sensor_occupied = *sensor_occupied;
                spot.awaiting_clear = *awaiting_clear;
                self.spots.insert(*id, Arc::new(RwLock::new(spot)));
            }
            Event::SensorReported { spot_id, occupied, at } => {
                if let Some(entry) = self.spots.get(spot_id) {
                    let spot_arc = entry.value().clone();
                    drop(entry);
                    let mut spot = spot_arc.try_write().expect("replay: uncontended write");
                    self.history
                        .entry(spot.lot.clone())
                        .or_default()
                        .record(hour_of_day(*at), !*occupied);
                    apply_sensor(&mut spot, *occupied);
                }
            }
            Event::UserRegistered { id, email, name, picture, created_at } => {
                self.insert_user(User {
                    id: *id,
                    email: email.clone(),
                    name: name.clone(),
                    picture: picture.clone(),
                    created_at: *created_at,
                });
            }
            Event::UserUpdated { id, name } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    user.name = name.clone();
                }
            }
            Event::SharedSpaceListed {
                id,
                owner_id,
                name,
                location,
                rate_per_hour,
                slot_type,
                created_at,
            } => {
                self.shared_spaces.insert(
                    *id,
                    SharedSpace {
                        id: *id,
                        owner_id: *owner_id,
                        name: name.clone(),
                        location: location.clone(),
                        rate_per_hour: *rate_per_hour,
                        slot_type: slot_type.clone(),
                        available: true,
                        created_at: *created_at,
                    },
                );
            }
            Event::BookingCreated {
                id,
                spot_id,
                user_id,
                duration_hours,
                ev_charging,
                amount,
                created_at,
            } => {
                let booking = Booking {
                    id: *id,
                    spot_id: *spot_id,
                    user_id: *user_id,
                    duration_hours: *duration_hours,
                    ev_charging: *ev_charging,
                    amount: *amount,
                    status: BookingStatus::Pending,
                    created_at: *created_at,
                    start: *created_at,
                    end: *created_at + (duration_hours * MS_PER_HOUR as f64) as Ms,
                    order_id: None,
                    reward: None,
                };
                self.bookings.insert(*id, Arc::new(RwLock::new(booking)));
                if let Some(entry) = self.spots.get(spot_id) {
                    let spot_arc = entry.value().clone();
                    drop(entry);
                    let mut spot = spot_arc.try_write().expect("replay: uncontended write");
                    // Compacted logs emit bookings grouped per booking, in map
                    // order — a terminal booking's creation may replay after a
                    // live hold is already in place. Never displace it; the
                    // terminal transition that follows is a no-op for foreign
                    // holds. A chronological log never hits this: the prior
                    // hold is always released before the next creation.
                    if spot.active_booking.is_none() {
                        set_hold(&mut spot, *id, BookingStatus::Pending);
                    }
                }
            }
            Event::OrderCreated { booking_id, order_id } => {
                self.replay_transition(booking_id, |b| {
                    b.status = BookingStatus::Confirmed;
                    b.order_id = Some(order_id.clone());
                });
            }
            Event::PaymentVerified {
                booking_id,
                transaction_id,
                order_id,
                payment_id,
                points_earned,
                carbon_saved,
                at,
            } => {
                let grant = RewardGrant {
                    points_earned: *points_earned,
                    carbon_saved: *carbon_saved,
                };
                let mut user_amount = None;
                self.replay_transition(booking_id, |b| {
                    b.status = BookingStatus::Active;
                    b.reward = Some(grant);
                    user_amount = Some((b.user_id, b.amount));
                });
                if let Some((user_id, amount)) = user_amount {
                    self.transactions.insert(
                        *booking_id,
                        Transaction {
                            id: *transaction_id,
                            booking_id: *booking_id,
                            user_id,
                            amount,
                            payment_method: "razorpay".into(),
                            order_id: order_id.clone(),
                            payment_id: payment_id.clone(),
                            status: TransactionStatus::Completed,
                            created_at: *at,
                        },
                    );
                    let account = self
                        .accounts
                        .entry(user_id)
                        .or_insert_with(|| Arc::new(RwLock::new(RewardAccount::new(user_id))))
                        .value()
                        .clone();
                    let mut acct = account.try_write().expect("replay: uncontended write");
                    acct.points += points_earned;
                    acct.carbon_saved_kg += carbon_saved;
                }
            }
            Event::BookingCancelled { id } => {
                self.replay_transition(id, |b| b.status = BookingStatus::Cancelled);
            }
            Event::BookingExpired { id } => {
                self.replay_transition(id, |b| b.status = BookingStatus::Expired);
            }
            Event::BookingClosed { id } => {
                self.replay_transition(id, |b| b.status = BookingStatus::Completed);
            }
            Event::LotHistorySnapshot { lot, free, total } => {
                self.history
                    .insert(lot.clone(), LotHistory { free: *free, total: *total });
            }
        }
    }

    /// Replay helper: mutate a booking, then mirror the new status onto its
    /// spot's hold (or release the hold if the status is terminal).
    fn replay_transition(&self, booking_id: &Ulid, f: impl FnOnce(&mut Booking)) {
        let Some(entry) = self.bookings.get(booking_id) else { return };
        let booking_arc = entry.value().clone();
        drop(entry);
        let mut booking = booking_arc.try_write().expect("replay: uncontended write");
        f(&mut booking);

        if let Some(entry) = self.spots.get(&booking.spot_id) {
            let spot_arc = entry.value().clone();
            drop(entry);
            let mut spot = spot_arc.try_write().expect("replay: uncontended write");
            // Only touch a hold this booking owns (or an empty one) — a
            // compacted log replays terminal bookings' intermediate statuses
            // after another booking may already hold the spot.
            let owned = match spot.active_booking {
                None => true,
                Some(h) => h.booking_id == booking.id,
            };
            if booking.status.holds_spot() {
                if owned {
                    set_hold(&mut spot, booking.id, booking.status);
                }
            } else if owned && spot.active_booking.is_some() {
                clear_hold(&mut spot);
            }
        }
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.users.iter() {
            let u = entry.value();
            events.push(Event::UserRegistered {
                id: u.id,
                email: u.email.clone(),
                name: u.name.clone(),
                picture: u.picture.clone(),
                created_at: u.created_at,
            });
        }

        for entry in self.shared_spaces.iter() {
            let s = entry.value();
            events.push(Event::SharedSpaceListed {
                id: s.id,
                owner_id: s.owner_id,
                name: s.name.clone(),
                location: s.location.clone(),
                rate_per_hour: s.rate_per_hour,
                slot_type: s.slot_type.clone(),
                created_at: s.created_at,
            });
        }

        // Compaction runs live, so spot and booking locks may be contended
        // (settlement holds booking write locks across gateway calls). Wait
        // for each lock rather than assuming it is free.
        let spot_arcs: Vec<SharedSpot> = self.spots.iter().map(|e| e.value().clone()).collect();
        for spot_arc in spot_arcs {
            let spot = spot_arc.read().await;
            events.push(Event::SpotRegistered {
                id: spot.id,
                lot: spot.lot.clone(),
                slot_label: spot.slot_label.clone(),
                rate_per_hour: spot.rate_per_hour,
                ev_charging: spot.ev_charging,
                sensor_occupied: spot.sensor_occupied,
                awaiting_clear: spot.awaiting_clear,
            });
        }

        for entry in self.history.iter() {
            events.push(Event::LotHistorySnapshot {
                lot: entry.key().clone(),
                free: entry.value().free,
                total: entry.value().total,
            });
        }

        // Bookings replay as their creation followed by the transitions that
        // got them to their current status.
        let booking_arcs: Vec<SharedBooking> =
            self.bookings.iter().map(|e| e.value().clone()).collect();
        for booking_arc in booking_arcs {
            let b = booking_arc.read().await;
            events.push(Event::BookingCreated {
                id: b.id,
                spot_id: b.spot_id,
                user_id: b.user_id,
                duration_hours: b.duration_hours,
                ev_charging: b.ev_charging,
                amount: b.amount,
                created_at: b.created_at,
            });
            if let Some(ref order_id) = b.order_id {
                events.push(Event::OrderCreated {
                    booking_id: b.id,
                    order_id: order_id.clone(),
                });
            }
            if let Some(tx) = self.transactions.get(&b.id) {
                let grant = b.reward.unwrap_or(RewardGrant { points_earned: 0, carbon_saved: 0.0 });
                events.push(Event::PaymentVerified {
                    booking_id: b.id,
                    transaction_id: tx.id,
                    order_id: tx.order_id.clone(),
                    payment_id: tx.payment_id.clone(),
                    points_earned: grant.points_earned,
                    carbon_saved: grant.carbon_saved,
                    at: tx.created_at,
                });
            }
            match b.status {
                BookingStatus::Cancelled => events.push(Event::BookingCancelled { id: b.id }),
                BookingStatus::Expired => events.push(Event::BookingExpired { id: b.id }),
                BookingStatus::Completed => events.push(Event::BookingClosed { id: b.id }),
                _ => {}
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
