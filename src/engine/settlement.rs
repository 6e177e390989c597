use serde::Serialize;
use ulid::Ulid;

use crate::model::*;
use crate::payment::PaymentGateway;

use super::{now_ms, Engine, EngineError};

/// What the payment widget needs to collect the money.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderView {
    pub order_id: String,
    pub booking_id: Ulid,
    /// Minor units (paise).
    pub amount: i64,
    pub currency: String,
}

impl Engine {
    /// Phase one of settlement: create a gateway order for a pending booking
    /// and move it to confirmed. Idempotent — calling again while the booking
    /// is still confirmed returns the recorded order instead of creating a
    /// second one.
    pub async fn create_order(
        &self,
        booking_id: Ulid,
        user_id: Ulid,
        gateway: &dyn PaymentGateway,
    ) -> Result<OrderView, EngineError> {
        let booking_arc = self.booking(&booking_id).ok_or(EngineError::NotFound(booking_id))?;
        let mut booking = booking_arc.write().await;
        if booking.user_id != user_id {
            return Err(EngineError::Unauthorized(booking_id));
        }

        match booking.status {
            BookingStatus::Confirmed => {
                // Replay of the first call.
                let order_id = booking
                    .order_id
                    .clone()
                    .ok_or_else(|| EngineError::Internal("confirmed booking without order".into()))?;
                return Ok(OrderView {
                    order_id,
                    booking_id,
                    amount: (booking.amount * 100.0).round() as i64,
                    currency: "INR".into(),
                });
            }
            BookingStatus::Pending => {}
            _ => return Err(EngineError::Validation("booking is not payable")),
        }

        let order = gateway
            .create_order(booking.amount, &booking_id.to_string())
            .await
            .map_err(|e| EngineError::Internal(format!("order creation failed: {e}")))?;

        self.wal_append(&Event::OrderCreated {
            booking_id,
            order_id: order.order_id.clone(),
        })
        .await?;
        booking.status = BookingStatus::Confirmed;
        booking.order_id = Some(order.order_id.clone());
        self.sync_hold_status(&booking).await;

        Ok(OrderView {
            order_id: order.order_id,
            booking_id,
            amount: order.amount_minor,
            currency: order.currency,
        })
    }

    /// Phase two of settlement: verify the gateway payment, record the
    /// completed transaction, activate the booking, and credit rewards
    /// exactly once. Idempotent per booking — an already settled booking
    /// returns the grant computed the first time. On gateway rejection the
    /// booking stays confirmed so the user may retry without losing the spot.
    pub async fn verify_payment(
        &self,
        booking_id: Ulid,
        user_id: Ulid,
        order_id: &str,
        payment_id: &str,
        gateway: &dyn PaymentGateway,
    ) -> Result<RewardGrant, EngineError> {
        let booking_arc = self.booking(&booking_id).ok_or(EngineError::NotFound(booking_id))?;
        let mut booking = booking_arc.write().await;
        if booking.user_id != user_id {
            return Err(EngineError::Unauthorized(booking_id));
        }

        match booking.status {
            BookingStatus::Active | BookingStatus::Completed => {
                // Duplicate call (client retry). Replay the original result.
                return booking
                    .reward
                    .ok_or_else(|| EngineError::Internal("settled booking without grant".into()));
            }
            BookingStatus::Confirmed => {}
            BookingStatus::Pending => {
                return Err(EngineError::Validation("order not created yet"));
            }
            _ => return Err(EngineError::Validation("booking is not payable")),
        }

        if booking.order_id.as_deref() != Some(order_id) {
            return Err(EngineError::PaymentVerificationFailed("order mismatch".into()));
        }
        if let Err(e) = gateway.verify(order_id, payment_id).await {
            metrics::counter!(crate::observability::PAYMENT_FAILURES_TOTAL).increment(1);
            return Err(EngineError::PaymentVerificationFailed(e.to_string()));
        }

        let grant = super::rewards::compute_grant(booking.duration_hours);
        let transaction_id = Ulid::new();
        let at = now_ms();
        self.wal_append(&Event::PaymentVerified {
            booking_id,
            transaction_id,
            order_id: order_id.to_string(),
            payment_id: payment_id.to_string(),
            points_earned: grant.points_earned,
            carbon_saved: grant.carbon_saved,
            at,
        })
        .await?;

        booking.status = BookingStatus::Active;
        booking.reward = Some(grant);
        self.transactions.insert(
            booking_id,
            Transaction {
                id: transaction_id,
                booking_id,
                user_id,
                amount: booking.amount,
                payment_method: "razorpay".into(),
                order_id: order_id.to_string(),
                payment_id: payment_id.to_string(),
                status: TransactionStatus::Completed,
                created_at: at,
            },
        );
        self.apply_credit(user_id, grant).await;
        self.sync_hold_status(&booking).await;
        metrics::counter!(crate::observability::PAYMENTS_VERIFIED_TOTAL).increment(1);

        Ok(grant)
    }

    /// All of a user's settled transactions, newest first.
    pub fn transactions_for(&self, user_id: Ulid) -> Vec<Transaction> {
        let mut out: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|e| e.value().user_id == user_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        out
    }
}
