use async_trait::async_trait;
use ulid::Ulid;

/// Why the gateway refused an operation.
#[derive(Debug)]
pub enum GatewayError {
    Rejected(String),
    Unavailable(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Rejected(reason) => write!(f, "rejected: {reason}"),
            GatewayError::Unavailable(reason) => write!(f, "gateway unavailable: {reason}"),
        }
    }
}

impl std::error::Error for GatewayError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayOrder {
    pub order_id: String,
    /// Amount in the currency's minor unit (paise).
    pub amount_minor: i64,
    pub currency: String,
}

/// The external payment collaborator, as a two-phase protocol: an order is
/// created up front, then a payment against it is verified. Real gateway
/// integration lives behind this seam.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(&self, amount: f64, receipt: &str) -> Result<GatewayOrder, GatewayError>;
    async fn verify(&self, order_id: &str, payment_id: &str) -> Result<(), GatewayError>;
}

/// Test-mode gateway mimicking Razorpay id shapes. Accepts any well-formed
/// payment id; ids prefixed `pay_fail` are rejected so failure paths stay
/// exercisable end to end.
pub struct MockGateway;

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_order(&self, amount: f64, _receipt: &str) -> Result<GatewayOrder, GatewayError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(GatewayError::Rejected("bad amount".into()));
        }
        Ok(GatewayOrder {
            order_id: format!("order_mock_{}", Ulid::new().to_string().to_lowercase()),
            amount_minor: (amount * 100.0).round() as i64,
            currency: "INR".into(),
        })
    }

    async fn verify(&self, order_id: &str, payment_id: &str) -> Result<(), GatewayError> {
        if !order_id.starts_with("order_") {
            return Err(GatewayError::Rejected("unknown order".into()));
        }
        if payment_id.is_empty() || payment_id.starts_with("pay_fail") {
            return Err(GatewayError::Rejected("payment declined".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_orders_are_minor_units() {
        let order = MockGateway.create_order(150.0, "r1").await.unwrap();
        assert_eq!(order.amount_minor, 15000);
        assert_eq!(order.currency, "INR");
        assert!(order.order_id.starts_with("order_mock_"));
    }

    #[tokio::test]
    async fn mock_verify_accepts_and_declines() {
        assert!(MockGateway.verify("order_mock_x", "pay_abc").await.is_ok());
        assert!(MockGateway.verify("order_mock_x", "pay_fail_1").await.is_err());
        assert!(MockGateway.verify("order_mock_x", "").await.is_err());
        assert!(MockGateway.verify("bogus", "pay_abc").await.is_err());
    }
}
