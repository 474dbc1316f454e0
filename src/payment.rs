//! Checkout and webhook reconciliation against a hosted payment gateway.

use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{error, info, warn};

use crate::engine::lifecycle::LifecycleEvent;
use crate::engine::{Engine, EngineError};
use crate::limits::MAX_PAYMENT_TEXT_LEN;
use crate::model::*;
use crate::observability::{PAYMENT_LINKS_TOTAL, RECONCILIATIONS_TOTAL};

type HmacSha256 = Hmac<Sha256>;

/// Gateway result code for a successful payment.
pub const SUCCESS_CODE: &str = "00";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentLinkRequest {
    pub order_code: i64,
    pub amount: Money,
    pub description: String,
    pub return_url: String,
    pub cancel_url: String,
    pub expires_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentLink {
    pub booking_code: String,
    pub order_code: i64,
    pub amount: Money,
    pub checkout_url: String,
    pub expires_at: Ms,
}

/// Something that can open a checkout session for an order code.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_link(&self, request: &PaymentLinkRequest) -> Result<String, String>;
}

/// Gateway whose checkout page lives at `<base>/<order_code>`.
pub struct HostedCheckoutGateway {
    base_url: String,
}

impl HostedCheckoutGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PaymentGateway for HostedCheckoutGateway {
    async fn create_payment_link(&self, request: &PaymentLinkRequest) -> Result<String, String> {
        Ok(format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            request.order_code
        ))
    }
}

/// HMAC-SHA256 over the sorted `key=value` form of a notification,
/// hex encoded.
#[derive(Clone)]
pub struct SignatureVerifier {
    mac: HmacSha256,
}

impl SignatureVerifier {
    pub fn new(key: &[u8]) -> Result<Self, String> {
        let mac = HmacSha256::new_from_slice(key).map_err(|e| e.to_string())?;
        Ok(Self { mac })
    }

    pub fn sign(&self, data: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(data.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time comparison against a hex signature.
    pub fn verify(&self, data: &str, signature: &str) -> Result<(), EngineError> {
        let expected = hex::decode(signature.trim()).map_err(|_| EngineError::InvalidSignature)?;
        let mut mac = self.mac.clone();
        mac.update(data.as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| EngineError::InvalidSignature)
    }
}

/// Webhook body from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentNotification {
    pub order_code: i64,
    pub amount: Money,
    pub code: String,
    pub signature: String,
}

impl PaymentNotification {
    /// The signed portion, keys in alphabetical order.
    pub fn signed_data(&self) -> String {
        format!(
            "amount={}&code={}&orderCode={}",
            self.amount, self.code, self.order_code
        )
    }

    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentPlan {
    /// The deposit share of a pending booking.
    Deposit,
    /// Everything still owed.
    Full,
}

impl PaymentPlan {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deposit" => Some(PaymentPlan::Deposit),
            "full" => Some(PaymentPlan::Full),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied(Booking),
    /// Payment already recorded; nothing changed.
    Duplicate(Booking),
    UnknownOrder,
    /// Gateway reported failure; the pending booking is now `FAILED`.
    Failed(Booking),
    /// Gateway reported failure for a booking that is not waiting on a deposit.
    Ignored(Booking),
}

impl ReconcileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Applied(_) => "applied",
            ReconcileOutcome::Duplicate(_) => "duplicate",
            ReconcileOutcome::UnknownOrder => "unknown_order",
            ReconcileOutcome::Failed(_) => "failed",
            ReconcileOutcome::Ignored(_) => "ignored",
        }
    }

    pub fn booking(&self) -> Option<&Booking> {
        match self {
            ReconcileOutcome::Applied(b)
            | ReconcileOutcome::Duplicate(b)
            | ReconcileOutcome::Failed(b)
            | ReconcileOutcome::Ignored(b) => Some(b),
            ReconcileOutcome::UnknownOrder => None,
        }
    }
}

/// Which lifecycle event `amount` stands for, given the booking's state.
fn payment_event(
    engine: &Engine,
    booking: &Booking,
    order_code: i64,
    amount: Money,
) -> Result<LifecycleEvent, EngineError> {
    match booking.status {
        BookingStatus::PendingDeposit => {
            let deposit = engine.policy().deposit_amount(booking.total_money);
            if amount == booking.total_money {
                Ok(LifecycleEvent::PaidInFull { amount })
            } else if amount == deposit {
                Ok(LifecycleEvent::DepositPaid { amount })
            } else {
                Err(EngineError::AmountMismatch {
                    order_code,
                    expected: vec![deposit, booking.total_money],
                    got: amount,
                })
            }
        }
        BookingStatus::Confirmed if amount == booking.amount_due && amount > 0 => {
            Ok(LifecycleEvent::BalancePaid { amount })
        }
        BookingStatus::Confirmed => Err(EngineError::AmountMismatch {
            order_code,
            expected: if booking.amount_due > 0 {
                vec![booking.amount_due]
            } else {
                Vec::new()
            },
            got: amount,
        }),
        status => Err(EngineError::PaymentAfterClose {
            code: booking.code.clone(),
            status,
            order_code,
            amount,
        }),
    }
}

pub struct PaymentService {
    engine: Arc<Engine>,
    gateway: Arc<dyn PaymentGateway>,
    verifier: SignatureVerifier,
}

impl PaymentService {
    pub fn new(
        engine: Arc<Engine>,
        gateway: Arc<dyn PaymentGateway>,
        verifier: SignatureVerifier,
    ) -> Self {
        Self {
            engine,
            gateway,
            verifier,
        }
    }

    /// Open a payment attempt: fresh order code, then a gateway link that
    /// expires after the configured TTL.
    pub async fn start_payment(
        &self,
        code: &str,
        plan: PaymentPlan,
        description: Option<&str>,
        return_url: &str,
        cancel_url: &str,
    ) -> Result<PaymentLink, EngineError> {
        for text in [description.unwrap_or(""), return_url, cancel_url] {
            if text.len() > MAX_PAYMENT_TEXT_LEN {
                return Err(EngineError::LimitExceeded("payment text too long"));
            }
        }

        let booking = self.engine.get_by_code(code).await?;
        let amount = match plan {
            PaymentPlan::Deposit if booking.status == BookingStatus::PendingDeposit => {
                self.engine.policy().deposit_amount(booking.total_money)
            }
            PaymentPlan::Full if booking.status.is_holding() && booking.amount_due > 0 => {
                booking.amount_due
            }
            _ => return Err(EngineError::NothingToPay(booking.code)),
        };

        let (booking, order_code) = self.engine.assign_order_code(code).await?;
        let request = PaymentLinkRequest {
            order_code,
            amount,
            description: description
                .map(str::to_string)
                .unwrap_or_else(|| format!("Booking {}", booking.code)),
            return_url: return_url.to_string(),
            cancel_url: cancel_url.to_string(),
            expires_at: chrono::Utc::now().timestamp_millis()
                + self.engine.policy().payment_link_ttl_ms,
        };
        let checkout_url = self
            .gateway
            .create_payment_link(&request)
            .await
            .map_err(|e| {
                warn!("payment link for {} failed: {e}", booking.code);
                EngineError::Gateway(e)
            })?;

        metrics::counter!(PAYMENT_LINKS_TOTAL).increment(1);
        info!(
            "payment link for {}: order {order_code}, amount {amount}",
            booking.code
        );
        Ok(PaymentLink {
            booking_code: booking.code,
            order_code,
            amount,
            checkout_url,
            expires_at: request.expires_at,
        })
    }

    /// Apply a gateway notification to the ledger, at most once.
    pub async fn reconcile(
        &self,
        notification: &PaymentNotification,
    ) -> Result<ReconcileOutcome, EngineError> {
        let result = self.reconcile_inner(notification).await;
        let outcome = match &result {
            Ok(o) => o.label(),
            Err(e) => e.label(),
        };
        metrics::counter!(RECONCILIATIONS_TOTAL, "outcome" => outcome).increment(1);
        match &result {
            Err(e @ EngineError::PaymentAfterClose { .. }) => error!("reconciliation: {e}"),
            Err(e @ EngineError::AmountMismatch { .. }) => warn!("reconciliation: {e}"),
            _ => {}
        }
        result
    }

    async fn reconcile_inner(
        &self,
        n: &PaymentNotification,
    ) -> Result<ReconcileOutcome, EngineError> {
        if let Err(e) = self.verifier.verify(&n.signed_data(), &n.signature) {
            warn!("rejected notification for order {}: bad signature", n.order_code);
            return Err(e);
        }

        let booking = match self.engine.get_by_order_code(n.order_code).await {
            Ok(b) => b,
            Err(EngineError::NotFound(_)) => {
                info!("notification for unknown order {}", n.order_code);
                return Ok(ReconcileOutcome::UnknownOrder);
            }
            Err(e) => return Err(e),
        };
        if booking.has_payment(n.order_code, n.amount) {
            return Ok(ReconcileOutcome::Duplicate(booking));
        }

        if !n.is_success() {
            if booking.status != BookingStatus::PendingDeposit {
                info!(
                    "ignoring failure code {} for {} in {}",
                    n.code, booking.code, booking.status
                );
                return Ok(ReconcileOutcome::Ignored(booking));
            }
            return match self
                .engine
                .transition(booking.id, booking.status, LifecycleEvent::PaymentFailed, None)
                .await
            {
                Ok(b) => Ok(ReconcileOutcome::Failed(b)),
                Err(e) => self.after_lost_race(booking.id, n, e).await,
            };
        }

        let event = payment_event(&self.engine, &booking, n.order_code, n.amount)?;
        match self
            .engine
            .transition(booking.id, booking.status, event, Some(n.order_code))
            .await
        {
            Ok(b) => {
                info!(
                    "payment {} for {} (order {}): now {}, due {}",
                    n.amount, b.code, n.order_code, b.status, b.amount_due
                );
                Ok(ReconcileOutcome::Applied(b))
            }
            Err(e) => self.after_lost_race(booking.id, n, e).await,
        }
    }

    /// The booking changed between read and write. Look once more to tell a
    /// duplicate delivery from a payment that arrived too late, then price
    /// the payment against the current balance and try once more.
    async fn after_lost_race(
        &self,
        id: ulid::Ulid,
        n: &PaymentNotification,
        err: EngineError,
    ) -> Result<ReconcileOutcome, EngineError> {
        if !matches!(err, EngineError::InvalidTransition { .. }) {
            return Err(err);
        }
        let current = self.engine.get_booking(id).await?;
        if current.has_payment(n.order_code, n.amount) {
            return Ok(ReconcileOutcome::Duplicate(current));
        }
        if current.status.is_terminal() {
            if !n.is_success() {
                return Ok(ReconcileOutcome::Ignored(current));
            }
            return Err(EngineError::PaymentAfterClose {
                code: current.code,
                status: current.status,
                order_code: n.order_code,
                amount: n.amount,
            });
        }
        if !n.is_success() {
            return Err(err);
        }
        let event = payment_event(&self.engine, &current, n.order_code, n.amount)?;
        let b = self
            .engine
            .transition(current.id, current.status, event, Some(n.order_code))
            .await?;
        info!(
            "payment {} for {} (order {}) after retry: now {}, due {}",
            n.amount, b.code, n.order_code, b.status, b.amount_due
        );
        Ok(ReconcileOutcome::Applied(b))
    }
}
