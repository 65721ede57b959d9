//! Sandbox payment gateway for development and tests.
//!
//! Redirect URLs carry the transaction reference the core generated; the
//! callback echoes it back together with a response code. Code `00` means
//! the customer paid.

use crate::domain::account::{AccountId, Amount};
use crate::domain::ports::{CallbackOutcome, GatewayCallback, GatewayError, PaymentGateway};
use crate::domain::transaction::TransactionId;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;
use uuid::Uuid;

pub const PARAM_REFERENCE: &str = "txn_ref";
pub const PARAM_AMOUNT: &str = "amount";
pub const PARAM_RESPONSE_CODE: &str = "response_code";
pub const RESPONSE_APPROVED: &str = "00";

#[derive(Debug, Default)]
struct GatewayState {
    issued: HashMap<TransactionId, i64>,
    unavailable: bool,
}

#[derive(Debug, Clone)]
pub struct MockPaymentGateway {
    base_url: String,
    state: Arc<Mutex<GatewayState>>,
}

impl Default for MockPaymentGateway {
    fn default() -> Self {
        Self::new("https://sandbox.pay.local/checkout")
    }
}

impl MockPaymentGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            state: Arc::new(Mutex::new(GatewayState::default())),
        }
    }

    /// Makes every following initiation fail as if the gateway were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unavailable = unavailable;
    }

    /// Builds the callback the gateway would send for `reference`.
    pub fn callback_for(&self, reference: TransactionId, response_code: &str) -> GatewayCallback {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut params = BTreeMap::from([
            (PARAM_REFERENCE.to_string(), reference.to_string()),
            (PARAM_RESPONSE_CODE.to_string(), response_code.to_string()),
        ]);
        if let Some(amount) = state.issued.get(&reference) {
            params.insert(PARAM_AMOUNT.to_string(), amount.to_string());
        }
        GatewayCallback { params }
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn initiate_top_up(
        &self,
        account: AccountId,
        amount: Amount,
        reference: TransactionId,
    ) -> Result<String, GatewayError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.unavailable {
            return Err(GatewayError::Unavailable("sandbox is down".to_string()));
        }
        state.issued.insert(reference, amount.value());
        info!(%account, %reference, amount = amount.value(), "Sandbox top-up initiated");
        Ok(format!(
            "{}?{PARAM_REFERENCE}={reference}&{PARAM_AMOUNT}={}",
            self.base_url,
            amount.value()
        ))
    }

    async fn verify_callback(
        &self,
        callback: &GatewayCallback,
    ) -> Result<CallbackOutcome, GatewayError> {
        let raw = callback
            .get(PARAM_REFERENCE)
            .ok_or_else(|| GatewayError::MalformedCallback(format!("missing {PARAM_REFERENCE}")))?;
        let reference = Uuid::parse_str(raw)
            .map(TransactionId)
            .map_err(|e| GatewayError::MalformedCallback(format!("bad reference {raw}: {e}")))?;
        let code = callback.get(PARAM_RESPONSE_CODE).ok_or_else(|| {
            GatewayError::MalformedCallback(format!("missing {PARAM_RESPONSE_CODE}"))
        })?;

        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let issued = state
            .issued
            .get(&reference)
            .ok_or_else(|| GatewayError::Rejected(format!("unknown reference {reference}")))?;
        let amount_matches = match callback.get(PARAM_AMOUNT) {
            Some(amount) => amount.parse::<i64>().ok() == Some(*issued),
            None => true,
        };

        Ok(CallbackOutcome {
            transaction: reference,
            verified: code == RESPONSE_APPROVED && amount_matches,
        })
    }
}
