use super::engine::RentalEngine;
use crate::domain::account::{AccountId, Amount};
use crate::domain::ports::{Commit, GatewayCallback};
use crate::domain::transaction::{Transaction, TransactionId};
use crate::domain::wallet::{Wallet, WalletAudit};
use crate::error::{ConflictKind, RentalError, Result};
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

/// A top-up waiting for the customer to pay at the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopUpTicket {
    pub transaction: TransactionId,
    pub redirect_url: String,
}

impl RentalEngine {
    /// Opens the wallet of `account` (idempotent).
    pub async fn open_wallet(&self, account: AccountId) -> Result<Wallet> {
        self.repository.open_wallet(account, self.now()).await
    }

    pub async fn get_wallet(&self, account: AccountId) -> Result<Wallet> {
        self.repository
            .wallet(account)
            .await?
            .ok_or_else(|| RentalError::not_found("wallet", account))
    }

    /// Starts funding a wallet through the payment gateway.
    ///
    /// The `TOP_UP` row is recorded as `PROCESSING`, or as `FAILED` when the
    /// gateway refuses the request. Neither changes the balance; only a
    /// verified callback does.
    pub async fn top_up(&self, account: AccountId, amount: i64) -> Result<TopUpTicket> {
        let amount = Amount::new(amount)?;
        self.get_wallet(account).await?;

        let reference = TransactionId::new();
        let initiated = self
            .gateway
            .initiate_top_up(account, amount, reference)
            .await;
        let row = self.settlement.top_up_requested(
            reference,
            account,
            amount,
            initiated.is_ok(),
            self.now(),
        );
        self.repository
            .commit(Commit::new(self.policy()).with_settlement(row))
            .await?;

        match initiated {
            Ok(redirect_url) => {
                info!(%account, %reference, amount = amount.value(), "Top-up initiated");
                Ok(TopUpTicket {
                    transaction: reference,
                    redirect_url,
                })
            }
            Err(e) => {
                warn!(%account, %reference, error = %e, "Gateway refused top-up");
                Err(RentalError::ExternalGatewayError(e.to_string()))
            }
        }
    }

    /// Applies the gateway's verdict on a top-up and returns the row.
    ///
    /// A callback for a row that is already `SUCCESSFUL` or `FAILED` changes
    /// nothing and returns the row as stored.
    pub async fn handle_gateway_callback(&self, callback: &GatewayCallback) -> Result<Transaction> {
        let outcome = self
            .gateway
            .verify_callback(callback)
            .await
            .map_err(|e| RentalError::ExternalGatewayError(e.to_string()))?;

        let row = self.load_transaction(outcome.transaction).await?;
        if row.status.is_terminal() {
            info!(transaction = %row.id, status = %row.status, "Duplicate gateway callback ignored");
            return Ok(row);
        }

        let resolution = self.settlement.top_up_resolved(&row, outcome.verified)?;
        match self
            .repository
            .commit(Commit::new(self.policy()).with_settlement(resolution))
            .await
        {
            Ok(()) | Err(RentalError::Conflict(ConflictKind::AlreadyResolved)) => {}
            Err(e) => {
                error!(transaction = %row.id, error = %e, "Failed to apply gateway callback");
                return Err(e);
            }
        }

        let resolved = self.load_transaction(row.id).await?;
        info!(
            transaction = %resolved.id,
            wallet = %resolved.wallet,
            status = %resolved.status,
            "Top-up resolved"
        );
        Ok(resolved)
    }

    /// Pays money out of a wallet. Fails with `InsufficientBalance` when the
    /// balance does not cover `amount`.
    pub async fn withdraw(&self, account: AccountId, amount: i64) -> Result<Transaction> {
        let amount = Amount::new(amount)?;
        self.get_wallet(account).await?;

        let settlement = self.settlement.withdraw(account, amount, self.now());
        let rows = settlement.entries().to_vec();
        self.repository
            .commit(Commit::new(self.policy()).with_settlement(settlement))
            .await?;

        info!(%account, amount = amount.value(), "Withdrawal settled");
        rows.into_iter()
            .next()
            .ok_or_else(|| RentalError::storage("withdrawal produced no ledger row"))
    }

    /// Ledger rows created in `[from, to)`, oldest first.
    pub async fn get_transactions(
        &self,
        account: AccountId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        if from > to {
            return Err(RentalError::ValidationError(format!(
                "range start {from} is after its end {to}"
            )));
        }
        self.get_wallet(account).await?;
        let mut rows: Vec<Transaction> = self
            .repository
            .transactions(account)
            .await?
            .into_iter()
            .filter(|t| t.created_at >= from && t.created_at < to)
            .collect();
        rows.sort_by_key(|t| t.created_at);
        Ok(rows)
    }

    /// Recomputes the balance of one wallet from its ledger.
    pub async fn audit_wallet(&self, account: AccountId) -> Result<WalletAudit> {
        let wallet = self.get_wallet(account).await?;
        let rows = self.repository.transactions(account).await?;
        WalletAudit::of(&wallet, &rows)
    }

    /// Audits every wallet, ordered by account.
    pub async fn audit_all(&self) -> Result<Vec<WalletAudit>> {
        let mut audits = Vec::new();
        for wallet in self.repository.all_wallets().await? {
            let rows = self.repository.transactions(wallet.account).await?;
            let audit = WalletAudit::of(&wallet, &rows)?;
            if !audit.reconciled {
                error!(
                    wallet = %audit.account,
                    balance = audit.balance,
                    ledger_sum = audit.ledger_sum,
                    "Wallet does not reconcile with its ledger"
                );
            }
            audits.push(audit);
        }
        Ok(audits)
    }

    /// All ledger rows of a wallet, oldest first.
    pub async fn statement(&self, account: AccountId) -> Result<Vec<Transaction>> {
        self.get_wallet(account).await?;
        self.repository.transactions(account).await
    }

    async fn load_transaction(&self, id: TransactionId) -> Result<Transaction> {
        self.repository
            .transaction(id)
            .await?
            .ok_or_else(|| RentalError::not_found("transaction", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::engine::Ports;
    use crate::config::RentalConfig;
    use crate::domain::transaction::{TransactionStatus, TransactionType};
    use crate::infrastructure::clock::ManualClock;
    use crate::domain::ports::Clock;
    use crate::infrastructure::gateway::{MockPaymentGateway, RESPONSE_APPROVED};
    use crate::infrastructure::in_memory::{InMemoryCatalog, InMemoryProfiles, InMemoryStore};
    use crate::infrastructure::notifier::TracingNotifier;
    use chrono::{Duration, TimeZone};

    const ALICE: AccountId = AccountId(1);

    async fn engine_with(gateway: MockPaymentGateway) -> (RentalEngine, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 14, 9, 0, 0).unwrap());
        let engine = RentalEngine::new(
            RentalConfig::default(),
            Ports {
                repository: Box::new(InMemoryStore::new()),
                catalog: Box::new(InMemoryCatalog::new()),
                profiles: Box::new(InMemoryProfiles::new()),
                notifier: Box::new(TracingNotifier),
                gateway: Box::new(gateway),
                clock: Box::new(clock.clone()),
            },
        )
        .await
        .unwrap();
        (engine, clock)
    }

    #[tokio::test]
    async fn test_top_up_credits_only_after_verified_callback() {
        let gateway = MockPaymentGateway::default();
        let (engine, _) = engine_with(gateway.clone()).await;
        engine.open_wallet(ALICE).await.unwrap();

        let ticket = engine.top_up(ALICE, 10_000).await.unwrap();
        assert_eq!(engine.get_wallet(ALICE).await.unwrap().balance, 0);

        let callback = gateway.callback_for(ticket.transaction, RESPONSE_APPROVED);
        let row = engine.handle_gateway_callback(&callback).await.unwrap();
        assert_eq!(row.status, TransactionStatus::Successful);
        assert_eq!(engine.get_wallet(ALICE).await.unwrap().balance, 10_000);

        // The gateway retries its callback.
        let again = engine.handle_gateway_callback(&callback).await.unwrap();
        assert_eq!(again, row);
        assert_eq!(engine.get_wallet(ALICE).await.unwrap().balance, 10_000);
        assert!(engine.audit_wallet(ALICE).await.unwrap().reconciled);
    }

    #[tokio::test]
    async fn test_declined_callback_fails_row() {
        let gateway = MockPaymentGateway::default();
        let (engine, _) = engine_with(gateway.clone()).await;
        engine.open_wallet(ALICE).await.unwrap();

        let ticket = engine.top_up(ALICE, 500).await.unwrap();
        let row = engine
            .handle_gateway_callback(&gateway.callback_for(ticket.transaction, "51"))
            .await
            .unwrap();
        assert_eq!(row.status, TransactionStatus::Failed);
        assert_eq!(engine.get_wallet(ALICE).await.unwrap().balance, 0);
    }

    #[tokio::test]
    async fn test_gateway_outage_records_failed_row() {
        let gateway = MockPaymentGateway::default();
        gateway.set_unavailable(true);
        let (engine, _) = engine_with(gateway).await;
        engine.open_wallet(ALICE).await.unwrap();

        let err = engine.top_up(ALICE, 500).await.unwrap_err();
        assert_eq!(err.code(), "EXTERNAL_GATEWAY_ERROR");
        let rows = engine.statement(ALICE).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, TransactionStatus::Failed);
        assert_eq!(engine.get_wallet(ALICE).await.unwrap().balance, 0);
    }

    #[tokio::test]
    async fn test_withdraw_respects_balance() {
        let gateway = MockPaymentGateway::default();
        let (engine, _) = engine_with(gateway.clone()).await;
        engine.open_wallet(ALICE).await.unwrap();
        let ticket = engine.top_up(ALICE, 1_000).await.unwrap();
        engine
            .handle_gateway_callback(&gateway.callback_for(ticket.transaction, RESPONSE_APPROVED))
            .await
            .unwrap();

        let err = engine.withdraw(ALICE, 1_001).await.unwrap_err();
        assert!(matches!(
            err,
            RentalError::InsufficientBalance {
                balance: 1_000,
                required: 1_001,
                ..
            }
        ));

        let row = engine.withdraw(ALICE, 400).await.unwrap();
        assert_eq!(row.r#type, TransactionType::Withdraw);
        assert_eq!(row.amount, -400);
        assert_eq!(engine.get_wallet(ALICE).await.unwrap().balance, 600);

        assert_eq!(engine.withdraw(ALICE, 0).await.unwrap_err().code(), "VALIDATION_ERROR");
        assert_eq!(engine.top_up(ALICE, -5).await.unwrap_err().code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_transactions_range_is_half_open() {
        let gateway = MockPaymentGateway::default();
        let (engine, clock) = engine_with(gateway).await;
        engine.open_wallet(ALICE).await.unwrap();

        let start = clock.now();
        engine.top_up(ALICE, 100).await.unwrap();
        clock.advance(Duration::hours(1));
        engine.top_up(ALICE, 200).await.unwrap();

        let first_hour = engine
            .get_transactions(ALICE, start, start + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(first_hour.len(), 1);
        assert_eq!(first_hour[0].amount, 100);

        let all = engine
            .get_transactions(ALICE, start, start + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(all.iter().map(|t| t.amount).collect::<Vec<_>>(), vec![100, 200]);

        assert!(
            engine
                .get_transactions(ALICE, start + Duration::hours(1), start)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_unknown_wallet() {
        let (engine, _) = engine_with(MockPaymentGateway::default()).await;
        assert_eq!(engine.get_wallet(ALICE).await.unwrap_err().code(), "NOT_FOUND");
        assert_eq!(engine.top_up(ALICE, 10).await.unwrap_err().code(), "NOT_FOUND");
    }
}
