use crate::config::{ConfigService, DecisionConfig};
use crate::domain::decision::{Action, Alert, AlertStatus, AuditSnapshot, Decision};
use crate::domain::features::FeatureSet;
use crate::domain::ports::{AuditSinkArc, ClockArc, PersistenceGatewayArc};
use crate::domain::transaction::{Transaction, TxnId};
use crate::error::Result;
use dashmap::DashSet;
use moka::sync::Cache;
use std::sync::Arc;

/// Cards, terminals and merchants that are always blocked while the blacklist
/// rule is enabled.
#[derive(Debug, Default)]
pub struct Blocklist {
    cards: DashSet<String>,
    terminals: DashSet<String>,
    merchants: DashSet<String>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the blocklist from the configured card, terminal and merchant lists.
    pub fn from_config(config: &DecisionConfig) -> Self {
        let blocklist = Self::new();
        for card in &config.blocked_cards {
            blocklist.block_card(card);
        }
        for terminal in &config.blocked_terminals {
            blocklist.block_terminal(terminal);
        }
        for merchant in &config.blocked_merchants {
            blocklist.block_merchant(merchant);
        }
        blocklist
    }

    /// Expects the SHA-256 fingerprint, never a clear PAN.
    pub fn block_card(&self, fingerprint: &str) {
        self.cards.insert(fingerprint.to_ascii_lowercase());
    }

    pub fn block_terminal(&self, terminal_id: &str) {
        self.terminals.insert(terminal_id.to_string());
    }

    pub fn block_merchant(&self, merchant_id: &str) {
        self.merchants.insert(merchant_id.to_string());
    }

    pub fn unblock_card(&self, fingerprint: &str) -> bool {
        self.cards.remove(&fingerprint.to_ascii_lowercase()).is_some()
    }

    /// Reason for the first matching entry, if any.
    pub fn check(&self, tx: &Transaction) -> Option<String> {
        if self.cards.contains(tx.card_fingerprint.as_str()) {
            return Some(format!("Hard rule: card {} is blocklisted", tx.card_fingerprint));
        }
        if let Some(terminal) = &tx.terminal_id
            && self.terminals.contains(terminal)
        {
            return Some(format!("Hard rule: terminal {} is blocklisted", terminal));
        }
        if self.merchants.contains(&tx.merchant_id) {
            return Some(format!("Hard rule: merchant {} is blocklisted", tx.merchant_id));
        }
        None
    }
}

/// Maps a score and its features to a terminal action.
///
/// Rules run in a fixed order: hard blocklist rules, score thresholds, then the
/// AML overlay, which can only escalate. The first decision recorded for a
/// transaction wins; later evaluations return it unchanged. Side effects
/// (acquirer code, alert, decision record, audit snapshot) are best effort.
pub struct DecisionEngine {
    config: Arc<ConfigService>,
    blocklist: Arc<Blocklist>,
    persistence: PersistenceGatewayArc,
    audit: AuditSinkArc,
    clock: ClockArc,
    ledger: Cache<TxnId, Decision>,
}

impl DecisionEngine {
    /// Creates a new `DecisionEngine`.
    ///
    /// # Arguments
    ///
    /// * `config` - Live view of thresholds and rule switches.
    /// * `blocklist` - Entries for the hard blocklist rule.
    /// * `persistence` - Where decisions, alerts and acquirer codes are written.
    /// * `audit` - Sink for the decision snapshots.
    /// * `clock` - Time source for decision and alert timestamps.
    /// * `ledger_max_entries` - Capacity of the in-process first-write-wins ledger.
    pub fn new(
        config: Arc<ConfigService>,
        blocklist: Arc<Blocklist>,
        persistence: PersistenceGatewayArc,
        audit: AuditSinkArc,
        clock: ClockArc,
        ledger_max_entries: u64,
    ) -> Self {
        Self {
            config,
            blocklist,
            persistence,
            audit,
            clock,
            ledger: Cache::new(ledger_max_entries),
        }
    }

    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    /// The recorded decision for `txn_id`, from the in-process ledger first and
    /// the persistence gateway second.
    pub async fn find(&self, txn_id: TxnId) -> Result<Option<Decision>> {
        if let Some(decision) = self.ledger.get(&txn_id) {
            return Ok(Some(decision));
        }
        let stored = self.persistence.find_decision(txn_id).await?;
        if let Some(decision) = &stored {
            self.ledger.insert(txn_id, decision.clone());
        }
        Ok(stored)
    }

    /// Decides `tx`, or returns the decision already recorded for it.
    ///
    /// # Arguments
    ///
    /// * `tx` - The transaction being decided.
    /// * `score` - Model score in `[0, 1]`, zero when scoring failed open.
    /// * `features` - Feature set the score was computed on; kept in the audit snapshot.
    /// * `notes` - Carried into the reasons ahead of the rule output, e.g. why
    ///   the score is a fail-open zero.
    pub async fn evaluate(
        &self,
        tx: &Transaction,
        score: f64,
        features: &FeatureSet,
        notes: Vec<String>,
    ) -> Decision {
        match self.find(tx.txn_id).await {
            Ok(Some(existing)) => return existing,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(txn_id = %tx.txn_id, error = %e, "decision lookup failed, evaluating");
            }
        }

        let decision = self.decide(tx, score, features, notes);
        let entry = self.ledger.entry(tx.txn_id).or_insert_with(|| decision.clone());
        if !entry.is_fresh() {
            // A concurrent evaluation got there first.
            return entry.into_value();
        }

        tracing::info!(
            txn_id = %tx.txn_id,
            action = %decision.action,
            score = decision.score,
            "decision"
        );
        self.apply(tx, &decision, features).await;
        decision
    }

    fn decide(&self, tx: &Transaction, score: f64, features: &FeatureSet, notes: Vec<String>) -> Decision {
        let mut reasons = notes;

        let action = match self.hard_rule(tx) {
            Some(reason) => {
                reasons.push(reason);
                Action::Block
            }
            None => {
                let action = self.threshold_action(score, &mut reasons);
                self.aml_overlay(tx, features, action, &mut reasons)
            }
        };

        Decision {
            txn_id: tx.txn_id,
            action,
            score,
            reasons,
            acquirer_response: action.acquirer_code().map(str::to_string),
            decided_at: self.clock.now(),
        }
    }

    fn hard_rule(&self, tx: &Transaction) -> Option<String> {
        if !self.config.blacklist_enabled() {
            return None;
        }
        self.blocklist.check(tx)
    }

    fn threshold_action(&self, score: f64, reasons: &mut Vec<String>) -> Action {
        let block = self.config.block_threshold();
        let hold = self.config.hold_threshold();
        if score >= block {
            reasons.push(format!("Score {:.3} >= block threshold {:.3}", score, block));
            Action::Block
        } else if score >= hold {
            reasons.push(format!("Score {:.3} >= hold threshold {:.3}", score, hold));
            Action::Hold
        } else {
            reasons.push(format!("Score {:.3} < hold threshold {:.3}", score, hold));
            Action::Allow
        }
    }

    fn aml_overlay(&self, tx: &Transaction, features: &FeatureSet, action: Action, reasons: &mut Vec<String>) -> Action {
        let threshold = self.config.aml_high_value_threshold();
        let mut action = action;

        let amount = tx.amount.minor_units();
        if amount >= threshold {
            reasons.push(format!("AML: Amount {} >= threshold {}", amount, threshold));
            if action != Action::Block {
                reasons.push("AML escalation required".to_string());
            }
            action = action.at_least(Action::Alert);
        }

        let cumulative_threshold = threshold.saturating_mul(self.config.aml_cumulative_multiplier());
        if let Some(cumulative) = features.get_i64("cumulative_debits_30d")
            && cumulative >= 0
            && cumulative >= cumulative_threshold
        {
            reasons.push(format!(
                "AML: Cumulative 30d amount {} >= threshold {}",
                cumulative, cumulative_threshold
            ));
            action = action.at_least(Action::Alert);
        }

        action
    }

    async fn apply(&self, tx: &Transaction, decision: &Decision, features: &FeatureSet) {
        let txn_id = decision.txn_id;

        if let Some(code) = &decision.acquirer_response
            && let Err(e) = self.persistence.update_acquirer_response(txn_id, code).await
        {
            tracing::error!(%txn_id, error = %e, "failed to write acquirer response");
            crate::metrics::record_persistence_failure("update_acquirer_response");
        }

        if matches!(decision.action, Action::Block | Action::Hold) {
            let alert = Alert {
                txn_id,
                score: decision.score,
                action: decision.action,
                reason: decision.reasons.join("; "),
                status: AlertStatus::Open,
                created_at: decision.decided_at,
            };
            match self.persistence.save_alert(&alert).await {
                Ok(()) => tracing::info!(
                    %txn_id,
                    action = %alert.action,
                    merchant_id = %tx.merchant_id,
                    "alert created"
                ),
                Err(e) => {
                    tracing::error!(%txn_id, error = %e, "failed to save alert");
                    crate::metrics::record_persistence_failure("save_alert");
                }
            }
        }

        if let Err(e) = self.persistence.save_decision(decision).await {
            tracing::error!(%txn_id, error = %e, "failed to save decision");
            crate::metrics::record_persistence_failure("save_decision");
        }

        let snapshot = AuditSnapshot {
            txn_id,
            score: decision.score,
            action: decision.action,
            reasons: decision.reasons.clone(),
            features: features.clone(),
            recorded_at: decision.decided_at,
        };
        if let Err(e) = self.audit.write(&snapshot).await {
            tracing::error!(%txn_id, error = %e, "failed to write audit snapshot");
            crate::metrics::record_persistence_failure("audit");
        }
    }
}
