use crate::domain::decision::{Alert, Decision};
use crate::domain::ports::PersistenceGateway;
use crate::domain::transaction::{Transaction, TxnId};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options};
use std::path::Path;
use std::sync::Arc;

/// Column Family for ingested transactions.
pub const CF_TRANSACTIONS: &str = "transactions";
/// Column Family for decisions, keyed by transaction id.
pub const CF_DECISIONS: &str = "decisions";
/// Column Family for alerts. Each value is the JSON list of alerts for one id.
pub const CF_ALERTS: &str = "alerts";

/// A persistent gateway backed by RocksDB.
///
/// Each entity lives in its own Column Family with big-endian transaction ids
/// as keys, so iteration order matches id order.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBPersistence {
    db: Arc<DB>,
}

impl RocksDBPersistence {
    /// Opens or creates a RocksDB instance at `path`, creating missing column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = [CF_TRANSACTIONS, CF_DECISIONS, CF_ALERTS]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            GatewayError::PersistenceFailure(format!("{name} column family not found"))
        })
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, cf: &str, txn_id: TxnId) -> Result<Option<T>> {
        let handle = self.cf(cf)?;
        match self.db.get_cf(handle, txn_id.0.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: serde::Serialize>(&self, cf: &str, txn_id: TxnId, value: &T) -> Result<()> {
        let handle = self.cf(cf)?;
        let bytes = serde_json::to_vec(value)?;
        self.db.put_cf(handle, txn_id.0.to_be_bytes(), bytes)?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for RocksDBPersistence {
    async fn save_transaction(&self, tx: &Transaction) -> Result<()> {
        self.put_json(CF_TRANSACTIONS, tx.txn_id, tx)
    }

    async fn find_transaction(&self, txn_id: TxnId) -> Result<Option<Transaction>> {
        self.get_json(CF_TRANSACTIONS, txn_id)
    }

    async fn update_acquirer_response(&self, txn_id: TxnId, code: &str) -> Result<()> {
        if let Some(mut tx) = self.get_json::<Transaction>(CF_TRANSACTIONS, txn_id)? {
            tx.acquirer_response = Some(code.to_string());
            self.put_json(CF_TRANSACTIONS, txn_id, &tx)?;
        }
        Ok(())
    }

    async fn save_decision(&self, decision: &Decision) -> Result<()> {
        let handle = self.cf(CF_DECISIONS)?;
        // Just check if the key exists without retrieving the value
        if self
            .db
            .get_pinned_cf(handle, decision.txn_id.0.to_be_bytes())?
            .is_some()
        {
            return Ok(());
        }
        self.put_json(CF_DECISIONS, decision.txn_id, decision)
    }

    async fn find_decision(&self, txn_id: TxnId) -> Result<Option<Decision>> {
        self.get_json(CF_DECISIONS, txn_id)
    }

    async fn save_alert(&self, alert: &Alert) -> Result<()> {
        let mut alerts: Vec<Alert> = self.get_json(CF_ALERTS, alert.txn_id)?.unwrap_or_default();
        alerts.push(alert.clone());
        self.put_json(CF_ALERTS, alert.txn_id, &alerts)
    }

    async fn find_alerts(&self, txn_id: TxnId) -> Result<Vec<Alert>> {
        Ok(self.get_json(CF_ALERTS, txn_id)?.unwrap_or_default())
    }

    async fn max_txn_id(&self) -> Result<Option<TxnId>> {
        let handle = self.cf(CF_TRANSACTIONS)?;
        let Some(item) = self.db.iterator_cf(handle, IteratorMode::End).next() else {
            return Ok(None);
        };
        let (key, _) = item?;
        let bytes: [u8; 8] = key.as_ref().try_into().map_err(|_| {
            GatewayError::PersistenceFailure(format!("malformed transaction key of {} bytes", key.len()))
        })?;
        Ok(Some(TxnId(u64::from_be_bytes(bytes))))
    }
}
