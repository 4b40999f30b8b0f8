use crate::error::GatewayError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Gateway-assigned transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One-way hash of a card PAN. The clear PAN never leaves ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardFingerprint(String);

impl CardFingerprint {
    /// Hashes a clear PAN with SHA-256. Spaces and dashes are ignored so that
    /// formatted and unformatted card numbers map to the same fingerprint.
    pub fn from_pan(pan: &str) -> Self {
        let digits: String = pan.chars().filter(|c| !matches!(c, ' ' | '-')).collect();
        let digest = Sha256::digest(digits.as_bytes());
        Self(hex::encode(digest))
    }

    /// Wraps an already hashed value (e.g. replayed from storage).
    pub fn from_hash(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First six characters of the hash, used as a coarse card-bin bucket.
    pub fn bin_hash(&self) -> Option<&str> {
        self.0.get(..6)
    }
}

impl fmt::Display for CardFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the full fingerprint in logs.
        match self.bin_hash() {
            Some(prefix) => write!(f, "{}…", prefix),
            None => write!(f, "<empty>"),
        }
    }
}

/// A positive transaction amount in the currency's minor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Amount(i64);

impl Amount {
    pub fn new(minor_units: i64) -> Result<Self, GatewayError> {
        if minor_units > 0 {
            Ok(Self(minor_units))
        } else {
            Err(GatewayError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn minor_units(&self) -> i64 {
        self.0
    }

    /// Converts to major units using the ISO-4217 exponent of `currency`.
    pub fn to_major(&self, currency: &str) -> Decimal {
        Decimal::new(self.0, currency_exponent(currency))
    }
}

impl TryFrom<i64> for Amount {
    type Error = GatewayError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for i64 {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

/// Number of minor-unit digits for an ISO-4217 currency code.
pub fn currency_exponent(currency: &str) -> u32 {
    match currency.to_ascii_uppercase().as_str() {
        "JPY" | "KRW" | "VND" | "CLP" | "ISK" | "XOF" | "XAF" | "UGX" => 0,
        "BHD" | "KWD" | "JOD" | "OMR" | "TND" | "LYD" | "IQD" => 3,
        _ => 2,
    }
}

/// An ingested payment transaction.
///
/// Fields are fixed at ingestion. The only later change is the acquirer
/// response code, which the decision engine writes through the persistence
/// gateway when it blocks or holds a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub txn_id: TxnId,
    pub merchant_id: String,
    pub terminal_id: Option<String>,
    pub card_fingerprint: CardFingerprint,
    pub amount: Amount,
    pub currency: String,
    pub timestamp: DateTime<Utc>,
    /// EMV tag (upper-case hex tag name) to hex-encoded value.
    #[serde(default)]
    pub emv_tags: BTreeMap<String, String>,
    pub acquirer_response: Option<String>,
}

impl Transaction {
    pub fn amount_major(&self) -> Decimal {
        self.amount.to_major(&self.currency)
    }
}

/// Inbound transaction as submitted by a merchant or PSP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRequest {
    /// Optional caller-supplied id, used to replay a request idempotently.
    #[serde(default)]
    pub txn_id: Option<u64>,
    pub merchant_id: String,
    #[serde(default)]
    pub terminal_id: Option<String>,
    pub amount_minor_units: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub card_pan: String,
    #[serde(default)]
    pub emv_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub acquirer_response: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl TransactionRequest {
    /// Validates the request and builds the immutable transaction.
    pub fn into_transaction(self, txn_id: TxnId, now: DateTime<Utc>) -> Result<Transaction, GatewayError> {
        if self.merchant_id.trim().is_empty() {
            return Err(GatewayError::ValidationError(
                "merchant_id is required".to_string(),
            ));
        }
        if self.card_pan.trim().is_empty() {
            return Err(GatewayError::ValidationError(
                "card_pan is required".to_string(),
            ));
        }
        let amount = Amount::new(self.amount_minor_units)?;
        let emv_tags = self
            .emv_tags
            .into_iter()
            .map(|(tag, value)| (tag.trim().to_ascii_uppercase(), value.trim().to_string()))
            .collect();

        Ok(Transaction {
            txn_id,
            merchant_id: self.merchant_id,
            terminal_id: self.terminal_id.filter(|t| !t.is_empty()),
            card_fingerprint: CardFingerprint::from_pan(&self.card_pan),
            amount,
            currency: self.currency.to_ascii_uppercase(),
            timestamp: self.timestamp.unwrap_or(now),
            emv_tags,
            acquirer_response: self.acquirer_response,
        })
    }
}
