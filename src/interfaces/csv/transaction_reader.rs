use crate::domain::transaction::TransactionRequest;
use crate::error::{GatewayError, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;

/// One CSV row. EMV tags are packed as `TAG=VALUE` pairs separated by `;`.
#[derive(Debug, Deserialize)]
struct TransactionRow {
    #[serde(default)]
    txn_id: Option<u64>,
    merchant_id: String,
    #[serde(default)]
    terminal_id: Option<String>,
    amount_minor_units: i64,
    #[serde(default)]
    currency: Option<String>,
    card_pan: String,
    #[serde(default)]
    emv_tags: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl TryFrom<TransactionRow> for TransactionRequest {
    type Error = GatewayError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        let emv_tags = match row.emv_tags.as_deref() {
            Some(packed) => parse_emv_tags(packed)?,
            None => BTreeMap::new(),
        };
        Ok(TransactionRequest {
            txn_id: row.txn_id,
            merchant_id: row.merchant_id,
            terminal_id: row.terminal_id.filter(|t| !t.is_empty()),
            amount_minor_units: row.amount_minor_units,
            currency: row
                .currency
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| "USD".to_string()),
            card_pan: row.card_pan,
            emv_tags,
            acquirer_response: None,
            timestamp: row.timestamp,
        })
    }
}

fn parse_emv_tags(packed: &str) -> Result<BTreeMap<String, String>> {
    packed
        .split(';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((tag, value)) if !tag.trim().is_empty() => {
                Ok((tag.trim().to_string(), value.trim().to_string()))
            }
            _ => Err(GatewayError::ValidationError(format!(
                "malformed EMV tag pair '{}'",
                pair
            ))),
        })
        .collect()
}

/// Reads transaction requests from a CSV source.
///
/// Whitespace is trimmed and missing trailing columns are tolerated. Every row
/// is yielded as its own `Result`, so one bad line does not stop a replay.
pub struct TransactionReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> TransactionReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes rows, so large files stream in constant memory.
    pub fn requests(self) -> impl Iterator<Item = Result<TransactionRequest>> {
        self.reader
            .into_deserialize::<TransactionRow>()
            .map(|row| row.map_err(GatewayError::from).and_then(TransactionRequest::try_from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "txn_id,merchant_id,terminal_id,amount_minor_units,currency,card_pan,emv_tags,timestamp";

    #[test]
    fn test_reader_valid_stream() {
        let data = format!(
            "{HEADER}\n\
             1, m-1, t-1, 2500, EUR, 4111111111111111, 9F34=1E0300;95=0000008000, 2024-05-01T10:00:00Z\n\
             , m-2, , 100, , 5500000000000004, ,"
        );
        let reader = TransactionReader::new(data.as_bytes());
        let results: Vec<Result<TransactionRequest>> = reader.requests().collect();

        assert_eq!(results.len(), 2);
        let first = results[0].as_ref().unwrap();
        assert_eq!(first.txn_id, Some(1));
        assert_eq!(first.currency, "EUR");
        assert_eq!(first.emv_tags.len(), 2);
        assert_eq!(first.emv_tags.get("9F34").map(String::as_str), Some("1E0300"));
        assert!(first.timestamp.is_some());

        let second = results[1].as_ref().unwrap();
        assert_eq!(second.txn_id, None);
        assert_eq!(second.terminal_id, None);
        assert_eq!(second.currency, "USD");
        assert!(second.emv_tags.is_empty());
    }

    #[test]
    fn test_reader_malformed_line() {
        let data = format!("{HEADER}\n1, m-1, t-1, not-a-number, USD, 4111, ,");
        let reader = TransactionReader::new(data.as_bytes());
        let results: Vec<Result<TransactionRequest>> = reader.requests().collect();

        assert!(matches!(results[0], Err(GatewayError::CsvError(_))));
    }

    #[test]
    fn test_reader_rejects_bad_emv_pair() {
        let data = format!("{HEADER}\n1, m-1, t-1, 100, USD, 4111, 9F34, ");
        let reader = TransactionReader::new(data.as_bytes());
        let results: Vec<Result<TransactionRequest>> = reader.requests().collect();

        assert!(matches!(results[0], Err(GatewayError::ValidationError(_))));
    }
}
