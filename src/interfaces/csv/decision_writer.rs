use crate::application::ingestion::IngestOutcome;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct DecisionRow<'a> {
    txn_id: u64,
    status: &'static str,
    action: &'a str,
    score: String,
    latency_ms: u64,
    reasons: String,
}

/// Writes one CSV line per ingested transaction.
pub struct DecisionWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> DecisionWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write(&mut self, outcome: &IngestOutcome) -> Result<()> {
        let row = match outcome {
            IngestOutcome::Decided(response) => DecisionRow {
                txn_id: response.txn_id.0,
                status: "decided",
                action: response.action.as_str(),
                score: format!("{:.4}", response.score),
                latency_ms: response.latency_ms,
                reasons: response.reasons.join("; "),
            },
            IngestOutcome::Queued { txn_id } => DecisionRow {
                txn_id: txn_id.0,
                status: "queued",
                action: "",
                score: String::new(),
                latency_ms: 0,
                reasons: String::new(),
            },
        };
        self.writer.serialize(row)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::pipeline::PipelineResponse;
    use crate::domain::decision::Action;
    use crate::domain::transaction::TxnId;

    #[test]
    fn test_writer_output() {
        let mut buffer = Vec::new();
        {
            let mut writer = DecisionWriter::new(&mut buffer);
            writer
                .write(&IngestOutcome::Decided(PipelineResponse {
                    txn_id: TxnId(1),
                    score: 0.97,
                    action: Action::Block,
                    reasons: vec!["a".to_string(), "b".to_string()],
                    latency_ms: 4,
                }))
                .unwrap();
            writer.write(&IngestOutcome::Queued { txn_id: TxnId(2) }).unwrap();
            writer.flush().unwrap();
        }

        let output = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "txn_id,status,action,score,latency_ms,reasons");
        assert_eq!(lines[1], "1,decided,BLOCK,0.9700,4,a; b");
        assert_eq!(lines[2], "2,queued,,,0,");
    }
}
