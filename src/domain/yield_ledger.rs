//! Yield Ledger
//!
//! Append-only record of verified yield extractions for one instance.
//! Entries are written only after the harvest transaction verified; a
//! signature can be recorded at most once.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldExtraction {
    pub timestamp: DateTime<Utc>,
    /// Harvested value denominated in the base (Y) asset
    pub extracted_amount: Decimal,
    pub transaction_signature: String,
    pub gas_used: u64,
    pub price_at_extraction: f64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Signature already recorded: {0}")]
    DuplicateSignature(String),

    #[error("Extraction has no transaction signature")]
    MissingSignature,
}

/// Per-instance accumulated yield
#[derive(Debug, Default)]
pub struct AccumulatedYieldManager {
    entries: RwLock<Vec<YieldExtraction>>,
}

impl AccumulatedYieldManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a verified extraction.
    pub fn record(&self, extraction: YieldExtraction) -> Result<(), LedgerError> {
        if extraction.transaction_signature.is_empty() {
            return Err(LedgerError::MissingSignature);
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries
            .iter()
            .any(|e| e.transaction_signature == extraction.transaction_signature)
        {
            return Err(LedgerError::DuplicateSignature(extraction.transaction_signature));
        }
        debug!(
            signature = %extraction.transaction_signature,
            amount = %extraction.extracted_amount,
            "Recording yield extraction"
        );
        entries.push(extraction);
        Ok(())
    }

    pub fn total_extracted(&self) -> Decimal {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| e.extracted_amount)
            .sum()
    }

    pub fn entries(&self) -> Vec<YieldExtraction> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn contains_signature(&self, signature: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|e| e.transaction_signature == signature)
    }

    pub fn last_extraction(&self) -> Option<YieldExtraction> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }

    pub async fn shutdown(&self) {
        info!(
            entries = self.count(),
            total = %self.total_extracted(),
            "Yield ledger closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn extraction(sig: &str, amount: Decimal) -> YieldExtraction {
        YieldExtraction {
            timestamp: Utc::now(),
            extracted_amount: amount,
            transaction_signature: sig.to_string(),
            gas_used: 5000,
            price_at_extraction: 1.0,
        }
    }

    #[test]
    fn test_accumulates() {
        let ledger = AccumulatedYieldManager::new();
        ledger.record(extraction("a", dec!(1.5))).unwrap();
        ledger.record(extraction("b", dec!(2.5))).unwrap();
        assert_eq!(ledger.total_extracted(), dec!(4.0));
        assert_eq!(ledger.count(), 2);
        assert_eq!(ledger.last_extraction().unwrap().transaction_signature, "b");
    }

    #[test]
    fn test_rejects_duplicate_signature() {
        let ledger = AccumulatedYieldManager::new();
        ledger.record(extraction("a", dec!(1))).unwrap();
        let err = ledger.record(extraction("a", dec!(1))).unwrap_err();
        assert_eq!(err, LedgerError::DuplicateSignature("a".into()));
        assert_eq!(ledger.total_extracted(), dec!(1));
    }

    #[test]
    fn test_rejects_missing_signature() {
        let ledger = AccumulatedYieldManager::new();
        assert_eq!(
            ledger.record(extraction("", dec!(1))),
            Err(LedgerError::MissingSignature)
        );
        assert_eq!(ledger.count(), 0);
    }
}
