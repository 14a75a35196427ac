//! Import-level idempotency: one accepted batch per
//! `(source_system, source_batch_id, content fingerprint)`.
//!
//! This is the second idempotency layer. Job-level keys make individual
//! enqueues safe to repeat; the ledger makes whole import files safe to
//! resubmit days later.

use std::collections::HashMap;
use std::sync::RwLock;

use sha2::{Digest, Sha256};
use writforge_core::BatchId;

use crate::batch::ImportRow;

/// Composite identity of an import submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImportKey {
    pub source_system: String,
    pub source_batch_id: String,
    pub fingerprint: String,
}

impl ImportKey {
    pub fn new(
        source_system: impl Into<String>,
        source_batch_id: impl Into<String>,
        rows: &[ImportRow],
    ) -> Self {
        Self {
            source_system: source_system.into(),
            source_batch_id: source_batch_id.into(),
            fingerprint: content_fingerprint(rows),
        }
    }
}

/// SHA-256 over the rows in submission order, hex-encoded.
///
/// Row refs and payloads are length-prefixed so concatenation cannot alias
/// across row boundaries.
pub fn content_fingerprint(rows: &[ImportRow]) -> String {
    let mut hasher = Sha256::new();
    for row in rows {
        hasher.update((row.row_ref.len() as u64).to_be_bytes());
        hasher.update(row.row_ref.as_bytes());
        // serde_json preserves map ordering (preserve_order is off), so the
        // serialized form is stable for a given payload value.
        let payload = serde_json::to_vec(&row.payload).unwrap_or_default();
        hasher.update((payload.len() as u64).to_be_bytes());
        hasher.update(&payload);
    }
    hex::encode(hasher.finalize())
}

/// In-process record of accepted imports.
#[derive(Debug, Default)]
pub struct ImportLedger {
    entries: RwLock<HashMap<ImportKey, BatchId>>,
}

impl ImportLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch previously accepted under this key, if any.
    pub fn lookup(&self, key: &ImportKey) -> Option<BatchId> {
        self.entries.read().unwrap().get(key).copied()
    }

    /// Record an acceptance. Returns the already-recorded batch id if the
    /// key was taken first, so callers can race safely.
    pub fn record(&self, key: ImportKey, batch_id: BatchId) -> Option<BatchId> {
        let mut entries = self.entries.write().unwrap();
        match entries.get(&key) {
            Some(existing) => Some(*existing),
            None => {
                entries.insert(key, batch_id);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<ImportRow> {
        vec![
            ImportRow::new("row-1", serde_json::json!({"case": "24-cv-100"})),
            ImportRow::new("row-2", serde_json::json!({"case": "24-cv-101"})),
        ]
    }

    #[test]
    fn identical_content_yields_identical_fingerprints() {
        assert_eq!(content_fingerprint(&rows()), content_fingerprint(&rows()));
    }

    #[test]
    fn any_content_change_alters_the_fingerprint() {
        let mut changed = rows();
        changed[1].payload = serde_json::json!({"case": "24-cv-999"});
        assert_ne!(content_fingerprint(&rows()), content_fingerprint(&changed));

        let reordered: Vec<_> = rows().into_iter().rev().collect();
        assert_ne!(content_fingerprint(&rows()), content_fingerprint(&reordered));
    }

    #[test]
    fn ledger_returns_the_first_recorded_batch() {
        let ledger = ImportLedger::new();
        let key = ImportKey::new("courtlink", "2026-08-01", &rows());
        let first = BatchId::new();

        assert_eq!(ledger.lookup(&key), None);
        assert_eq!(ledger.record(key.clone(), first), None);
        assert_eq!(ledger.record(key.clone(), BatchId::new()), Some(first));
        assert_eq!(ledger.lookup(&key), Some(first));
    }

    #[test]
    fn same_file_different_source_batch_is_a_distinct_key() {
        let a = ImportKey::new("courtlink", "2026-08-01", &rows());
        let b = ImportKey::new("courtlink", "2026-08-02", &rows());
        assert_ne!(a, b);
        assert_eq!(a.fingerprint, b.fingerprint);
    }
}
