use anyhow::{Context, Result};
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use shared_types::{NormalizedContact, RawRecord, ValidationError};
use std::sync::Arc;
use std::thread::available_parallelism;

use super::field_mapper::ColumnMap;
use super::normalizer::normalize;

/// Rows of one file after normalization, both lists in row order
#[derive(Debug, Default, Clone)]
pub struct NormalizedBatch {
    pub contacts: Vec<NormalizedContact>,
    pub rejected: Vec<ValidationError>,
}

impl NormalizedBatch {
    pub fn len(&self) -> usize {
        self.contacts.len() + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fixed-size CPU pool for per-row normalization.
///
/// A single thread means no pool at all; rows are then normalized inline.
#[derive(Clone)]
pub struct NormalizeWorkerPool {
    pool: Option<Arc<ThreadPool>>,
    threads: usize,
}

impl NormalizeWorkerPool {
    /// `threads == 0` sizes the pool from the available cores, leaving one free
    pub fn new(threads: usize) -> Result<Self> {
        let threads = if threads == 0 {
            available_parallelism()
                .map(|n| n.get().saturating_sub(1).max(1))
                .unwrap_or(1)
        } else {
            threads
        };

        if threads <= 1 {
            return Ok(Self {
                pool: None,
                threads: 1,
            });
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|idx| format!("contact-normalize-{idx}"))
            .build()
            .context("failed to build normalization worker pool")?;

        tracing::info!("Normalization pool started with {} threads", threads);

        Ok(Self {
            pool: Some(Arc::new(pool)),
            threads,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn normalize_all(&self, rows: &[RawRecord], columns: &ColumnMap) -> NormalizedBatch {
        let results: Vec<Result<NormalizedContact, ValidationError>> = match &self.pool {
            Some(pool) => pool.install(|| {
                rows.par_iter()
                    .map(|row| normalize(row, columns))
                    .collect()
            }),
            None => rows.iter().map(|row| normalize(row, columns)).collect(),
        };

        let mut batch = NormalizedBatch::default();
        for result in results {
            match result {
                Ok(contact) => batch.contacts.push(contact),
                Err(err) => batch.rejected.push(err),
            }
        }
        batch
    }
}

impl std::fmt::Debug for NormalizeWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NormalizeWorkerPool")
            .field("threads", &self.threads)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{CanonicalField, FieldMapping, ValidationReason};

    fn columns() -> ColumnMap {
        let mappings = vec![
            FieldMapping {
                csv_column: "Email".to_string(),
                column_index: 0,
                canonical_field: Some(CanonicalField::Email),
                confidence: 100,
            },
            FieldMapping {
                csv_column: "Name".to_string(),
                column_index: 1,
                canonical_field: Some(CanonicalField::Name),
                confidence: 100,
            },
        ];
        ColumnMap::from_mappings(&mappings).unwrap()
    }

    fn rows(count: usize) -> Vec<RawRecord> {
        (1..=count)
            .map(|row_index| RawRecord {
                row_index,
                values: if row_index % 10 == 0 {
                    vec!["broken".to_string(), "X".to_string()]
                } else {
                    vec![format!("user{}@example.com", row_index), format!("User {}", row_index)]
                },
            })
            .collect()
    }

    #[test]
    fn test_parallel_preserves_row_order() {
        let pool = NormalizeWorkerPool::new(4).unwrap();
        let batch = pool.normalize_all(&rows(500), &columns());

        assert_eq!(batch.len(), 500);
        assert_eq!(batch.rejected.len(), 50);
        assert!(batch
            .contacts
            .windows(2)
            .all(|pair| pair[0].row_index < pair[1].row_index));
        assert!(batch
            .rejected
            .iter()
            .all(|e| e.reason == ValidationReason::InvalidEmailFormat));
        assert_eq!(batch.rejected[0].row_index, 10);
    }

    #[test]
    fn test_single_thread_matches_parallel() {
        let input = rows(200);
        let inline = NormalizeWorkerPool::new(1).unwrap();
        let parallel = NormalizeWorkerPool::new(3).unwrap();

        assert_eq!(inline.threads(), 1);
        let a = inline.normalize_all(&input, &columns());
        let b = parallel.normalize_all(&input, &columns());
        assert_eq!(a.contacts, b.contacts);
        assert_eq!(a.rejected, b.rejected);
    }

    #[test]
    fn test_auto_sized_pool() {
        let pool = NormalizeWorkerPool::new(0).unwrap();
        assert!(pool.threads() >= 1);
    }
}
