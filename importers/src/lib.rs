//! Importers Crate
//!
//! CPU-bound stages of contact imports. Nothing in this crate touches the
//! database; persistence and job orchestration live in `rolodex-api`.
//!
//! # Pipeline
//!
//! - `CsvParser`: RFC 4180 rows plus header, with quoting and encoding checks
//! - `FieldMapper`: header synonyms to canonical contact fields
//! - `normalize`: per-row validation, normalization and dedup fingerprint
//! - `ContactIndex`: tiered duplicate matching against one organization
//!
//! # Example
//!
//! ```rust,ignore
//! use importers::{ColumnMap, ContactIndex, CsvParser, FieldMapper, NormalizeWorkerPool};
//!
//! let parsed = CsvParser::new().parse(&bytes)?;
//! let mappings = FieldMapper::default().map_fields(&parsed.headers);
//! let columns = ColumnMap::from_mappings(&mappings)?;
//! let batch = NormalizeWorkerPool::new(0)?.normalize_all(&parsed.rows, &columns);
//! let index = ContactIndex::build(organization_id, existing);
//! let matches = index.find_duplicates(&batch.contacts[0]);
//! ```

pub mod contact_csv;

pub use contact_csv::{
    apply_overrides, check_ambiguity, ColumnMap, ContactIndex, CsvParser, FieldMapper,
    FieldSynonyms, NormalizeWorkerPool, NormalizedBatch, ParsedCsv, SynonymConfigError,
};
