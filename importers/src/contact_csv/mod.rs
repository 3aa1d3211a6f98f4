//! Contact CSV import pipeline: parse, map headers, normalize, detect duplicates.

pub mod csv_parser;
pub mod duplicate_detector;
pub mod field_mapper;
pub mod normalizer;
pub mod worker_pool;

pub use csv_parser::{CsvParser, ParsedCsv};
pub use duplicate_detector::{
    action_for_confidence, recommend_action, ContactIndex, EMAIL_MATCH_CONFIDENCE,
    NAME_MATCH_CONFIDENCE, PHONE_MATCH_CONFIDENCE,
};
pub use field_mapper::{
    apply_overrides, check_ambiguity, ColumnMap, FieldMapper, FieldSynonyms, SynonymConfigError,
};
pub use normalizer::{dedup_hash, normalize, normalize_email, normalize_name, normalize_phone};
pub use worker_pool::{NormalizeWorkerPool, NormalizedBatch};
