use csv::ReaderBuilder;
use shared_types::{ParseError, RawRecord};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Header row plus the non-blank data rows of an uploaded file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCsv {
    pub headers: Vec<String>,
    pub rows: Vec<RawRecord>,
    /// Rows whose cell count differed from the header and were reshaped
    pub reshaped_rows: Vec<usize>,
    pub dropped_blank_rows: usize,
}

impl ParsedCsv {
    pub fn total_rows(&self) -> usize {
        self.rows.len()
    }
}

/// RFC 4180 reader for contact uploads.
///
/// Rows with a different cell count than the header are reshaped rather than
/// rejected: short rows are padded with empty cells and surplus cells are
/// dropped. Every reshaped row is reported in [`ParsedCsv::reshaped_rows`].
pub struct CsvParser {
    delimiter: u8,
}

impl Default for CsvParser {
    fn default() -> Self {
        Self::new()
    }
}

impl CsvParser {
    pub fn new() -> Self {
        Self { delimiter: b',' }
    }

    pub fn with_delimiter(delimiter: u8) -> Self {
        Self { delimiter }
    }

    pub fn parse(&self, content: &[u8]) -> Result<ParsedCsv, ParseError> {
        let (content, bom_len) = match content.strip_prefix(UTF8_BOM) {
            Some(rest) => (rest, UTF8_BOM.len()),
            None => (content, 0),
        };

        let text = std::str::from_utf8(content).map_err(|e| ParseError::Encoding {
            offset: e.valid_up_to() + bom_len,
        })?;

        if text.trim().is_empty() {
            return Err(ParseError::EmptyFile);
        }

        check_quoting(text.as_bytes(), self.delimiter)?;

        let mut reader = ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = reader
            .headers()
            .map_err(map_csv_error)?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        if headers.iter().all(|h| h.is_empty()) {
            return Err(ParseError::EmptyFile);
        }

        let mut rows = Vec::new();
        let mut reshaped_rows = Vec::new();
        let mut dropped_blank_rows = 0;

        for (position, result) in reader.records().enumerate() {
            let record = result.map_err(map_csv_error)?;
            let row_index = position + 1;

            if record.iter().all(|cell| cell.trim().is_empty()) {
                dropped_blank_rows += 1;
                continue;
            }

            let mut values: Vec<String> = record.iter().map(str::to_string).collect();
            if values.len() != headers.len() {
                tracing::debug!(
                    "Row {} has {} cells, header has {}",
                    row_index,
                    values.len(),
                    headers.len()
                );
                values.resize(headers.len(), String::new());
                reshaped_rows.push(row_index);
            }

            rows.push(RawRecord { row_index, values });
        }

        if rows.is_empty() {
            return Err(ParseError::EmptyFile);
        }

        if !reshaped_rows.is_empty() {
            tracing::warn!(
                "{} row(s) did not match the header width and were reshaped",
                reshaped_rows.len()
            );
        }

        Ok(ParsedCsv {
            headers,
            rows,
            reshaped_rows,
            dropped_blank_rows,
        })
    }
}

fn map_csv_error(err: csv::Error) -> ParseError {
    match err.kind() {
        csv::ErrorKind::Utf8 { pos, .. } => ParseError::Encoding {
            offset: pos.as_ref().map(|p| p.byte() as usize).unwrap_or(0),
        },
        _ => ParseError::MalformedQuoting {
            line: err.position().map(|p| p.line()).unwrap_or(0),
        },
    }
}

#[derive(Clone, Copy)]
enum QuoteState {
    FieldStart,
    Unquoted,
    Quoted { opened_on: u64 },
    QuoteInQuoted { opened_on: u64 },
}

/// Rejects unterminated quoted fields and text trailing a closing quote.
///
/// The csv reader is lenient about both and would otherwise swallow the rest
/// of the file into a single cell.
fn check_quoting(content: &[u8], delimiter: u8) -> Result<(), ParseError> {
    let mut state = QuoteState::FieldStart;
    let mut line: u64 = 1;

    for &byte in content {
        state = match (state, byte) {
            (QuoteState::FieldStart, b'"') => QuoteState::Quoted { opened_on: line },
            (QuoteState::FieldStart, b) | (QuoteState::Unquoted, b)
                if b == delimiter || b == b'\n' || b == b'\r' =>
            {
                QuoteState::FieldStart
            }
            (QuoteState::FieldStart, _) | (QuoteState::Unquoted, _) => QuoteState::Unquoted,
            (QuoteState::Quoted { opened_on }, b'"') => QuoteState::QuoteInQuoted { opened_on },
            (quoted @ QuoteState::Quoted { .. }, _) => quoted,
            (QuoteState::QuoteInQuoted { opened_on }, b'"') => QuoteState::Quoted { opened_on },
            (QuoteState::QuoteInQuoted { .. }, b)
                if b == delimiter || b == b'\n' || b == b'\r' =>
            {
                QuoteState::FieldStart
            }
            (QuoteState::QuoteInQuoted { .. }, _) => {
                return Err(ParseError::MalformedQuoting { line });
            }
        };

        if byte == b'\n' {
            line += 1;
        }
    }

    match state {
        QuoteState::Quoted { opened_on } => Err(ParseError::MalformedQuoting { line: opened_on }),
        _ => Ok(()),
    }
}
