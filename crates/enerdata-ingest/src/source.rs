//! Delimited source files
//!
//! [`SourceReader`] decodes a file with the first candidate encoding that
//! accepts every byte, parses it as delimited text and projects each record
//! onto a fixed list of columns. Values are returned raw; interpretation is
//! left to [`crate::normalize`].

use encoding_rs::{Encoding, UTF_8};
use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use tracing::debug;

use crate::error::{SourceError, SourceResult};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSelector {
    Name(String),
    /// Zero-based position in the header row
    Position(usize),
}

impl fmt::Display for ColumnSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnSelector::Name(name) => write!(f, "'{}'", name),
            ColumnSelector::Position(i) => write!(f, "at position {}", i),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub selector: ColumnSelector,
    pub required: bool,
}

/// Ordered columns to extract from every record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    columns: Vec<ColumnSpec>,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>) -> Self {
        self.columns.push(ColumnSpec {
            selector: ColumnSelector::Name(name.into()),
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>) -> Self {
        self.columns.push(ColumnSpec {
            selector: ColumnSelector::Name(name.into()),
            required: false,
        });
        self
    }

    pub fn column(mut self, selector: ColumnSelector, required: bool) -> Self {
        self.columns.push(ColumnSpec { selector, required });
        self
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn resolve(&self, label: &str, headers: &csv::StringRecord) -> SourceResult<Vec<Option<usize>>> {
        self.columns
            .iter()
            .map(|spec| {
                let index = match &spec.selector {
                    ColumnSelector::Name(name) => headers.iter().position(|h| h.trim() == name),
                    ColumnSelector::Position(i) => (*i < headers.len()).then_some(*i),
                };
                match index {
                    None if spec.required => Err(SourceError::MissingColumn {
                        label: label.to_string(),
                        column: spec.selector.to_string(),
                    }),
                    index => Ok(index),
                }
            })
            .collect()
    }
}

/// Raw projected values of one source file
#[derive(Debug, Clone)]
pub struct SourceTable {
    pub label: String,
    /// Name of the encoding that decoded the file
    pub encoding: &'static str,
    /// Header text of every projected column, `None` where an optional
    /// column was missing
    pub headers: Vec<Option<String>>,
    pub rows: Vec<Vec<Option<String>>>,
}

#[derive(Debug, Clone)]
pub struct SourceReader {
    delimiter: u8,
    encodings: Vec<&'static Encoding>,
}

impl SourceReader {
    pub fn new(delimiter: u8, encodings: Vec<&'static Encoding>) -> Self {
        Self { delimiter, encodings }
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    pub fn read_path(&self, path: &Path, projection: &Projection) -> SourceResult<SourceTable> {
        let bytes = std::fs::read(path).map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.read_bytes(&path.display().to_string(), &bytes, projection)
    }

    pub fn read_bytes(&self, label: &str, bytes: &[u8], projection: &Projection) -> SourceResult<SourceTable> {
        let (text, encoding) = self.decode(label, bytes)?;

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(text.as_bytes());

        let csv_error = |source| SourceError::Csv {
            label: label.to_string(),
            source,
        };

        let header_record = reader.headers().map_err(csv_error)?.clone();
        let indexes = projection.resolve(label, &header_record)?;
        let headers = indexes
            .iter()
            .map(|i| i.and_then(|i| header_record.get(i)).map(|h| h.trim().to_string()))
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(csv_error)?;
            rows.push(
                indexes
                    .iter()
                    .map(|i| i.and_then(|i| record.get(i)).map(str::to_string))
                    .collect(),
            );
        }

        debug!(
            source = label,
            encoding = encoding.name(),
            rows = rows.len(),
            "Source decoded"
        );

        Ok(SourceTable {
            label: label.to_string(),
            encoding: encoding.name(),
            headers,
            rows,
        })
    }

    /// First candidate encoding that decodes without replacement characters
    fn decode<'a>(&self, label: &str, bytes: &'a [u8]) -> SourceResult<(Cow<'a, str>, &'static Encoding)> {
        for encoding in &self.encodings {
            let input = if *encoding == UTF_8 {
                bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes)
            } else {
                bytes
            };
            if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(input) {
                return Ok((text, *encoding));
            }
            debug!(source = label, encoding = encoding.name(), "Encoding rejected, trying next");
        }

        Err(SourceError::Undecodable {
            label: label.to_string(),
            tried: self
                .encodings
                .iter()
                .map(|e| e.name())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use encoding_rs::WINDOWS_1252;
    use std::io::Write;

    fn reader() -> SourceReader {
        SourceReader::new(b';', vec![UTF_8, WINDOWS_1252])
    }

    #[test]
    fn test_falls_back_to_next_encoding() {
        // "São Paulo" in latin-1
        let bytes = b"id_estado;nom_estado\nSP;S\xE3o Paulo\n";
        let table = reader()
            .read_bytes("registry", bytes, &Projection::new().required("id_estado").required("nom_estado"))
            .unwrap();

        assert_eq!(table.encoding, "windows-1252");
        assert_eq!(table.rows, vec![vec![Some("SP".to_string()), Some("São Paulo".to_string())]]);
    }

    #[test]
    fn test_utf8_bom_is_stripped() {
        let bytes = "\u{feff}Entity,Code,Year\nBrazil,BRA,2020\n".as_bytes();
        let table = SourceReader::new(b',', vec![UTF_8])
            .read_bytes("owid", bytes, &Projection::new().required("Entity").required("Code"))
            .unwrap();

        assert_eq!(table.encoding, "UTF-8");
        assert_eq!(table.rows[0][1].as_deref(), Some("BRA"));
    }

    #[test]
    fn test_undecodable_under_every_encoding() {
        let err = SourceReader::new(b';', vec![UTF_8])
            .read_bytes("registry", b"a;b\n\xFF;1\n", &Projection::new().required("a"))
            .unwrap_err();
        assert!(matches!(err, SourceError::Undecodable { .. }));
    }

    #[test]
    fn test_missing_columns() {
        let bytes = b"a;b\n1;2\n";
        let err = reader()
            .read_bytes("registry", bytes, &Projection::new().required("c"))
            .unwrap_err();
        assert!(matches!(err, SourceError::MissingColumn { ref column, .. } if column == "'c'"));

        let table = reader()
            .read_bytes(
                "registry",
                bytes,
                &Projection::new()
                    .optional("c")
                    .column(ColumnSelector::Position(1), true),
            )
            .unwrap();
        assert_eq!(table.headers, vec![None, Some("b".to_string())]);
        assert_eq!(table.rows, vec![vec![None, Some("2".to_string())]]);
    }

    #[test]
    fn test_short_records_yield_absent_values() {
        let table = reader()
            .read_bytes("registry", b"a;b\n1\n", &Projection::new().required("a").required("b"))
            .unwrap();
        assert_eq!(table.rows, vec![vec![Some("1".to_string()), None]]);
    }

    #[test]
    fn test_read_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"a;b\n1;2\n").unwrap();

        let table = reader().read_path(file.path(), &Projection::new().required("b")).unwrap();
        assert_eq!(table.rows.len(), 1);

        let missing = reader().read_path(Path::new("/nonexistent/registry.csv"), &Projection::new());
        assert!(matches!(missing, Err(SourceError::Io { .. })));
    }
}
