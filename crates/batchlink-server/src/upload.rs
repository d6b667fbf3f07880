// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Parsing of uploaded identifier lists.

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Upload validation failures.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The file is not UTF-8 text.
    #[error("CSV file must be UTF-8 encoded")]
    NotUtf8,

    /// The file is not parseable CSV.
    #[error("Invalid CSV: {0}")]
    Csv(#[from] csv::Error),

    /// No usable identifiers were found.
    #[error("No LinkedIn URLs found in CSV")]
    NoIdentifiers,

    /// A required multipart field is absent or empty.
    #[error("Missing form field '{0}'")]
    MissingField(&'static str),

    /// The multipart body could not be read.
    #[error("Invalid multipart body: {0}")]
    Multipart(String),
}

/// Extract identifiers from a single-column CSV.
///
/// The first cell of every row is trimmed and kept when it starts with
/// `http` (any case). A leading UTF-8 byte order mark is ignored.
pub fn parse_identifiers(content: &[u8]) -> Result<Vec<String>, UploadError> {
    let content = content.strip_prefix(UTF8_BOM).unwrap_or(content);
    std::str::from_utf8(content).map_err(|_| UploadError::NotUtf8)?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(content);

    let mut identifiers = Vec::new();
    for record in reader.records() {
        let record = record?;
        let Some(cell) = record.get(0).map(str::trim) else {
            continue;
        };
        if cell.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("http")) {
            identifiers.push(cell.to_string());
        }
    }

    if identifiers.is_empty() {
        return Err(UploadError::NoIdentifiers);
    }
    Ok(identifiers)
}
