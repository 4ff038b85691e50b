//! CSV encoding of formatted records.
//!
//! Header: `symbol,timestamp,open,high,low,close,volume`, timestamps in
//! RFC 3339 UTC.

use crate::domain::FormattedRecord;

pub fn encode(records: &[FormattedRecord]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    if records.is_empty() {
        writer.write_record(FormattedRecord::COLUMNS)?;
    }
    for record in records {
        writer.serialize(record)?;
    }
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

/// Decode a formatted CSV, rejecting files whose header differs from
/// [`FormattedRecord::COLUMNS`].
pub fn decode(bytes: &[u8]) -> Result<Vec<FormattedRecord>, DecodeError> {
    let mut reader = csv::Reader::from_reader(bytes);
    let headers = reader.headers()?.clone();
    if headers.iter().ne(FormattedRecord::COLUMNS) {
        return Err(DecodeError::Header(headers.iter().collect::<Vec<_>>().join(",")));
    }
    reader
        .deserialize()
        .collect::<Result<Vec<FormattedRecord>, _>>()
        .map_err(DecodeError::from)
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected header '{0}'")]
    Header(String),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}
