use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field} '{value}'"))
}

/// Maps a conversion failure into the rusqlite error space so it can
/// surface from inside `query_map` closures.
pub fn invalid_column(err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        err.to_string(),
    )))
}
