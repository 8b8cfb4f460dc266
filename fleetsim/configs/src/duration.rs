//! Duration fields travel as strings with unit suffixes ("100ms", "1m30s").

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid duration '{value}': {source}")]
pub struct DurationParseError {
    pub value: String,
    #[source]
    source: humantime::DurationError,
}

/// Parses a suffix-style duration string.
pub fn parse_duration(value: &str) -> Result<Duration, DurationParseError> {
    humantime::parse_duration(value).map_err(|source| DurationParseError {
        value: value.to_owned(),
        source,
    })
}

/// Renders a duration in the same suffix style the parser accepts.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}
