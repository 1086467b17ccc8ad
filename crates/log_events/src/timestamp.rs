use std::{fmt, str::FromStr};

use time::{
    format_description::{well_known::Rfc3339, FormatItem},
    macros::format_description,
    Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset,
};

use crate::TimestampParseError;

/// Fixed-width rendering: nine fractional digits so text order is time order.
const RENDERED: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
);

/// Naive `YYYY-MM-DDTHH:MM:SS[.ffffff]` as written by earlier tooling; read as UTC.
const NAIVE_ISO: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]");

/// A UTC instant, rendered as RFC 3339 with a `Z` suffix and nanosecond
/// precision. Rendered values compare as text in the same order as instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(OffsetDateTime);

impl Timestamp {
    pub fn now() -> Self {
        Self(OffsetDateTime::now_utc())
    }

    pub fn from_datetime(datetime: OffsetDateTime) -> Self {
        Self(datetime.to_offset(UtcOffset::UTC))
    }

    pub fn as_datetime(&self) -> OffsetDateTime {
        self.0
    }

    /// Parses RFC 3339 (any offset, normalized to UTC) or the naive ISO-8601 form.
    pub fn parse(raw: &str) -> Result<Self, TimestampParseError> {
        let trimmed = raw.trim();
        if let Ok(datetime) = OffsetDateTime::parse(trimmed, &Rfc3339) {
            return Ok(Self::from_datetime(datetime));
        }
        PrimitiveDateTime::parse(trimmed, NAIVE_ISO)
            .map(|naive| Self(naive.assume_utc()))
            .map_err(|_| TimestampParseError {
                value: raw.to_string(),
            })
    }

    pub fn to_rfc3339(&self) -> String {
        self.0
            .format(RENDERED)
            .unwrap_or_else(|_| self.0.to_string())
    }

    /// The next representable instant after `self`.
    pub fn successor(&self) -> Self {
        self.0
            .checked_add(Duration::NANOSECOND)
            .map(Self)
            .unwrap_or(*self)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

impl FromStr for Timestamp {
    type Err = TimestampParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn renders_utc_with_z_suffix() {
        let ts = Timestamp::from_datetime(datetime!(2024-01-01 00:00:00 UTC));
        assert_eq!(ts.to_string(), "2024-01-01T00:00:00.000000000Z");

        let ts = Timestamp::from_datetime(datetime!(2024-01-01 02:30:00.5 +02:00));
        assert_eq!(ts.to_string(), "2024-01-01T00:30:00.500000000Z");
    }

    #[test]
    fn rendered_text_sorts_like_instants() {
        let mut stamps = vec![
            Timestamp::parse("2024-01-01T00:00:00.5Z").unwrap(),
            Timestamp::parse("2024-01-01T00:00:00Z").unwrap(),
            Timestamp::parse("2024-01-01T00:00:00.05Z").unwrap(),
            Timestamp::parse("2024-01-01T00:00:00.123456789Z").unwrap(),
            Timestamp::parse("2023-12-31T23:59:59.999999999Z").unwrap(),
        ];
        for _ in 0..100 {
            stamps.push(Timestamp::now());
        }

        let rendered: Vec<String> = stamps.iter().map(Timestamp::to_rfc3339).collect();
        assert!(rendered.iter().all(|text| text.len() == rendered[0].len()));

        let mut by_instant = stamps.clone();
        by_instant.sort();
        let mut by_text = rendered.clone();
        by_text.sort();
        let by_instant: Vec<String> = by_instant.iter().map(Timestamp::to_rfc3339).collect();
        assert_eq!(by_instant, by_text);
    }

    #[test]
    fn rendering_round_trips_exactly() {
        let now = Timestamp::now();
        assert_eq!(Timestamp::parse(&now.to_rfc3339()).unwrap(), now);
        assert!(now.successor() > now);
        assert_eq!(
            Timestamp::parse(&now.successor().to_rfc3339()).unwrap(),
            now.successor()
        );
    }

    #[test]
    fn parses_rfc3339_and_naive_iso() {
        let rfc = Timestamp::parse("2024-01-01T00:00:00Z").unwrap();
        let naive = Timestamp::parse("2024-01-01T00:00:00").unwrap();
        assert_eq!(rfc, naive);

        let micros = Timestamp::parse("2024-03-05T10:11:12.123456").unwrap();
        assert_eq!(micros.as_datetime().microsecond(), 123_456);

        let offset = Timestamp::parse("2024-01-01T01:00:00+01:00").unwrap();
        assert_eq!(offset, rfc);
    }

    #[test]
    fn rejects_garbage() {
        let err = Timestamp::parse("yesterday").unwrap_err();
        assert_eq!(err.value, "yesterday");
    }

    #[test]
    fn ordering_follows_instants() {
        let early = Timestamp::parse("2024-01-01T00:00:00Z").unwrap();
        let late = Timestamp::parse("2024-01-01T00:00:00.000001Z").unwrap();
        assert!(early < late);
        assert_eq!(early.max(late), late);
    }
}
