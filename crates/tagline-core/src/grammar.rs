//! Tag grammar: the literal form of every service tag kind.
//!
//! A tag token is the marker character plus the text up to the next
//! whitespace, exactly as the platform's tag annotation covers it. The
//! scheduled form extends past the annotation: up to two whitespace-delimited
//! fields after the token are absorbed when they parse as a date and a time.
//!
//! The legacy vocabulary is recognized only while the migration window is
//! open; recognized legacy tokens are rewritten in place to the current
//! marker before classification continues.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::entity::utf16_len;
use crate::ticket::{Priority, Status};

/// Marker character every tag token starts with.
pub const TAG_MARKER: char = '#';

/// Current status literals.
pub const OPEN_LITERAL: &str = "#o";
pub const CLOSED_LITERAL: &str = "#x";
/// Current scheduled marker.
pub const SCHEDULED_LITERAL: &str = "#s";
/// Current priority marker (bare form means "default priority").
pub const PRIORITY_LITERAL: &str = "#p";

/// Legacy vocabulary, recognized inside the migration window only.
pub const LEGACY_OPEN_LITERAL: &str = "#todo";
pub const LEGACY_CLOSED_LITERAL: &str = "#done";
pub const LEGACY_SCHEDULED_LITERAL: &str = "#defer";
pub const LEGACY_PRIORITY_LITERAL: &str = "#pri";

/// Inclusive range of recognized priority digits.
pub const PRIORITY_MIN: u8 = 1;
pub const PRIORITY_MAX: u8 = 5;

/// Separator between a leading ticket-number link and the tag region.
pub const LINK_SEPARATOR: &str = ". ";

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M";

/// True when the token has the marker-plus-body shape of a tag.
#[must_use]
pub fn is_tag_shaped(token: &str) -> bool {
    token.len() > 1 && token.starts_with(TAG_MARKER)
}

/// Classify a status token.
#[must_use]
pub fn status_of(token: &str) -> Option<Status> {
    match token {
        OPEN_LITERAL => Some(Status::Open),
        CLOSED_LITERAL => Some(Status::Closed),
        _ => None,
    }
}

/// True for the bare scheduled marker (the date suffix lives outside the
/// token; see [`measure_scheduled_suffix`]).
#[must_use]
pub fn is_scheduled_marker(token: &str) -> bool {
    token == SCHEDULED_LITERAL
}

/// Classify a priority token: bare marker or marker plus one digit in
/// [`PRIORITY_MIN`]..=[`PRIORITY_MAX`].
#[must_use]
pub fn priority_of(token: &str) -> Option<Priority> {
    if token == PRIORITY_LITERAL {
        return Some(Priority::Default);
    }
    let digits = token.strip_prefix(PRIORITY_LITERAL)?;
    let level: u8 = digits.parse().ok()?;
    ((PRIORITY_MIN..=PRIORITY_MAX).contains(&level)).then_some(Priority::Level(level))
}

/// Current-vocabulary literal for a legacy token, if the token is legacy.
///
/// `#pri3` keeps its digit; an out-of-range digit disqualifies the token.
#[must_use]
pub fn legacy_upgrade(token: &str) -> Option<String> {
    match token {
        LEGACY_OPEN_LITERAL => return Some(OPEN_LITERAL.to_owned()),
        LEGACY_CLOSED_LITERAL => return Some(CLOSED_LITERAL.to_owned()),
        LEGACY_SCHEDULED_LITERAL => return Some(SCHEDULED_LITERAL.to_owned()),
        LEGACY_PRIORITY_LITERAL => return Some(PRIORITY_LITERAL.to_owned()),
        _ => {}
    }
    let digits = token.strip_prefix(LEGACY_PRIORITY_LITERAL)?;
    let level: u8 = digits.parse().ok()?;
    ((PRIORITY_MIN..=PRIORITY_MAX).contains(&level)).then(|| format!("{PRIORITY_LITERAL}{level}"))
}

/// Measured date/time suffix of a scheduled tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduledSuffix {
    /// The suffix exactly as typed, e.g. `2026-9-1 10:30`. Empty for a bare
    /// scheduled tag.
    pub raw: String,
    /// Parsed send time; midnight when only a date was given.
    pub at: Option<NaiveDateTime>,
    /// UTF-16 units the suffix adds to the token's effective length,
    /// including the separating spaces.
    pub extra_units: usize,
    /// True when a date-shaped field followed the marker but failed to
    /// parse. The field is not absorbed; callers log and move on.
    pub malformed: bool,
}

/// Re-measure a scheduled token's effective length.
///
/// `rest` is the body text immediately after the token's annotation. Scans
/// forward for up to two whitespace-delimited fields, absorbing the first
/// only if it parses as a date and the second only if it parses as a time.
/// Malformed trailing fields are never absorbed.
#[must_use]
pub fn measure_scheduled_suffix(rest: &str) -> ScheduledSuffix {
    let mut suffix = ScheduledSuffix::default();
    let Some((date_field, after_date)) = next_field(rest) else {
        return suffix;
    };
    let Ok(date) = NaiveDate::parse_from_str(date_field, DATE_FORMAT) else {
        suffix.malformed = is_date_shaped(date_field);
        return suffix;
    };

    suffix.raw.push_str(date_field);
    suffix.extra_units = 1 + utf16_len(date_field);
    suffix.at = Some(date.and_time(NaiveTime::MIN));

    if let Some((time_field, _)) = next_field(after_date) {
        if let Ok(time) = NaiveTime::parse_from_str(time_field, TIME_FORMAT) {
            suffix.raw.push(' ');
            suffix.raw.push_str(time_field);
            suffix.extra_units += 1 + utf16_len(time_field);
            suffix.at = Some(date.and_time(time));
        }
    }
    suffix
}

/// One whitespace-delimited field after a single separating space.
///
/// Returns the field and the remaining text after it. `None` when `rest`
/// does not start with exactly one space followed by a non-space character.
fn next_field(rest: &str) -> Option<(&str, &str)> {
    let after_space = rest.strip_prefix(' ')?;
    let field_end = after_space
        .find(char::is_whitespace)
        .unwrap_or(after_space.len());
    if field_end == 0 {
        return None;
    }
    Some((&after_space[..field_end], &after_space[field_end..]))
}

/// Heuristic for "the user meant this as a date": distinguishes a typo'd
/// date (worth a malformed warning) from ordinary prose after the marker.
#[must_use]
pub fn is_date_shaped(field: &str) -> bool {
    field.contains('-') && field.starts_with(|c: char| c.is_ascii_digit())
}
