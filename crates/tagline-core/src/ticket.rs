//! The decoded, mutable in-memory representation of one ticket's tags.
//!
//! A `TicketState` is constructed fresh from a message on every read and
//! never persisted; its only identity is "the tags currently present in one
//! message". The dispatch layer mutates it in memory, then serializes it
//! back into the message's tag region.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::grammar;

/// Explicit ticket status. A missing status tag is legal and distinct from
/// both variants; see [`TicketState::is_open`] for how routing treats it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Open,
    Closed,
}

impl Status {
    /// The tag literal for this status.
    #[must_use]
    pub const fn literal(self) -> &'static str {
        match self {
            Self::Open => grammar::OPEN_LITERAL,
            Self::Closed => grammar::CLOSED_LITERAL,
        }
    }
}

/// Ticket priority: the bare marker (channel default) or an explicit digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Default,
    Level(u8),
}

impl Priority {
    /// The tag literal for this priority.
    #[must_use]
    pub fn literal(self) -> String {
        match self {
            Self::Default => grammar::PRIORITY_LITERAL.to_owned(),
            Self::Level(level) => format!("{}{level}", grammar::PRIORITY_LITERAL),
        }
    }

    /// Rank for duplicate resolution: lowest digit wins, bare marker loses
    /// to any explicit digit.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Level(level) => level,
            Self::Default => grammar::PRIORITY_MAX + 1,
        }
    }
}

/// Deferred-send marker decoded from a scheduled tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scheduled {
    /// Date/time suffix exactly as typed; empty for a bare scheduled tag.
    pub raw: String,
    /// Parsed send time, when the suffix parsed.
    pub at: Option<NaiveDateTime>,
}

impl Scheduled {
    #[must_use]
    pub fn new(raw: impl Into<String>, at: Option<NaiveDateTime>) -> Self {
        Self { raw: raw.into(), at }
    }

    /// Full literal including the suffix, for duplicate comparison.
    #[must_use]
    pub fn full_literal(&self) -> String {
        if self.raw.is_empty() {
            grammar::SCHEDULED_LITERAL.to_owned()
        } else {
            format!("{} {}", grammar::SCHEDULED_LITERAL, self.raw)
        }
    }

    /// True when the send time has passed as of `now`.
    #[must_use]
    pub fn past_due(&self, now: NaiveDateTime) -> bool {
        self.at.is_some_and(|at| at <= now)
    }
}

/// One-shot note queued for the ticket's discussion thread after a state
/// change, e.g. a forced reassignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentNote {
    pub text: String,
}

/// The decoded ticket: every service tag slot plus the leftover free-form
/// tags. User tags are ordered; the first entry is the assignee, the rest
/// are followers, and that order survives rewrites.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TicketState {
    pub scheduled: Option<Scheduled>,
    pub status: Option<Status>,
    pub user_tags: Vec<String>,
    pub priority: Option<Priority>,
    pub other_tags: Vec<String>,
    pub comment: Option<CommentNote>,
}

impl TicketState {
    /// Routing treats a missing status as open; only an explicit closed tag
    /// stops forwarding. The raw slot stays observable via `status`.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        !matches!(self.status, Some(Status::Closed))
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self.status, Some(Status::Closed))
    }

    /// True while a scheduled tag is present, regardless of its send time.
    #[must_use]
    pub const fn is_scheduled(&self) -> bool {
        self.scheduled.is_some()
    }

    #[must_use]
    pub fn assignee(&self) -> Option<&str> {
        self.user_tags.first().map(String::as_str)
    }

    #[must_use]
    pub fn followers(&self) -> &[String] {
        self.user_tags.get(1..).unwrap_or_default()
    }

    /// Make `tag` the assignee, preserving the rest of the user-tag order.
    /// A tag already in the list is moved to the front, not duplicated.
    pub fn assign(&mut self, tag: &str) {
        self.user_tags.retain(|t| t != tag);
        self.user_tags.insert(0, tag.to_owned());
    }

    /// Append `tag` as a follower unless already listed.
    pub fn add_follower(&mut self, tag: &str) {
        if !self.user_tags.iter().any(|t| t == tag) {
            self.user_tags.push(tag.to_owned());
        }
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = Some(priority);
    }

    pub fn close(&mut self) {
        self.status = Some(Status::Closed);
    }

    pub fn reopen(&mut self) {
        self.status = Some(Status::Open);
    }

    /// Toggle between open and closed; a missing status counts as open.
    pub fn toggle_status(&mut self) {
        if self.is_closed() {
            self.reopen();
        } else {
            self.close();
        }
    }

    pub fn schedule(&mut self, scheduled: Scheduled) {
        self.scheduled = Some(scheduled);
    }

    pub fn clear_schedule(&mut self) {
        self.scheduled = None;
    }

    /// Effective priority digit for routing: an explicit digit wins, a bare
    /// marker or missing slot falls back to the channel default.
    #[must_use]
    pub fn priority_digit(&self, channel_default: Option<u8>) -> Option<u8> {
        match self.priority {
            Some(Priority::Level(level)) => Some(level),
            Some(Priority::Default) | None => channel_default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_status_routes_as_open() {
        let state = TicketState::default();
        assert!(state.is_open());
        assert!(!state.is_closed());
        assert_eq!(state.status, None);
    }

    #[test]
    fn assignee_is_first_user_tag() {
        let mut state = TicketState::default();
        state.add_follower("#aa");
        state.add_follower("#bb");
        assert_eq!(state.assignee(), Some("#aa"));
        assert_eq!(state.followers(), ["#bb"]);
    }

    #[test]
    fn assign_moves_existing_follower_to_front() {
        let mut state = TicketState {
            user_tags: vec!["#aa".into(), "#bb".into(), "#cc".into()],
            ..TicketState::default()
        };
        state.assign("#cc");
        assert_eq!(state.user_tags, ["#cc", "#aa", "#bb"]);
    }

    #[test]
    fn toggle_from_missing_status_closes() {
        let mut state = TicketState::default();
        state.toggle_status();
        assert!(state.is_closed());
        state.toggle_status();
        assert_eq!(state.status, Some(Status::Open));
    }

    #[test]
    fn priority_digit_prefers_explicit_level() {
        let mut state = TicketState::default();
        assert_eq!(state.priority_digit(Some(2)), Some(2));
        state.set_priority(Priority::Default);
        assert_eq!(state.priority_digit(Some(2)), Some(2));
        state.set_priority(Priority::Level(4));
        assert_eq!(state.priority_digit(Some(2)), Some(4));
        assert_eq!(TicketState::default().priority_digit(None), None);
    }

    #[test]
    fn priority_rank_orders_bare_marker_last() {
        assert!(Priority::Level(1).rank() < Priority::Level(5).rank());
        assert!(Priority::Level(5).rank() < Priority::Default.rank());
    }

    #[test]
    fn scheduled_literal_includes_suffix() {
        let bare = Scheduled::default();
        assert_eq!(bare.full_literal(), "#s");
        let dated = Scheduled::new("2026-9-1 10:30", None);
        assert_eq!(dated.full_literal(), "#s 2026-9-1 10:30");
    }
}
