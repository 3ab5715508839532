use chrono::NaiveDate;
use proptest::prelude::*;
use tagline_core::entity::{Annotation, AnnotationKind, RichText};
use tagline_core::grammar;
use tagline_core::ticket::{Priority, Scheduled, Status, TicketState};

/// Workspace members the test directory recognizes as active.
pub const KNOWN_USERS: [&str; 4] = ["#aa", "#bb", "#cc", "#dd"];

pub fn arb_status() -> impl Strategy<Value = Option<Status>> + Clone {
    prop_oneof![
        Just(None),
        Just(Some(Status::Open)),
        Just(Some(Status::Closed)),
    ]
}

pub fn arb_priority() -> impl Strategy<Value = Option<Priority>> + Clone {
    prop_oneof![
        Just(None),
        Just(Some(Priority::Default)),
        (1u8..=5).prop_map(|digit| Some(Priority::Level(digit))),
    ]
}

/// Scheduled slot: absent, bare, or a valid non-padded date with optional
/// time, with `at` computed the same way the codec parses it.
pub fn arb_scheduled() -> impl Strategy<Value = Option<Scheduled>> + Clone {
    let dated = (
        2024i32..2032,
        1u32..=12,
        1u32..=28,
        proptest::option::of((0u32..24, 0u32..60)),
    )
        .prop_map(|(year, month, day, time)| {
            let mut raw = format!("{year}-{month}-{day}");
            let date = NaiveDate::from_ymd_opt(year, month, day).expect("valid date");
            let at = match time {
                Some((hour, minute)) => {
                    raw.push_str(&format!(" {hour}:{minute}"));
                    date.and_hms_opt(hour, minute, 0)
                }
                None => date.and_hms_opt(0, 0, 0),
            };
            Some(Scheduled::new(raw, at))
        });
    prop_oneof![Just(None), Just(Some(Scheduled::default())), dated]
}

/// Ordered subset of the known users; the first is the assignee.
pub fn arb_user_tags() -> impl Strategy<Value = Vec<String>> {
    proptest::sample::subsequence(KNOWN_USERS.to_vec(), 0..=KNOWN_USERS.len())
        .prop_map(|users| users.into_iter().map(str::to_owned).collect())
}

/// Render a state onto prose as a trailing tag line, annotating every tag
/// token the way the platform's hashtag entity would.
pub fn render_message(prose: &str, state: &TicketState) -> RichText {
    let mut tags: Vec<String> = Vec::new();
    if let Some(scheduled) = &state.scheduled {
        tags.push(scheduled.full_literal());
    }
    if let Some(status) = state.status {
        tags.push(status.literal().to_owned());
    }
    tags.extend(state.user_tags.iter().cloned());
    if let Some(priority) = state.priority {
        tags.push(priority.literal());
    }

    let mut body = prose.to_owned();
    if !tags.is_empty() {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str(&tags.join(" "));
    }
    annotate_tags(&body)
}

/// Annotate every whitespace-delimited `#token` in `text`.
pub fn annotate_tags(text: &str) -> RichText {
    let mut annotations = Vec::new();
    let mut units = 0;
    let mut token: Option<(usize, usize)> = None;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if let Some((offset, length)) = token.take() {
                annotations.push(Annotation::new(AnnotationKind::Tag, offset, length));
            }
        } else if let Some((_, length)) = &mut token {
            *length += ch.len_utf16();
        } else if ch == grammar::TAG_MARKER {
            token = Some((units, ch.len_utf16()));
        }
        units += ch.len_utf16();
    }
    if let Some((offset, length)) = token {
        annotations.push(Annotation::new(AnnotationKind::Tag, offset, length));
    }
    RichText::new(text, annotations)
}
