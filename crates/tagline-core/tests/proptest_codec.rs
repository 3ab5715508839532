//! Codec round-trip and offset-safety properties.
//!
//! # Test Strategy
//!
//! 1. Generate a `TicketState` (every slot independently present or absent)
//!    and render it onto prose as a trailing tag line.
//! 2. Decode and assert the state is recovered exactly.
//! 3. Decode with cutting, re-encode into the text, decode again, and
//!    assert both decodes agree (the round-trip contract).
//! 4. With prose containing surrogate pairs, run two full
//!    decode/insert/decorate cycles and assert every annotation still
//!    addresses a valid UTF-16 span and no two annotations overlap.

use chrono::NaiveDate;
use proptest::prelude::*;
use tagline_core::codec::{self, DecodeContext, DecodeOptions};
use tagline_core::directory::Directory;
use tagline_core::entity::{AnnotationKind, span_text};
use tagline_core::ticket::TicketState;

// Import generators module
// Since generators.rs is a sibling file in tests/, we use #[path] to include it as a module.
#[path = "generators.rs"]
mod generators;
use generators::*;

struct AllKnown;

impl Directory for AllKnown {
    fn is_user_tag(&self, tag: &str, _channel: &str) -> bool {
        KNOWN_USERS.contains(&tag)
    }

    fn is_active_member(&self, tag: &str, channel: &str) -> bool {
        self.is_user_tag(tag, channel)
    }

    fn list_active_members(&self, _channel: &str) -> Vec<String> {
        KNOWN_USERS.iter().map(|&t| t.to_owned()).collect()
    }
}

static DIRECTORY: AllKnown = AllKnown;

fn ctx() -> DecodeContext<'static> {
    DecodeContext {
        channel: "main".to_owned(),
        directory: &DIRECTORY,
        channel_default: None,
        historically_assigned: Vec::new(),
        legacy_window: false,
    }
}

/// Decode with no policy passes, isolating the structural codec.
const fn plain(cut_found: bool) -> DecodeOptions {
    DecodeOptions {
        cut_found,
        insert_defaults: false,
        repair_assignee: false,
    }
}

fn state_of(
    scheduled: Option<tagline_core::Scheduled>,
    status: Option<tagline_core::Status>,
    user_tags: Vec<String>,
    priority: Option<tagline_core::Priority>,
) -> TicketState {
    TicketState {
        scheduled,
        status,
        user_tags,
        priority,
        other_tags: Vec::new(),
        comment: None,
    }
}

proptest! {
    #![proptest_config(proptest::test_runner::Config::with_cases(512))]

    #[test]
    fn decode_recovers_rendered_state(
        prose in "[a-z ]{0,16}",
        scheduled in arb_scheduled(),
        status in arb_status(),
        users in arb_user_tags(),
        priority in arb_priority(),
    ) {
        let expected = state_of(scheduled, status, users, priority);
        let mut message = render_message(&prose, &expected);
        let decoded = codec::decode(&mut message, &ctx(), plain(false)).unwrap();
        prop_assert_eq!(decoded, expected);
    }

    #[test]
    fn round_trip_preserves_state(
        prose in "[a-z ]{0,16}",
        scheduled in arb_scheduled(),
        status in arb_status(),
        users in arb_user_tags(),
        priority in arb_priority(),
    ) {
        let rendered = state_of(scheduled, status, users, priority);
        let mut message = render_message(&prose, &rendered);
        let first = codec::decode(&mut message, &ctx(), plain(true)).unwrap();
        codec::insert_tags(&mut message, &codec::encode(&first)).unwrap();

        let second = codec::decode(&mut message, &ctx(), plain(true)).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn annotations_stay_in_bounds_and_disjoint_across_rewrites(
        prose in "[a-z ]{0,12}",
        scheduled in arb_scheduled(),
        status in arb_status(),
        users in arb_user_tags(),
        priority in arb_priority(),
    ) {
        let rendered = state_of(scheduled, status, users, priority);
        // Surrogate pairs ahead of the tag line stress the unit arithmetic.
        let mut message = render_message(&format!("e\u{1F600} {prose}"), &rendered);
        let now = NaiveDate::from_ymd_opt(2026, 8, 28)
            .expect("date")
            .and_hms_opt(12, 0, 0)
            .expect("time");

        // Two cycles: the second pass cuts through a decorated message.
        for _ in 0..2 {
            let decoded = codec::decode(&mut message, &ctx(), plain(true)).unwrap();
            codec::insert_tags(&mut message, &codec::encode(&decoded)).unwrap();
            codec::decorate(&mut message, &decoded, now).unwrap();
        }

        for ann in &message.annotations {
            let span = span_text(&message.body, ann.offset, ann.length);
            prop_assert!(span.is_some(), "annotation out of bounds: {ann:?}");
            if ann.kind == AnnotationKind::Tag {
                prop_assert!(span.unwrap().starts_with('#'), "tag span drifted: {ann:?}");
            }
        }
        // The list stays sorted by offset, so adjacency covers all pairs.
        for pair in message.annotations.windows(2) {
            prop_assert!(
                pair[0].end() <= pair[1].offset,
                "annotations overlap: {pair:?}"
            );
        }
    }
}
