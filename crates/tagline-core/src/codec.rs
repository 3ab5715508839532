//! Tag codec: end-to-end extract/insert/rearrange/deduplicate/decorate
//! pipeline over one message.
//!
//! Decoding scans the message's tag annotations in reverse so the rightmost
//! occurrence wins slot ties (priority resolves lowest-digit instead), then
//! applies channel defaulting, free-form fallback, follower promotion, and
//! assignee repair before optionally cutting the recognized tags out of the
//! text. Encoding renders the canonical tag sequence back into the tag
//! region. All text surgery is computed fully in memory; nothing here talks
//! to the network.

use chrono::NaiveDateTime;
use tracing::{debug, warn};

use crate::directory::Directory;
use crate::entity::{self, Annotation, AnnotationKind, RichText, byte_of_utf16, span_text, utf16_len};
use crate::error::{CodecError, ErrorCode};
use crate::grammar::{self, ScheduledSuffix};
use crate::ticket::{CommentNote, Priority, Scheduled, Status, TicketState};

/// Behavior switches for one decode pass.
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    /// Cut recognized tag-line tags out of the text (the rewrite path).
    /// When unset the tags are left untouched and only recorded.
    pub cut_found: bool,
    /// Apply the channel's configured default `(user, priority)` pair to
    /// tickets missing a status.
    pub insert_defaults: bool,
    /// Reassign when the assignee is no longer an active member.
    pub repair_assignee: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            cut_found: false,
            insert_defaults: true,
            repair_assignee: true,
        }
    }
}

/// Channel-scoped inputs a decode pass needs.
///
/// Assembled by the dispatch layer from the store and config so the codec
/// itself never touches persistence.
pub struct DecodeContext<'a> {
    pub channel: String,
    pub directory: &'a dyn Directory,
    /// The channel's configured default `(user tag, priority digit)`.
    pub channel_default: Option<(String, u8)>,
    /// Users historically assigned in this channel, most recent first.
    pub historically_assigned: Vec<String>,
    /// Recognize and upgrade the legacy tag vocabulary.
    pub legacy_window: bool,
}

/// Where each decoded tag sits in the annotation list.
///
/// Named optional fields instead of parallel index variables: which
/// annotation was matched and what it means stay type-checked together.
#[derive(Debug, Clone, Default)]
pub struct TagLocations {
    pub scheduled: Option<ScheduledLocation>,
    pub status: Option<(usize, Status)>,
    pub priority: Option<(usize, Priority)>,
    /// `(annotation index, token)` in reading order; first is the assignee.
    pub users: Vec<(usize, String)>,
    /// Tag-shaped annotations outside the tag region, in reading order.
    pub free: Vec<(usize, String)>,
}

/// A matched scheduled tag plus its measured date/time suffix.
#[derive(Debug, Clone)]
pub struct ScheduledLocation {
    pub index: usize,
    pub suffix: ScheduledSuffix,
}

/// One canonical tag to re-insert: the annotated token plus an optional
/// plain-text suffix (the scheduled date).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagInsertion {
    pub token: String,
    pub suffix: Option<String>,
}

impl TagInsertion {
    fn bare(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            suffix: None,
        }
    }
}

/// Decode one message into its ticket state.
///
/// Mutates `rich` in place: legacy tokens are upgraded, and when
/// `opts.cut_found` is set the recognized tag line is removed from the text.
pub fn decode(
    rich: &mut RichText,
    ctx: &DecodeContext<'_>,
    opts: DecodeOptions,
) -> Result<TicketState, CodecError> {
    if ctx.legacy_window {
        upgrade_legacy(rich)?;
    }

    let region = find_tag_region(rich, ctx);
    let locations = locate_tags(rich, ctx, region.as_ref())?;
    let mut free = locations.free.clone();

    let mut state = TicketState::default();
    if let Some((_, status)) = locations.status {
        state.status = Some(status);
    }
    if let Some(loc) = &locations.scheduled {
        if loc.suffix.malformed {
            warn!(
                code = ErrorCode::MalformedScheduledTag.code(),
                channel = %ctx.channel,
                "scheduled tag suffix did not parse; decoding as bare"
            );
        }
        state.scheduled = Some(Scheduled::new(loc.suffix.raw.clone(), loc.suffix.at));
    }
    if let Some((_, priority)) = locations.priority {
        state.priority = Some(priority);
    }
    state.user_tags = locations.users.iter().map(|(_, t)| t.clone()).collect();

    if opts.insert_defaults {
        apply_channel_default(&mut state, ctx);
    }
    promote_free_slots(&mut state, &mut free);
    promote_followers(&mut state, &mut free, ctx);
    if opts.repair_assignee {
        repair_assignee(&mut state, ctx);
    }
    state.other_tags = free.into_iter().map(|(_, t)| t).collect();

    if opts.cut_found {
        if let Some(region) = &region {
            cut_tag_region(rich, region)?;
        }
    }
    Ok(state)
}

/// Render the canonical tag sequence: scheduled, status, users, priority.
#[must_use]
pub fn encode(state: &TicketState) -> Vec<TagInsertion> {
    let mut out = Vec::new();
    if let Some(scheduled) = &state.scheduled {
        out.push(TagInsertion {
            token: grammar::SCHEDULED_LITERAL.to_owned(),
            suffix: (!scheduled.raw.is_empty()).then(|| scheduled.raw.clone()),
        });
    }
    if let Some(status) = state.status {
        out.push(TagInsertion::bare(status.literal()));
    }
    for user in &state.user_tags {
        out.push(TagInsertion::bare(user.clone()));
    }
    if let Some(priority) = state.priority {
        out.push(TagInsertion::bare(priority.literal()));
    }
    out
}

/// Insert the canonical tag sequence at the start of the tag region.
///
/// The region starts at offset 0 unless the text begins with a leading link
/// annotation (the ticket-number link), in which case insertion starts after
/// the link plus its separator literal.
pub fn insert_tags(rich: &mut RichText, insertions: &[TagInsertion]) -> Result<(), CodecError> {
    let pos = tag_region_start(rich);
    // Right-to-left at a fixed position: each earlier piece pushes the later
    // ones over and picks up its separating space from the trailing-space
    // rule, even when the region starts at end-of-text.
    for insertion in insertions.iter().rev() {
        if let Some(suffix) = &insertion.suffix {
            insert_piece(rich, suffix, None, pos)?;
        }
        insert_piece(rich, &insertion.token, Some(AnnotationKind::Tag), pos)?;
    }
    Ok(())
}

/// Remove free-text duplicates of the canonical status/priority/scheduled
/// values, so re-inserting the canonical set never renders the same
/// information twice. Applied before insertion when tags were left in place.
pub fn dedup_matching_tags(rich: &mut RichText, state: &TicketState) -> Result<(), CodecError> {
    let status_literal = state.status.map(Status::literal);
    let priority_literal = state.priority.map(Priority::literal);

    let mut to_cut = Vec::new();
    for index in 0..rich.annotations.len() {
        if rich.annotations[index].kind != AnnotationKind::Tag {
            continue;
        }
        let token = token_text(rich, index)?;
        let matches_scheduled = state.scheduled.as_ref().is_some_and(|scheduled| {
            grammar::is_scheduled_marker(&token) && suffix_at(rich, index).raw == scheduled.raw
        });
        if status_literal == Some(token.as_str())
            || priority_literal.as_deref() == Some(token.as_str())
            || matches_scheduled
        {
            to_cut.push(index);
        }
    }
    for index in to_cut.into_iter().rev() {
        cut_annotation(rich, index)?;
    }
    Ok(())
}

/// Apply or refresh strikethrough decoration.
///
/// A past-due scheduled date gets a strikethrough spanning exactly the date
/// text; a closed ticket's leading ticket-number link gets one over the
/// number. Existing decorations over the same span are removed and recreated
/// rather than stacked, so the pass is idempotent and reversible.
pub fn decorate(
    rich: &mut RichText,
    state: &TicketState,
    now: NaiveDateTime,
) -> Result<(), CodecError> {
    if let Some(span) = scheduled_date_span(rich)? {
        let past_due = state.scheduled.as_ref().is_some_and(|s| s.past_due(now));
        set_strikethrough(rich, span, past_due);
    }
    let leading_link = rich
        .annotations
        .iter()
        .find(|a| a.kind == AnnotationKind::Link && a.offset == 0)
        .map(|a| (0, a.length));
    if let Some(span) = leading_link {
        set_strikethrough(rich, span, state.is_closed());
    }
    Ok(())
}

/// UTF-16 offset where the canonical tag region starts.
#[must_use]
pub fn tag_region_start(rich: &RichText) -> usize {
    let start = match rich.annotations.first() {
        Some(a) if a.kind == AnnotationKind::Link && a.offset == 0 => {
            a.length + utf16_len(grammar::LINK_SEPARATOR)
        }
        _ => 0,
    };
    start.min(utf16_len(&rich.body))
}

// ---------------------------------------------------------------------------
// Decode internals
// ---------------------------------------------------------------------------

struct TagRegion {
    indices: Vec<usize>,
}

/// Locate the annotations belonging to the message's tag region: the
/// canonical leading run of recognized tags plus the trailing tag line.
fn find_tag_region(rich: &RichText, ctx: &DecodeContext<'_>) -> Option<TagRegion> {
    let mut indices = leading_run(rich, ctx);
    if let Some(line) = trailing_tag_line(rich, ctx) {
        for index in line {
            if !indices.contains(&index) {
                indices.push(index);
            }
        }
    }
    (!indices.is_empty()).then_some(TagRegion { indices })
}

/// Contiguous recognized tags from the start of the tag region; the run
/// ends at the first token that is not a covered tag annotation (or an
/// absorbed scheduled date field).
fn leading_run(rich: &RichText, ctx: &DecodeContext<'_>) -> Vec<usize> {
    let start = tag_region_start(rich);
    let Some(start_byte) = byte_of_utf16(&rich.body, start) else {
        return Vec::new();
    };
    let by_offset = tag_offsets(rich);

    let mut indices = Vec::new();
    let mut skip_until = 0;
    for (offset, token) in line_tokens(&rich.body[start_byte..], start) {
        if offset < skip_until {
            continue;
        }
        let Some(&index) = by_offset.get(&offset) else {
            break;
        };
        let ann = &rich.annotations[index];
        if span_text(&rich.body, ann.offset, ann.length) != Some(token)
            || !is_recognized(token, ctx)
        {
            break;
        }
        if grammar::is_scheduled_marker(token) {
            skip_until = ann.end() + suffix_at(rich, index).extra_units;
        }
        indices.push(index);
    }
    indices
}

/// The trailing line when it consists solely of recognized service tags.
///
/// Date/time fields absorbed by a scheduled tag belong to the line; a
/// date-shaped field that failed to parse is tolerated (still a tag line)
/// but never absorbed into a cut span. Any other stray text means there is
/// no tag line.
fn trailing_tag_line(rich: &RichText, ctx: &DecodeContext<'_>) -> Option<Vec<usize>> {
    let body = &rich.body;
    let line_start_byte = body.rfind('\n').map_or(0, |b| b + 1);
    let line = &body[line_start_byte..];
    if line.trim().is_empty() {
        return None;
    }
    let line_start = utf16_len(&body[..line_start_byte]);
    let by_offset = tag_offsets(rich);

    let mut indices = Vec::new();
    let mut skip_until = 0;
    let mut tolerate_at = None;
    for (offset, token) in line_tokens(line, line_start) {
        if offset < skip_until {
            continue;
        }
        let Some(&index) = by_offset.get(&offset) else {
            // One malformed date-shaped field right after a scheduled
            // marker does not break the line; it is just not absorbed.
            if tolerate_at == Some(offset) && grammar::is_date_shaped(token) {
                tolerate_at = None;
                continue;
            }
            return None;
        };
        let ann = &rich.annotations[index];
        if span_text(body, ann.offset, ann.length) != Some(token) || !is_recognized(token, ctx) {
            return None;
        }
        if grammar::is_scheduled_marker(token) {
            skip_until = ann.end() + suffix_at(rich, index).extra_units;
            tolerate_at = Some(ann.end() + 1);
        }
        indices.push(index);
    }
    (!indices.is_empty()).then_some(indices)
}

fn tag_offsets(rich: &RichText) -> std::collections::HashMap<usize, usize> {
    rich.annotations
        .iter()
        .enumerate()
        .filter(|(_, ann)| ann.kind == AnnotationKind::Tag)
        .map(|(index, ann)| (ann.offset, index))
        .collect()
}

fn is_recognized(token: &str, ctx: &DecodeContext<'_>) -> bool {
    grammar::status_of(token).is_some()
        || grammar::priority_of(token).is_some()
        || grammar::is_scheduled_marker(token)
        || ctx.directory.is_user_tag(token, &ctx.channel)
}

/// Whitespace-delimited tokens of `line` with their UTF-16 offsets.
fn line_tokens(line: &str, line_start: usize) -> Vec<(usize, &str)> {
    let mut tokens = Vec::new();
    let mut units = line_start;
    let mut token_start = None;
    let mut start_byte = 0;
    for (byte, ch) in line.char_indices() {
        if ch.is_whitespace() {
            if let Some(start) = token_start.take() {
                tokens.push((start, &line[start_byte..byte]));
            }
        } else if token_start.is_none() {
            token_start = Some(units);
            start_byte = byte;
        }
        units += ch.len_utf16();
    }
    if let Some(start) = token_start {
        tokens.push((start, &line[start_byte..]));
    }
    tokens
}

/// Reverse scan classifying every tag annotation into slots.
fn locate_tags(
    rich: &RichText,
    ctx: &DecodeContext<'_>,
    region: Option<&TagRegion>,
) -> Result<TagLocations, CodecError> {
    let mut locations = TagLocations::default();
    let mut priorities: Vec<(usize, Priority)> = Vec::new();

    for index in (0..rich.annotations.len()).rev() {
        if rich.annotations[index].kind != AnnotationKind::Tag {
            continue;
        }
        let token = token_text(rich, index)?;
        let in_region = region.is_some_and(|r| r.indices.contains(&index));
        if !in_region {
            if grammar::is_tag_shaped(&token) {
                locations.free.insert(0, (index, token));
            }
            continue;
        }

        if let Some(status) = grammar::status_of(&token) {
            // Rightmost occurrence wins; earlier duplicates are still part
            // of the region and get cut with it.
            if locations.status.is_none() {
                locations.status = Some((index, status));
            }
        } else if grammar::is_scheduled_marker(&token) {
            if locations.scheduled.is_none() {
                locations.scheduled = Some(ScheduledLocation {
                    index,
                    suffix: suffix_at(rich, index),
                });
            }
        } else if let Some(priority) = grammar::priority_of(&token) {
            priorities.push((index, priority));
        } else if ctx.directory.is_user_tag(&token, &ctx.channel) {
            if !locations.users.iter().any(|(_, t)| *t == token) {
                locations.users.insert(0, (index, token));
            }
        } else {
            locations.free.insert(0, (index, token));
        }
    }

    // Lowest digit wins across all priority occurrences; the bare marker
    // only wins when no numbered tag exists.
    if let Some(&(index, priority)) = priorities.iter().min_by_key(|(_, p)| p.rank()) {
        locations.priority = Some((index, priority));
    }
    Ok(locations)
}

fn apply_channel_default(state: &mut TicketState, ctx: &DecodeContext<'_>) {
    let Some((user, _)) = &ctx.channel_default else {
        return;
    };
    if state.status.is_some() || state.scheduled.is_some() {
        return;
    }
    let assignee_missing = state.assignee().is_none();
    let priority_missing = state.priority.is_none();
    if !assignee_missing && !priority_missing {
        // Fully specified; defaulting would only add noise.
        return;
    }
    state.status = Some(Status::Open);
    if assignee_missing {
        state.user_tags.insert(0, user.clone());
    }
    if priority_missing {
        state.priority = Some(Priority::Default);
    }
    debug!(channel = %ctx.channel, "applied channel default to status-less ticket");
}

/// Promote free-text priority/status tokens into still-empty slots.
fn promote_free_slots(state: &mut TicketState, free: &mut Vec<(usize, String)>) {
    if state.priority.is_none() {
        let best = free
            .iter()
            .enumerate()
            .filter_map(|(i, (_, token))| grammar::priority_of(token).map(|p| (i, p)))
            .min_by_key(|&(_, p)| p.rank());
        if let Some((i, priority)) = best {
            state.priority = Some(priority);
            free.remove(i);
        }
    }
    if state.status.is_none() {
        if let Some(i) = free
            .iter()
            .position(|(_, token)| grammar::status_of(token).is_some())
        {
            state.status = grammar::status_of(&free[i].1);
            free.remove(i);
        }
    }
}

/// Append free-text workspace tags as followers; tags of ex-members are
/// silently left as free text.
fn promote_followers(
    state: &mut TicketState,
    free: &mut Vec<(usize, String)>,
    ctx: &DecodeContext<'_>,
) {
    free.retain(|(_, token)| {
        if !ctx.directory.is_user_tag(token, &ctx.channel) {
            return true;
        }
        if state.user_tags.iter().any(|t| t == token) {
            return true;
        }
        if ctx.directory.is_active_member(token, &ctx.channel) {
            state.user_tags.push(token.clone());
            false
        } else {
            debug!(channel = %ctx.channel, %token, "workspace tag no longer active; not promoted");
            true
        }
    });
}

/// Replace an assignee who is no longer an active member.
///
/// Candidate order: channel default user, then the historically-assigned
/// list, then followers in list order. A note naming the replacement is
/// queued for the discussion thread; with no valid candidate the slot is
/// cleared instead.
fn repair_assignee(state: &mut TicketState, ctx: &DecodeContext<'_>) {
    let Some(assignee) = state.assignee().map(ToOwned::to_owned) else {
        return;
    };
    if ctx.directory.is_active_member(&assignee, &ctx.channel) {
        return;
    }

    let mut from_default = false;
    let mut candidate = ctx.channel_default.as_ref().and_then(|(user, _)| {
        ctx.directory
            .is_active_member(user, &ctx.channel)
            .then(|| user.clone())
    });
    if candidate.is_some() {
        from_default = true;
    }
    if candidate.is_none() {
        candidate = ctx
            .historically_assigned
            .iter()
            .find(|user| {
                *user != &assignee && ctx.directory.is_active_member(user, &ctx.channel)
            })
            .cloned();
    }
    if candidate.is_none() {
        candidate = state
            .followers()
            .iter()
            .find(|user| ctx.directory.is_active_member(user, &ctx.channel))
            .cloned();
    }

    match candidate {
        Some(next) => {
            state.user_tags.remove(0);
            state.assign(&next);
            // Pin the default pair's digit unless an explicit one is set;
            // a bare marker means "channel default" and may be sharpened.
            if from_default && !matches!(state.priority, Some(Priority::Level(_))) {
                if let Some((_, digit)) = ctx.channel_default.as_ref() {
                    state.priority = Some(Priority::Level(*digit));
                }
            }
            warn!(channel = %ctx.channel, old = %assignee, new = %next, "reassigned invalid assignee");
            state.comment = Some(CommentNote {
                text: format!("Reassigned to {next}: {assignee} is no longer a workspace member"),
            });
        }
        None => {
            warn!(channel = %ctx.channel, old = %assignee, "invalid assignee and no candidate; clearing");
            state.user_tags.remove(0);
        }
    }
}

// ---------------------------------------------------------------------------
// Text surgery helpers
// ---------------------------------------------------------------------------

fn token_text(rich: &RichText, index: usize) -> Result<String, CodecError> {
    let ann = rich
        .annotations
        .get(index)
        .ok_or(CodecError::IndexOutOfRange {
            index,
            count: rich.annotations.len(),
        })?;
    let total = utf16_len(&rich.body);
    if ann.end() > total {
        return Err(CodecError::SpanOutOfBounds {
            offset: ann.offset,
            length: ann.length,
            text_units: total,
        });
    }
    span_text(&rich.body, ann.offset, ann.length)
        .map(ToOwned::to_owned)
        .ok_or(CodecError::SurrogateSplit { offset: ann.offset })
}

/// Measured date/time suffix after the annotation at `index`.
fn suffix_at(rich: &RichText, index: usize) -> ScheduledSuffix {
    let Some(ann) = rich.annotations.get(index) else {
        return ScheduledSuffix::default();
    };
    let Some(after) = byte_of_utf16(&rich.body, ann.end()) else {
        return ScheduledSuffix::default();
    };
    grammar::measure_scheduled_suffix(&rich.body[after..])
}

fn upgrade_legacy(rich: &mut RichText) -> Result<(), CodecError> {
    for index in (0..rich.annotations.len()).rev() {
        if rich.annotations[index].kind != AnnotationKind::Tag {
            continue;
        }
        let token = token_text(rich, index)?;
        if let Some(current) = grammar::legacy_upgrade(&token) {
            debug!(from = %token, to = %current, "upgrading legacy tag");
            replace_token(rich, index, &current)?;
        }
    }
    Ok(())
}

/// Rewrite the token covered by annotation `index` in place, shifting later
/// annotations by the length difference.
fn replace_token(rich: &mut RichText, index: usize, new_token: &str) -> Result<(), CodecError> {
    let ann = rich
        .annotations
        .get(index)
        .cloned()
        .ok_or(CodecError::IndexOutOfRange {
            index,
            count: rich.annotations.len(),
        })?;
    let start_byte = byte_of_utf16(&rich.body, ann.offset)
        .ok_or(CodecError::SurrogateSplit { offset: ann.offset })?;
    let end_byte = byte_of_utf16(&rich.body, ann.end())
        .ok_or(CodecError::SpanOutOfBounds {
            offset: ann.offset,
            length: ann.length,
            text_units: utf16_len(&rich.body),
        })?;

    let mut body = String::with_capacity(rich.body.len() + new_token.len());
    body.push_str(&rich.body[..start_byte]);
    body.push_str(new_token);
    body.push_str(&rich.body[end_byte..]);
    rich.body = body;

    let new_units = utf16_len(new_token);
    let delta = isize::try_from(new_units).unwrap_or(isize::MAX)
        - isize::try_from(ann.length).unwrap_or(isize::MAX);
    let old_end = ann.end();
    entity::shift(&mut rich.annotations, delta, old_end);
    rich.annotations[index].length = new_units;
    Ok(())
}

/// Cut every annotation of the tag region in descending index order, then
/// strip the residue: spaces left at the region start and an emptied
/// trailing line with its newline.
fn cut_tag_region(rich: &mut RichText, region: &TagRegion) -> Result<(), CodecError> {
    let mut indices = region.indices.clone();
    indices.sort_unstable();
    for index in indices.into_iter().rev() {
        cut_annotation(rich, index)?;
    }
    strip_region_head_spaces(rich);
    strip_empty_trailing_line(rich);
    Ok(())
}

/// Each cut leaves one space behind; at the head of the tag region those
/// spaces would accumulate across rewrite passes, so drop them.
fn strip_region_head_spaces(rich: &mut RichText) {
    let start = tag_region_start(rich);
    let Some(start_byte) = byte_of_utf16(&rich.body, start) else {
        return;
    };
    let run = rich.body[start_byte..]
        .chars()
        .take_while(|&c| c == ' ')
        .count();
    if run == 0 {
        return;
    }
    rich.body.replace_range(start_byte..start_byte + run, "");
    entity::shift(
        &mut rich.annotations,
        -isize::try_from(run).unwrap_or(isize::MAX),
        start,
    );
}

/// Cut a single annotation, extending a scheduled marker's span over its
/// measured date/time suffix so the date leaves with the tag.
fn cut_annotation(rich: &mut RichText, index: usize) -> Result<(), CodecError> {
    let mut annotations = rich.annotations.clone();
    let ann = annotations.get_mut(index).ok_or(CodecError::IndexOutOfRange {
        index,
        count: rich.annotations.len(),
    })?;
    if ann.kind == AnnotationKind::Tag
        && span_text(&rich.body, ann.offset, ann.length)
            .is_some_and(grammar::is_scheduled_marker)
    {
        ann.length += suffix_at(rich, index).extra_units;
    }
    let (body, out) = entity::cut(&rich.body, &annotations, index)?;
    rich.body = body;
    rich.annotations = out;
    Ok(())
}

/// Remove a trailing line that cutting reduced to bare spaces, along with
/// the single newline that introduced it.
fn strip_empty_trailing_line(rich: &mut RichText) {
    let line_start = rich.body.rfind('\n').map_or(0, |b| b + 1);
    let line = &rich.body[line_start..];
    if line.is_empty() || !line.chars().all(|c| c == ' ') {
        return;
    }
    rich.body.truncate(line_start);
    if rich.body.ends_with('\n') {
        rich.body.pop();
    }
}

fn insert_piece(
    rich: &mut RichText,
    literal: &str,
    kind: Option<AnnotationKind>,
    position: usize,
) -> Result<(), CodecError> {
    let (body, annotations) = match kind {
        Some(kind) => entity::insert(&rich.body, &rich.annotations, literal, kind, position)?,
        None => entity::insert_plain(&rich.body, &rich.annotations, literal, position)?,
    };
    rich.body = body;
    rich.annotations = annotations;
    Ok(())
}

/// Span of the date/time text of the first scheduled tag, if it has one.
fn scheduled_date_span(rich: &RichText) -> Result<Option<(usize, usize)>, CodecError> {
    for index in 0..rich.annotations.len() {
        if rich.annotations[index].kind != AnnotationKind::Tag {
            continue;
        }
        if grammar::is_scheduled_marker(&token_text(rich, index)?) {
            let suffix = suffix_at(rich, index);
            if suffix.raw.is_empty() {
                return Ok(None);
            }
            let start = rich.annotations[index].end() + 1;
            return Ok(Some((start, utf16_len(&suffix.raw))));
        }
    }
    Ok(None)
}

/// Ensure exactly zero or one strikethrough over `span`, never stacked.
fn set_strikethrough(rich: &mut RichText, span: (usize, usize), wanted: bool) {
    let (offset, length) = span;
    rich.annotations.retain(|a| {
        !(a.kind == AnnotationKind::Strikethrough && a.offset == offset && a.length == length)
    });
    if wanted {
        rich.annotations
            .push(Annotation::new(AnnotationKind::Strikethrough, offset, length));
        rich.annotations.sort_by_key(|a| a.offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    struct TestDirectory {
        known: Vec<&'static str>,
        active: Vec<&'static str>,
    }

    impl TestDirectory {
        fn of(active: &[&'static str]) -> Self {
            Self {
                known: active.to_vec(),
                active: active.to_vec(),
            }
        }

        fn with_departed(mut self, departed: &[&'static str]) -> Self {
            self.known.extend_from_slice(departed);
            self
        }
    }

    impl Directory for TestDirectory {
        fn is_user_tag(&self, tag: &str, _channel: &str) -> bool {
            self.known.contains(&tag)
        }

        fn is_active_member(&self, tag: &str, _channel: &str) -> bool {
            self.active.contains(&tag)
        }

        fn list_active_members(&self, _channel: &str) -> Vec<String> {
            self.active.iter().map(|&t| t.to_owned()).collect()
        }
    }

    /// Annotate every `#token` the way the platform's hashtag entity would.
    fn rich(text: &str) -> RichText {
        let mut annotations = Vec::new();
        let mut units = 0;
        let mut token: Option<(usize, usize)> = None;
        for ch in text.chars() {
            if ch.is_whitespace() {
                if let Some((offset, len)) = token.take() {
                    annotations.push(Annotation::new(AnnotationKind::Tag, offset, len));
                }
            } else if let Some((_, len)) = &mut token {
                *len += ch.len_utf16();
            } else if ch == grammar::TAG_MARKER {
                token = Some((units, ch.len_utf16()));
            }
            units += ch.len_utf16();
        }
        if let Some((offset, len)) = token {
            annotations.push(Annotation::new(AnnotationKind::Tag, offset, len));
        }
        RichText::new(text, annotations)
    }

    fn ctx<'a>(directory: &'a TestDirectory) -> DecodeContext<'a> {
        DecodeContext {
            channel: "main".to_owned(),
            directory,
            channel_default: None,
            historically_assigned: Vec::new(),
            legacy_window: false,
        }
    }

    fn cut_opts() -> DecodeOptions {
        DecodeOptions {
            cut_found: true,
            ..DecodeOptions::default()
        }
    }

    fn noon(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .expect("date")
            .and_hms_opt(12, 0, 0)
            .expect("time")
    }

    #[test]
    fn status_precedence_keeps_one_open_tag() {
        let dir = TestDirectory::of(&["#aa", "#bb"]);
        let mut message = rich("task text\n#o #o #aa #bb #p1 #o");
        let state = decode(&mut message, &ctx(&dir), cut_opts()).expect("decode");
        assert_eq!(state.status, Some(Status::Open));
        assert_eq!(state.user_tags, ["#aa", "#bb"]);
        assert_eq!(state.priority, Some(Priority::Level(1)));
        assert_eq!(message.body, "task text");
        assert!(message.annotations.is_empty());

        insert_tags(&mut message, &encode(&state)).expect("insert");
        assert_eq!(message.body, "#o #aa #bb #p1 task text");
        assert_eq!(message.body.matches("#o").count(), 1);
    }

    #[test]
    fn duplicate_priorities_resolve_lowest_digit() {
        let dir = TestDirectory::of(&[]);
        let mut message = rich("text\n#p2 #p3 #p1");
        let state = decode(&mut message, &ctx(&dir), cut_opts()).expect("decode");
        assert_eq!(state.priority, Some(Priority::Level(1)));
        assert_eq!(message.body, "text");
    }

    #[test]
    fn bare_priority_loses_to_numbered() {
        let dir = TestDirectory::of(&[]);
        let mut message = rich("text\n#p #p4");
        let state = decode(&mut message, &ctx(&dir), cut_opts()).expect("decode");
        assert_eq!(state.priority, Some(Priority::Level(4)));
    }

    #[test]
    fn legacy_closed_marker_migrates_once() {
        let dir = TestDirectory::of(&[]);
        let mut context = ctx(&dir);
        context.legacy_window = true;
        let mut message = rich("fix the thing\n#done");
        let state = decode(&mut message, &context, cut_opts()).expect("decode");
        assert_eq!(state.status, Some(Status::Closed));
        assert_eq!(message.body, "fix the thing");

        insert_tags(&mut message, &encode(&state)).expect("insert");
        assert_eq!(message.body, "#x fix the thing");
        assert!(!message.body.contains("#done"));
    }

    #[test]
    fn legacy_priority_keeps_digit() {
        let dir = TestDirectory::of(&[]);
        let mut context = ctx(&dir);
        context.legacy_window = true;
        let mut message = rich("text\n#pri2");
        let state = decode(&mut message, &context, cut_opts()).expect("decode");
        assert_eq!(state.priority, Some(Priority::Level(2)));
    }

    #[test]
    fn legacy_tokens_ignored_outside_window() {
        let dir = TestDirectory::of(&[]);
        let mut message = rich("text\n#done");
        let state = decode(&mut message, &ctx(&dir), cut_opts()).expect("decode");
        assert_eq!(state.status, None);
        // Not a recognized tag, so the line is not a tag line and stays put.
        assert_eq!(message.body, "text\n#done");
    }

    #[test]
    fn free_text_tags_promote_without_a_tag_line() {
        let dir = TestDirectory::of(&["#aa"]);
        let mut message = rich("ticket #aa #p2");
        let state = decode(&mut message, &ctx(&dir), cut_opts()).expect("decode");
        assert_eq!(state.priority, Some(Priority::Level(2)));
        assert_eq!(state.user_tags, ["#aa"]);
        assert_eq!(state.status, None);
        assert!(state.is_open());
        // Nothing was on a tag line, so the text is untouched.
        assert_eq!(message.body, "ticket #aa #p2");
    }

    #[test]
    fn decode_without_cut_leaves_text_untouched() {
        let dir = TestDirectory::of(&["#aa"]);
        let mut message = rich("task\n#o #aa");
        let before = message.clone();
        let state = decode(&mut message, &ctx(&dir), DecodeOptions::default()).expect("decode");
        assert_eq!(state.status, Some(Status::Open));
        assert_eq!(message, before);
    }

    #[test]
    fn channel_default_fills_missing_half_only() {
        let dir = TestDirectory::of(&["#bb"]);
        let mut context = ctx(&dir);
        context.channel_default = Some(("#bb".to_owned(), 1));
        let mut message = rich("hello\n#p2");
        let state = decode(&mut message, &context, cut_opts()).expect("decode");
        assert_eq!(state.status, Some(Status::Open));
        assert_eq!(state.assignee(), Some("#bb"));
        assert_eq!(state.priority, Some(Priority::Level(2)));
    }

    #[test]
    fn fully_specified_ticket_skips_defaulting() {
        let dir = TestDirectory::of(&["#aa", "#bb"]);
        let mut context = ctx(&dir);
        context.channel_default = Some(("#bb".to_owned(), 1));
        let mut message = rich("hello\n#aa #p2");
        let state = decode(&mut message, &context, cut_opts()).expect("decode");
        assert_eq!(state.status, None);
        assert_eq!(state.assignee(), Some("#aa"));
    }

    #[test]
    fn scheduled_ticket_skips_defaulting() {
        let dir = TestDirectory::of(&["#bb"]);
        let mut context = ctx(&dir);
        context.channel_default = Some(("#bb".to_owned(), 1));
        let mut message = rich("hello\n#s 2030-1-1");
        let state = decode(&mut message, &context, cut_opts()).expect("decode");
        assert_eq!(state.status, None);
        assert!(state.is_scheduled());
        assert!(state.user_tags.is_empty());
    }

    #[test]
    fn scheduled_suffix_is_parsed_and_cut() {
        let dir = TestDirectory::of(&[]);
        let mut message = rich("do it\n#s 2026-9-1 10:30");
        let state = decode(&mut message, &ctx(&dir), cut_opts()).expect("decode");
        let scheduled = state.scheduled.expect("scheduled");
        assert_eq!(scheduled.raw, "2026-9-1 10:30");
        assert_eq!(scheduled.at, Some(noon(2026, 9, 1).date().and_hms_opt(10, 30, 0).expect("t")));
        assert_eq!(message.body, "do it");
    }

    #[test]
    fn malformed_scheduled_suffix_decodes_bare() {
        let dir = TestDirectory::of(&[]);
        let mut message = rich("do\n#s 2026-99-1");
        let state = decode(&mut message, &ctx(&dir), cut_opts()).expect("decode");
        let scheduled = state.scheduled.expect("scheduled");
        assert_eq!(scheduled.raw, "");
        assert_eq!(scheduled.at, None);
        // The malformed field is not absorbed; it stays in the text.
        assert!(message.body.contains("2026-99-1"));
        assert!(!message.body.contains("#s"));
    }

    #[test]
    fn departed_member_tag_is_not_promoted() {
        let dir = TestDirectory::of(&["#aa"]).with_departed(&["#zz"]);
        let mut message = rich("cc #zz on this");
        let state = decode(&mut message, &ctx(&dir), cut_opts()).expect("decode");
        assert!(state.user_tags.is_empty());
        assert_eq!(state.other_tags, ["#zz"]);
    }

    #[test]
    fn invalid_assignee_repairs_to_channel_default() {
        let dir = TestDirectory::of(&["#bb"]).with_departed(&["#cc"]);
        let mut context = ctx(&dir);
        context.channel_default = Some(("#bb".to_owned(), 1));
        let mut message = rich("fix\n#cc");
        let state = decode(&mut message, &context, cut_opts()).expect("decode");
        assert_eq!(state.assignee(), Some("#bb"));
        assert_eq!(state.priority, Some(Priority::Level(1)));
        let note = state.comment.expect("comment");
        assert!(note.text.contains("#bb"));
        assert!(note.text.contains("#cc"));
    }

    #[test]
    fn repair_keeps_existing_priority() {
        let dir = TestDirectory::of(&["#bb"]).with_departed(&["#cc"]);
        let mut context = ctx(&dir);
        context.channel_default = Some(("#bb".to_owned(), 1));
        let mut message = rich("fix\n#cc #p3");
        let state = decode(&mut message, &context, cut_opts()).expect("decode");
        assert_eq!(state.priority, Some(Priority::Level(3)));
    }

    #[test]
    fn repair_falls_back_to_history_then_followers() {
        let dir = TestDirectory::of(&["#dd", "#ee"]).with_departed(&["#cc"]);
        let mut context = ctx(&dir);
        context.historically_assigned = vec!["#dd".to_owned()];
        let mut message = rich("fix\n#cc #ee");
        let state = decode(&mut message, &context, cut_opts()).expect("decode");
        assert_eq!(state.assignee(), Some("#dd"));
        assert_eq!(state.followers(), ["#ee"]);
    }

    #[test]
    fn repair_without_candidates_clears_assignee() {
        let dir = TestDirectory::of(&[]).with_departed(&["#cc"]);
        let mut message = rich("fix\n#cc");
        let state = decode(&mut message, &ctx(&dir), cut_opts()).expect("decode");
        assert!(state.user_tags.is_empty());
        assert!(state.comment.is_none());
    }

    #[test]
    fn insertion_lands_after_leading_link() {
        let mut message = RichText::new(
            "№42. broken build",
            vec![Annotation::new(AnnotationKind::Link, 0, 3)],
        );
        let mut state = TicketState::default();
        state.reopen();
        insert_tags(&mut message, &encode(&state)).expect("insert");
        assert_eq!(message.body, "№42. #o broken build");
        let tag = message
            .annotations
            .iter()
            .find(|a| a.kind == AnnotationKind::Tag)
            .expect("tag");
        assert_eq!(span_text(&message.body, tag.offset, tag.length), Some("#o"));
    }

    #[test]
    fn insert_at_end_of_text_spaces_correctly() {
        let mut message = RichText::default();
        let mut state = TicketState::default();
        state.reopen();
        state.add_follower("#aa");
        state.set_priority(Priority::Level(2));
        insert_tags(&mut message, &encode(&state)).expect("insert");
        assert_eq!(message.body, "#o #aa #p2");
    }

    #[test]
    fn dedup_removes_exact_free_text_matches() {
        let dir = TestDirectory::of(&["#aa"]);
        let mut message = rich("please #p2 this ticket #aa");
        let state = decode(&mut message, &ctx(&dir), DecodeOptions::default()).expect("decode");
        assert_eq!(state.priority, Some(Priority::Level(2)));
        dedup_matching_tags(&mut message, &state).expect("dedup");
        assert!(!message.body.contains("#p2"));
        // User mentions in prose are kept.
        assert!(message.body.contains("#aa"));
    }

    #[test]
    fn decorate_strikes_past_due_date_once() {
        let dir = TestDirectory::of(&[]);
        let mut message = rich("pay rent\n#s 2020-1-1");
        let state = decode(&mut message, &ctx(&dir), DecodeOptions::default()).expect("decode");
        let now = noon(2026, 8, 28);
        decorate(&mut message, &state, now).expect("decorate");
        decorate(&mut message, &state, now).expect("decorate");
        let strikes: Vec<_> = message
            .annotations
            .iter()
            .filter(|a| a.kind == AnnotationKind::Strikethrough)
            .collect();
        assert_eq!(strikes.len(), 1);
        assert_eq!(
            span_text(&message.body, strikes[0].offset, strikes[0].length),
            Some("2020-1-1")
        );
    }

    #[test]
    fn repeated_rewrites_keep_decoration_in_bounds() {
        // The second pass cuts through a message decorated by the first;
        // the stale strikethrough must leave with the cut suffix instead of
        // dangling past the shortened body.
        let dir = TestDirectory::of(&[]);
        let now = noon(2026, 8, 28);
        let mut message = rich("pay rent\n#s 2020-1-1");
        for _ in 0..2 {
            let state = decode(&mut message, &ctx(&dir), cut_opts()).expect("decode");
            insert_tags(&mut message, &encode(&state)).expect("insert");
            decorate(&mut message, &state, now).expect("decorate");
        }
        assert_eq!(message.body, "#s 2020-1-1 pay rent");
        for ann in &message.annotations {
            assert!(
                span_text(&message.body, ann.offset, ann.length).is_some(),
                "annotation out of bounds: {ann:?}"
            );
        }
        let strikes: Vec<_> = message
            .annotations
            .iter()
            .filter(|a| a.kind == AnnotationKind::Strikethrough)
            .collect();
        assert_eq!(strikes.len(), 1);
        assert_eq!(
            span_text(&message.body, strikes[0].offset, strikes[0].length),
            Some("2020-1-1")
        );
    }

    #[test]
    fn decorate_leaves_future_date_alone() {
        let dir = TestDirectory::of(&[]);
        let mut message = rich("later\n#s 2030-1-1");
        let state = decode(&mut message, &ctx(&dir), DecodeOptions::default()).expect("decode");
        decorate(&mut message, &state, noon(2026, 8, 28)).expect("decorate");
        assert!(
            message
                .annotations
                .iter()
                .all(|a| a.kind != AnnotationKind::Strikethrough)
        );
    }

    #[test]
    fn decorate_strikes_closed_ticket_number() {
        let mut message = RichText::new(
            "№7. done already #x",
            vec![
                Annotation::new(AnnotationKind::Link, 0, 2),
                Annotation::new(AnnotationKind::Tag, 17, 2),
            ],
        );
        let mut state = TicketState::default();
        state.close();
        decorate(&mut message, &state, noon(2026, 8, 28)).expect("decorate");
        let strike = message
            .annotations
            .iter()
            .find(|a| a.kind == AnnotationKind::Strikethrough)
            .expect("strike");
        assert_eq!((strike.offset, strike.length), (0, 2));

        // Reopening removes the decoration instead of stacking a second one.
        state.reopen();
        decorate(&mut message, &state, noon(2026, 8, 28)).expect("decorate");
        assert!(
            message
                .annotations
                .iter()
                .all(|a| a.kind != AnnotationKind::Strikethrough)
        );
    }

    #[test]
    fn round_trip_preserves_state() {
        let dir = TestDirectory::of(&["#aa", "#bb"]);
        let mut message = rich("fix the widget\n#s 2030-2-3 9:15 #o #aa #bb #p3");
        let first = decode(&mut message, &ctx(&dir), cut_opts()).expect("decode");
        insert_tags(&mut message, &encode(&first)).expect("insert");

        let mut reparsed = message.clone();
        let second = decode(&mut reparsed, &ctx(&dir), cut_opts()).expect("decode");
        assert_eq!(first, second);
        assert_eq!(reparsed.body, "fix the widget");
    }
}
