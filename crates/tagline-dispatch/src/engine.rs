//! The dispatch engine.
//!
//! Every entry point runs the same shape: take the per-ticket lock, decode
//! the message into a `TicketState`, optionally mutate it, write the
//! canonical tag region back, then reconcile forwarded copies against the
//! resolved target set. The encode/insert step is computed fully in memory
//! before any gateway call, so a failed pass never leaves a half-rewritten
//! message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tracing::{debug, info, warn};

use tagline_core::codec::{self, DecodeContext, DecodeOptions};
use tagline_core::config::ChannelConfig;
use tagline_core::directory::Directory;
use tagline_core::entity::RichText;
use tagline_core::error::CodecError;
use tagline_core::grammar;
use tagline_core::ticket::{Priority, Scheduled, TicketState};

use crate::controls::{CallbackAction, render_controls};
use crate::gateway::MessagingGateway;
use crate::retry::{RetryPolicy, ok_if_missing, ok_if_unchanged, with_retry};
use crate::store::{CopiedMessageRef, MessageRef, TicketStore};

/// A dispatch pass failed. Store and gateway failures abort the single pass
/// they occur in; ticket state for other messages is untouched.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Gateway(#[from] crate::gateway::GatewayError),
    #[error("store failure: {0}")]
    Store(#[source] anyhow::Error),
}

/// Per-ticket critical sections keyed by the main message.
///
/// Concurrent handlers (an edit racing a scheduled flush) serialize on the
/// same slot; different tickets proceed in parallel.
#[derive(Default)]
struct TicketLocks {
    slots: Mutex<HashMap<MessageRef, Arc<Mutex<()>>>>,
}

impl TicketLocks {
    fn slot(&self, ticket: &MessageRef) -> Arc<Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(ticket.clone()).or_default().clone()
    }

    /// Evict the slot once no handler holds a reference to it anymore, so
    /// the map does not grow one entry per ticket ever touched.
    fn release(&self, ticket: &MessageRef) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots
            .get(ticket)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(ticket);
        }
    }
}

pub struct DispatchEngine<G, S, D> {
    gateway: G,
    store: S,
    directory: D,
    config: ChannelConfig,
    retry: RetryPolicy,
    locks: TicketLocks,
}

impl<G: MessagingGateway, S: TicketStore, D: Directory> DispatchEngine<G, S, D> {
    pub fn new(gateway: G, store: S, directory: D, config: ChannelConfig) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            gateway,
            store,
            directory,
            config,
            retry,
            locks: TicketLocks::default(),
        }
    }

    /// Decode a message without rewriting it.
    pub fn decode_ticket(
        &self,
        message: &RichText,
        channel: &str,
    ) -> Result<TicketState, DispatchError> {
        let ctx = self.context(channel)?;
        let mut scratch = message.clone();
        Ok(codec::decode(&mut scratch, &ctx, self.options(false))?)
    }

    /// The read-decode-mutate-encode-write sequence under the ticket lock,
    /// followed by a dispatch pass.
    pub fn apply_and_dispatch(
        &self,
        message: &mut RichText,
        main: &MessageRef,
        mutate: impl FnOnce(&mut TicketState),
    ) -> Result<TicketState, DispatchError> {
        let slot = self.locks.slot(main);
        let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let result = self.apply_locked(message, main, mutate);
        drop(guard);
        drop(slot);
        self.locks.release(main);
        result
    }

    fn apply_locked(
        &self,
        message: &mut RichText,
        main: &MessageRef,
        mutate: impl FnOnce(&mut TicketState),
    ) -> Result<TicketState, DispatchError> {
        let ctx = self.context(&main.channel)?;
        let mut state = codec::decode(message, &ctx, self.options(true))?;
        mutate(&mut state);

        codec::dedup_matching_tags(message, &state)?;
        codec::insert_tags(message, &codec::encode(&state))?;
        codec::decorate(message, &state, Utc::now().naive_utc())?;

        ok_if_unchanged(with_retry(&self.retry, "edit_message_content", || {
            self.gateway
                .edit_message_content(&main.channel, main.message_id, message)
        }))?;
        self.run_dispatch_locked(message, main, &state)?;
        Ok(state)
    }

    /// Reconcile copies for an already-decoded state.
    pub fn run_dispatch(
        &self,
        message: &RichText,
        main: &MessageRef,
        state: &TicketState,
    ) -> Result<(), DispatchError> {
        let slot = self.locks.slot(main);
        let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let result = self.run_dispatch_locked(message, main, state);
        drop(guard);
        drop(slot);
        self.locks.release(main);
        result
    }

    /// Scheduler entry point: once a ticket's send time elapses, clear the
    /// marker and run the ordinary open dispatch.
    pub fn flush_schedule(
        &self,
        message: &mut RichText,
        main: &MessageRef,
    ) -> Result<TicketState, DispatchError> {
        self.apply_and_dispatch(message, main, TicketState::clear_schedule)
    }

    /// Route one UI event to its mutator.
    pub fn handle_callback(
        &self,
        message: &mut RichText,
        main: &MessageRef,
        action: &CallbackAction,
    ) -> Result<TicketState, DispatchError> {
        match action {
            CallbackAction::ToggleStatus => {
                self.apply_and_dispatch(message, main, TicketState::toggle_status)
            }
            CallbackAction::AssignTo { tag } => {
                self.apply_and_dispatch(message, main, |state| state.assign(tag))
            }
            CallbackAction::SetPriority { digit } => {
                let digit = *digit;
                self.apply_and_dispatch(message, main, move |state| {
                    state.set_priority(Priority::Level(digit));
                })
            }
            CallbackAction::SetSchedule { raw } => {
                let scheduled = parse_schedule(raw);
                self.apply_and_dispatch(message, main, move |state| state.schedule(scheduled))
            }
            CallbackAction::ClearSchedule => {
                self.apply_and_dispatch(message, main, TicketState::clear_schedule)
            }
            // Pickers and link-outs are rendered by the UI layer; nothing
            // changes until a concrete selection arrives.
            CallbackAction::PickAssignee
            | CallbackAction::PickPriority
            | CallbackAction::OpenDiscussion => self.decode_ticket(message, &main.channel),
        }
    }

    fn context(&self, channel: &str) -> Result<DecodeContext<'_>, DispatchError> {
        Ok(DecodeContext {
            channel: channel.to_owned(),
            directory: &self.directory,
            channel_default: self
                .store
                .get_channel_default(channel)
                .map_err(DispatchError::Store)?,
            historically_assigned: self
                .store
                .get_users_historically_assigned(channel)
                .map_err(DispatchError::Store)?,
            legacy_window: self.config.legacy_window,
        })
    }

    const fn options(&self, cut_found: bool) -> DecodeOptions {
        DecodeOptions {
            cut_found,
            insert_defaults: self.config.insert_defaults,
            repair_assignee: self.config.repair_assignee,
        }
    }

    fn run_dispatch_locked(
        &self,
        message: &RichText,
        main: &MessageRef,
        state: &TicketState,
    ) -> Result<(), DispatchError> {
        let targets = self.resolve_targets(main, state)?;
        debug!(channel = %main.channel, message_id = main.message_id, ?targets, "dispatch pass");

        // Withdraw copies no longer targeted.
        let existing = self.store.list_copies(main).map_err(DispatchError::Store)?;
        for copied in &existing {
            if targets.iter().any(|t| *t == copied.copy.channel) {
                continue;
            }
            ok_if_missing(with_retry(&self.retry, "delete_message", || {
                self.gateway
                    .delete_message(&copied.copy.channel, copied.copy.message_id)
            }))?;
            self.store
                .delete_copy(&copied.copy.channel, copied.copy.message_id)
                .map_err(DispatchError::Store)?;
            info!(from = %copied.copy.channel, "withdrew ticket copy");
        }

        // Create missing copies, refresh existing ones.
        for destination in &targets {
            match self
                .store
                .get_copy(main, destination)
                .map_err(DispatchError::Store)?
            {
                None => {
                    let copy_id = with_retry(&self.retry, "copy_message", || {
                        self.gateway
                            .copy_message(&main.channel, main.message_id, destination)
                    })?;
                    self.store
                        .put_copy(CopiedMessageRef {
                            main: main.clone(),
                            copy: MessageRef::new(destination.clone(), copy_id),
                        })
                        .map_err(DispatchError::Store)?;
                    info!(to = %destination, "forwarded ticket copy");
                }
                Some(copied) => {
                    ok_if_unchanged(with_retry(&self.retry, "edit_message_content", || {
                        self.gateway.edit_message_content(
                            &copied.copy.channel,
                            copied.copy.message_id,
                            message,
                        )
                    }))?;
                }
            }
        }

        // Controls always reflect the current state.
        let discussion = self.store.get_discussion(main).map_err(DispatchError::Store)?;
        let controls = render_controls(state, discussion.is_some());
        ok_if_unchanged(with_retry(&self.retry, "edit_message_controls", || {
            self.gateway
                .edit_message_controls(&main.channel, main.message_id, &controls)
        }))?;

        // A queued note (e.g. a forced reassignment) goes to the thread.
        if let Some(note) = &state.comment {
            match &discussion {
                Some(thread) => {
                    let content = RichText::new(note.text.clone(), Vec::new());
                    with_retry(&self.retry, "send_message", || {
                        self.gateway.send_message(&thread.channel, &content)
                    })?;
                }
                None => debug!(channel = %main.channel, "no discussion thread for queued note"),
            }
        }

        if state.is_open() && !state.is_scheduled() {
            if let Some(assignee) = state.assignee() {
                self.store
                    .record_assignment(&main.channel, assignee)
                    .map_err(DispatchError::Store)?;
            }
        }
        Ok(())
    }

    /// Target channels for the current state.
    ///
    /// Closed tickets target nothing. Scheduled tickets target each user's
    /// preview destination. Open tickets target the routing-table entry for
    /// `(assignee, effective priority)`; a missing assignee, priority, or
    /// routing entry yields an empty set rather than an error.
    fn resolve_targets(
        &self,
        main: &MessageRef,
        state: &TicketState,
    ) -> Result<Vec<String>, DispatchError> {
        if state.is_closed() {
            return Ok(Vec::new());
        }
        if state.is_scheduled() {
            let mut targets = Vec::new();
            for user in &state.user_tags {
                match self
                    .store
                    .get_preview_channel(user)
                    .map_err(DispatchError::Store)?
                {
                    Some(channel) => targets.push(channel),
                    None => debug!(%user, "no preview destination configured"),
                }
            }
            return Ok(targets);
        }

        let Some(assignee) = state.assignee() else {
            return Ok(Vec::new());
        };
        let routing = self
            .store
            .get_channel_routing(&main.channel)
            .map_err(DispatchError::Store)?;
        let default_digit = self
            .store
            .get_channel_default(&main.channel)
            .map_err(DispatchError::Store)?
            .map(|(_, digit)| digit);
        let Some(digit) = state.priority_digit(default_digit) else {
            return Ok(Vec::new());
        };
        match routing.destination(assignee, digit) {
            Some(destination) => Ok(vec![destination.to_owned()]),
            None => {
                debug!(%assignee, digit, "no routing destination configured");
                Ok(Vec::new())
            }
        }
    }
}

/// Parse picker input into a scheduled slot, falling back to a bare marker
/// when the text does not form a valid date/time.
fn parse_schedule(raw: &str) -> Scheduled {
    let suffix = grammar::measure_scheduled_suffix(&format!(" {raw}"));
    if suffix.raw.is_empty() && !raw.trim().is_empty() {
        warn!(%raw, "schedule input did not parse; storing bare marker");
    }
    Scheduled::new(suffix.raw, suffix.at)
}
