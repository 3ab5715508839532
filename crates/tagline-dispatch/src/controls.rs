//! Control buttons and the typed callback protocol.
//!
//! UI events arrive from the platform as comma-separated callback payloads.
//! A single parser at the boundary turns them into [`CallbackAction`]
//! variants; everything past that point dispatches on the enum, never on
//! string prefixes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use tagline_core::grammar::{PRIORITY_MAX, PRIORITY_MIN};
use tagline_core::ticket::TicketState;

/// Leading field of every callback payload this engine owns.
pub const CALLBACK_PREFIX: &str = "tkt";

/// A UI event decoded from a callback payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackAction {
    /// Flip open/closed.
    ToggleStatus,
    /// Open the assignee picker (no state change yet).
    PickAssignee,
    /// Assign the ticket to a specific member tag.
    AssignTo { tag: String },
    /// Open the priority picker (no state change yet).
    PickPriority,
    /// Set an explicit priority digit.
    SetPriority { digit: u8 },
    /// Set or replace the scheduled date/time, given as typed.
    SetSchedule { raw: String },
    /// Drop the scheduled marker.
    ClearSchedule,
    /// Jump to the ticket's discussion thread (no state change).
    OpenDiscussion,
}

impl fmt::Display for CallbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{CALLBACK_PREFIX},")?;
        match self {
            Self::ToggleStatus => write!(f, "toggle"),
            Self::PickAssignee => write!(f, "pick_assignee"),
            Self::AssignTo { tag } => write!(f, "assign,{tag}"),
            Self::PickPriority => write!(f, "pick_priority"),
            Self::SetPriority { digit } => write!(f, "priority,{digit}"),
            Self::SetSchedule { raw } => write!(f, "schedule,{raw}"),
            Self::ClearSchedule => write!(f, "clear_schedule"),
            Self::OpenDiscussion => write!(f, "discuss"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized callback payload: {payload}")]
pub struct CallbackParseError {
    pub payload: String,
}

impl FromStr for CallbackAction {
    type Err = CallbackParseError;

    fn from_str(payload: &str) -> Result<Self, Self::Err> {
        let fail = || CallbackParseError {
            payload: payload.to_owned(),
        };
        let mut fields = payload.splitn(3, ',');
        if fields.next() != Some(CALLBACK_PREFIX) {
            return Err(fail());
        }
        let kind = fields.next().ok_or_else(fail)?;
        let arg = fields.next();
        match (kind, arg) {
            ("toggle", None) => Ok(Self::ToggleStatus),
            ("pick_assignee", None) => Ok(Self::PickAssignee),
            ("assign", Some(tag)) if !tag.is_empty() => Ok(Self::AssignTo {
                tag: tag.to_owned(),
            }),
            ("pick_priority", None) => Ok(Self::PickPriority),
            ("priority", Some(digit)) => {
                let digit: u8 = digit.parse().map_err(|_| fail())?;
                if (PRIORITY_MIN..=PRIORITY_MAX).contains(&digit) {
                    Ok(Self::SetPriority { digit })
                } else {
                    Err(fail())
                }
            }
            ("schedule", Some(raw)) if !raw.is_empty() => Ok(Self::SetSchedule {
                raw: raw.to_owned(),
            }),
            ("clear_schedule", None) => Ok(Self::ClearSchedule),
            ("discuss", None) => Ok(Self::OpenDiscussion),
            _ => Err(fail()),
        }
    }
}

/// One inline button: what it says and what it sends back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlButton {
    pub label: String,
    pub action: CallbackAction,
}

impl ControlButton {
    fn new(label: impl Into<String>, action: CallbackAction) -> Self {
        Self {
            label: label.into(),
            action,
        }
    }

    /// The payload the platform echoes back when the button is pressed.
    #[must_use]
    pub fn payload(&self) -> String {
        self.action.to_string()
    }
}

/// Derive the button rows purely from the current state.
///
/// The set is fixed: status toggle, assignee picker, priority picker, an
/// unschedule shortcut while scheduled, and a discussion link-out only when
/// a thread mapping exists.
#[must_use]
pub fn render_controls(state: &TicketState, has_discussion: bool) -> Vec<Vec<ControlButton>> {
    let toggle_label = if state.is_closed() { "Reopen" } else { "Close" };
    let mut rows = vec![vec![
        ControlButton::new(toggle_label, CallbackAction::ToggleStatus),
        ControlButton::new("Assign…", CallbackAction::PickAssignee),
        ControlButton::new("Priority…", CallbackAction::PickPriority),
    ]];

    let mut second = Vec::new();
    if state.is_scheduled() {
        second.push(ControlButton::new(
            "Unschedule",
            CallbackAction::ClearSchedule,
        ));
    }
    if has_discussion {
        second.push(ControlButton::new(
            "Discussion",
            CallbackAction::OpenDiscussion,
        ));
    }
    if !second.is_empty() {
        rows.push(second);
    }
    rows
}
