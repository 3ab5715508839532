//! Copy/ticket bookkeeping behind the dispatch engine.
//!
//! The engine only needs a handful of lookups: which copies exist for a
//! main message, where the discussion thread lives, the channel's routing
//! table and default pair, and who has been assigned before. `MemoryStore`
//! backs tests; `JsonFileStore` persists the same state as schema-versioned
//! JSON written atomically (temp file then rename).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

const STORE_SCHEMA_VERSION: u32 = 1;

/// A message addressed by channel and per-channel id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub channel: String,
    pub message_id: i64,
}

impl MessageRef {
    #[must_use]
    pub fn new(channel: impl Into<String>, message_id: i64) -> Self {
        Self {
            channel: channel.into(),
            message_id,
        }
    }
}

/// Bookkeeping for one forwarded copy of a main ticket message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopiedMessageRef {
    pub main: MessageRef,
    pub copy: MessageRef,
}

/// One `(assignee, priority) -> destination` routing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub user: String,
    pub priority: u8,
    pub destination: String,
}

/// Destination lookup keyed by assignee tag and priority digit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    rules: Vec<RoutingRule>,
}

impl RoutingTable {
    /// Add or replace the rule for `(user, priority)`.
    pub fn insert(
        &mut self,
        user: impl Into<String>,
        priority: u8,
        destination: impl Into<String>,
    ) {
        let user = user.into();
        let destination = destination.into();
        self.rules
            .retain(|rule| !(rule.user == user && rule.priority == priority));
        self.rules.push(RoutingRule {
            user,
            priority,
            destination,
        });
    }

    #[must_use]
    pub fn destination(&self, user: &str, priority: u8) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.user == user && rule.priority == priority)
            .map(|rule| rule.destination.as_str())
    }
}

/// Everything the dispatch engine reads and writes about tickets.
pub trait TicketStore: Send + Sync {
    fn get_copy(&self, main: &MessageRef, destination: &str) -> Result<Option<CopiedMessageRef>>;
    fn put_copy(&self, copied: CopiedMessageRef) -> Result<()>;
    fn delete_copy(&self, copy_channel: &str, copy_message_id: i64) -> Result<()>;
    fn list_copies(&self, main: &MessageRef) -> Result<Vec<CopiedMessageRef>>;

    /// Discussion-thread anchor for a main message, if one was created.
    fn get_discussion(&self, main: &MessageRef) -> Result<Option<MessageRef>>;

    /// Assignees seen in this channel, most recent first.
    fn get_users_historically_assigned(&self, channel: &str) -> Result<Vec<String>>;
    fn record_assignment(&self, channel: &str, user: &str) -> Result<()>;

    fn get_channel_routing(&self, channel: &str) -> Result<RoutingTable>;
    fn get_channel_default(&self, channel: &str) -> Result<Option<(String, u8)>>;

    /// Per-recipient storage destination for scheduled-ticket previews.
    fn get_preview_channel(&self, user_tag: &str) -> Result<Option<String>>;
}

impl<S: TicketStore + ?Sized> TicketStore for std::sync::Arc<S> {
    fn get_copy(&self, main: &MessageRef, destination: &str) -> Result<Option<CopiedMessageRef>> {
        (**self).get_copy(main, destination)
    }

    fn put_copy(&self, copied: CopiedMessageRef) -> Result<()> {
        (**self).put_copy(copied)
    }

    fn delete_copy(&self, copy_channel: &str, copy_message_id: i64) -> Result<()> {
        (**self).delete_copy(copy_channel, copy_message_id)
    }

    fn list_copies(&self, main: &MessageRef) -> Result<Vec<CopiedMessageRef>> {
        (**self).list_copies(main)
    }

    fn get_discussion(&self, main: &MessageRef) -> Result<Option<MessageRef>> {
        (**self).get_discussion(main)
    }

    fn get_users_historically_assigned(&self, channel: &str) -> Result<Vec<String>> {
        (**self).get_users_historically_assigned(channel)
    }

    fn record_assignment(&self, channel: &str, user: &str) -> Result<()> {
        (**self).record_assignment(channel, user)
    }

    fn get_channel_routing(&self, channel: &str) -> Result<RoutingTable> {
        (**self).get_channel_routing(channel)
    }

    fn get_channel_default(&self, channel: &str) -> Result<Option<(String, u8)>> {
        (**self).get_channel_default(channel)
    }

    fn get_preview_channel(&self, user_tag: &str) -> Result<Option<String>> {
        (**self).get_preview_channel(user_tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DiscussionEntry {
    main: MessageRef,
    thread: MessageRef,
}

/// The serializable state both store implementations share.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreState {
    schema_version: u32,
    copies: Vec<CopiedMessageRef>,
    discussions: Vec<DiscussionEntry>,
    #[serde(default)]
    assignment_history: HashMap<String, Vec<String>>,
    #[serde(default)]
    routing: HashMap<String, RoutingTable>,
    #[serde(default)]
    channel_defaults: HashMap<String, (String, u8)>,
    #[serde(default)]
    preview_channels: HashMap<String, String>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            schema_version: STORE_SCHEMA_VERSION,
            copies: Vec::new(),
            discussions: Vec::new(),
            assignment_history: HashMap::new(),
            routing: HashMap::new(),
            channel_defaults: HashMap::new(),
            preview_channels: HashMap::new(),
        }
    }
}

impl StoreState {
    fn get_copy(&self, main: &MessageRef, destination: &str) -> Option<CopiedMessageRef> {
        self.copies
            .iter()
            .find(|c| c.main == *main && c.copy.channel == destination)
            .cloned()
    }

    fn put_copy(&mut self, copied: CopiedMessageRef) {
        // Idempotent insert keyed on (main, destination channel).
        self.copies
            .retain(|c| !(c.main == copied.main && c.copy.channel == copied.copy.channel));
        self.copies.push(copied);
    }

    fn delete_copy(&mut self, copy_channel: &str, copy_message_id: i64) {
        self.copies
            .retain(|c| !(c.copy.channel == copy_channel && c.copy.message_id == copy_message_id));
    }

    fn record_assignment(&mut self, channel: &str, user: &str) {
        let history = self.assignment_history.entry(channel.to_owned()).or_default();
        history.retain(|u| u != user);
        history.insert(0, user.to_owned());
    }
}

/// In-memory store used by tests and one-shot runs.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_channel_routing(&self, channel: impl Into<String>, table: RoutingTable) {
        self.lock().routing.insert(channel.into(), table);
    }

    pub fn set_channel_default(&self, channel: impl Into<String>, user: impl Into<String>, priority: u8) {
        self.lock()
            .channel_defaults
            .insert(channel.into(), (user.into(), priority));
    }

    pub fn set_preview_channel(&self, user_tag: impl Into<String>, channel: impl Into<String>) {
        self.lock()
            .preview_channels
            .insert(user_tag.into(), channel.into());
    }

    pub fn set_discussion(&self, main: MessageRef, thread: MessageRef) {
        self.lock().discussions.push(DiscussionEntry { main, thread });
    }
}

impl TicketStore for MemoryStore {
    fn get_copy(&self, main: &MessageRef, destination: &str) -> Result<Option<CopiedMessageRef>> {
        Ok(self.lock().get_copy(main, destination))
    }

    fn put_copy(&self, copied: CopiedMessageRef) -> Result<()> {
        self.lock().put_copy(copied);
        Ok(())
    }

    fn delete_copy(&self, copy_channel: &str, copy_message_id: i64) -> Result<()> {
        self.lock().delete_copy(copy_channel, copy_message_id);
        Ok(())
    }

    fn list_copies(&self, main: &MessageRef) -> Result<Vec<CopiedMessageRef>> {
        Ok(self
            .lock()
            .copies
            .iter()
            .filter(|c| c.main == *main)
            .cloned()
            .collect())
    }

    fn get_discussion(&self, main: &MessageRef) -> Result<Option<MessageRef>> {
        Ok(self
            .lock()
            .discussions
            .iter()
            .find(|d| d.main == *main)
            .map(|d| d.thread.clone()))
    }

    fn get_users_historically_assigned(&self, channel: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .assignment_history
            .get(channel)
            .cloned()
            .unwrap_or_default())
    }

    fn record_assignment(&self, channel: &str, user: &str) -> Result<()> {
        self.lock().record_assignment(channel, user);
        Ok(())
    }

    fn get_channel_routing(&self, channel: &str) -> Result<RoutingTable> {
        Ok(self.lock().routing.get(channel).cloned().unwrap_or_default())
    }

    fn get_channel_default(&self, channel: &str) -> Result<Option<(String, u8)>> {
        Ok(self.lock().channel_defaults.get(channel).cloned())
    }

    fn get_preview_channel(&self, user_tag: &str) -> Result<Option<String>> {
        Ok(self.lock().preview_channels.get(user_tag).cloned())
    }
}

/// File-backed store: the whole state as one JSON document, rewritten
/// atomically after every mutation.
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl JsonFileStore {
    /// Open or create the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let state: StoreState = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            if state.schema_version > STORE_SCHEMA_VERSION {
                bail!(
                    "store {} has schema version {} (supported: {})",
                    path.display(),
                    state.schema_version,
                    STORE_SCHEMA_VERSION
                );
            }
            state
        } else {
            debug!(path = %path.display(), "no store file; starting empty");
            StoreState::default()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, state: &StoreState) -> Result<()> {
        let json = serde_json::to_string_pretty(state).context("Failed to serialize store")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    pub fn set_channel_routing(&self, channel: impl Into<String>, table: RoutingTable) -> Result<()> {
        let mut state = self.lock();
        state.routing.insert(channel.into(), table);
        self.persist(&state)
    }

    pub fn set_channel_default(
        &self,
        channel: impl Into<String>,
        user: impl Into<String>,
        priority: u8,
    ) -> Result<()> {
        let mut state = self.lock();
        state
            .channel_defaults
            .insert(channel.into(), (user.into(), priority));
        self.persist(&state)
    }

    pub fn set_preview_channel(
        &self,
        user_tag: impl Into<String>,
        channel: impl Into<String>,
    ) -> Result<()> {
        let mut state = self.lock();
        state
            .preview_channels
            .insert(user_tag.into(), channel.into());
        self.persist(&state)
    }

    pub fn set_discussion(&self, main: MessageRef, thread: MessageRef) -> Result<()> {
        let mut state = self.lock();
        state.discussions.push(DiscussionEntry { main, thread });
        self.persist(&state)
    }
}

impl TicketStore for JsonFileStore {
    fn get_copy(&self, main: &MessageRef, destination: &str) -> Result<Option<CopiedMessageRef>> {
        Ok(self.lock().get_copy(main, destination))
    }

    fn put_copy(&self, copied: CopiedMessageRef) -> Result<()> {
        let mut state = self.lock();
        state.put_copy(copied);
        self.persist(&state)
    }

    fn delete_copy(&self, copy_channel: &str, copy_message_id: i64) -> Result<()> {
        let mut state = self.lock();
        state.delete_copy(copy_channel, copy_message_id);
        self.persist(&state)
    }

    fn list_copies(&self, main: &MessageRef) -> Result<Vec<CopiedMessageRef>> {
        Ok(self
            .lock()
            .copies
            .iter()
            .filter(|c| c.main == *main)
            .cloned()
            .collect())
    }

    fn get_discussion(&self, main: &MessageRef) -> Result<Option<MessageRef>> {
        Ok(self
            .lock()
            .discussions
            .iter()
            .find(|d| d.main == *main)
            .map(|d| d.thread.clone()))
    }

    fn get_users_historically_assigned(&self, channel: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .assignment_history
            .get(channel)
            .cloned()
            .unwrap_or_default())
    }

    fn record_assignment(&self, channel: &str, user: &str) -> Result<()> {
        let mut state = self.lock();
        state.record_assignment(channel, user);
        self.persist(&state)
    }

    fn get_channel_routing(&self, channel: &str) -> Result<RoutingTable> {
        Ok(self.lock().routing.get(channel).cloned().unwrap_or_default())
    }

    fn get_channel_default(&self, channel: &str) -> Result<Option<(String, u8)>> {
        Ok(self.lock().channel_defaults.get(channel).cloned())
    }

    fn get_preview_channel(&self, user_tag: &str) -> Result<Option<String>> {
        Ok(self.lock().preview_channels.get(user_tag).cloned())
    }
}

fn _assert_object_safe(_: &dyn TicketStore) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn copied(main_id: i64, dest: &str, copy_id: i64) -> CopiedMessageRef {
        CopiedMessageRef {
            main: MessageRef::new("main", main_id),
            copy: MessageRef::new(dest, copy_id),
        }
    }

    #[test]
    fn put_copy_is_idempotent_per_destination() {
        let store = MemoryStore::new();
        store.put_copy(copied(1, "dest1", 10)).expect("put");
        store.put_copy(copied(1, "dest1", 11)).expect("put");
        let copies = store.list_copies(&MessageRef::new("main", 1)).expect("list");
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].copy.message_id, 11);
    }

    #[test]
    fn routing_lookup_matches_user_and_priority() {
        let mut table = RoutingTable::default();
        table.insert("#aa", 2, "dest1");
        table.insert("#aa", 1, "urgent");
        assert_eq!(table.destination("#aa", 2), Some("dest1"));
        assert_eq!(table.destination("#aa", 1), Some("urgent"));
        assert_eq!(table.destination("#aa", 3), None);
        assert_eq!(table.destination("#bb", 2), None);
    }

    #[test]
    fn assignment_history_is_most_recent_first() {
        let store = MemoryStore::new();
        store.record_assignment("main", "#aa").expect("record");
        store.record_assignment("main", "#bb").expect("record");
        store.record_assignment("main", "#aa").expect("record");
        assert_eq!(
            store.get_users_historically_assigned("main").expect("get"),
            ["#aa", "#bb"]
        );
    }

    #[test]
    fn json_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tickets.json");
        {
            let store = JsonFileStore::open(&path).expect("open");
            store.put_copy(copied(1, "dest1", 10)).expect("put");
            let mut table = RoutingTable::default();
            table.insert("#aa", 2, "dest1");
            store.set_channel_routing("main", table).expect("routing");
            store.record_assignment("main", "#aa").expect("record");
        }
        let store = JsonFileStore::open(&path).expect("reopen");
        let copies = store.list_copies(&MessageRef::new("main", 1)).expect("list");
        assert_eq!(copies.len(), 1);
        assert_eq!(
            store
                .get_channel_routing("main")
                .expect("routing")
                .destination("#aa", 2),
            Some("dest1")
        );
        assert_eq!(
            store.get_users_historically_assigned("main").expect("get"),
            ["#aa"]
        );
    }

    #[test]
    fn json_store_rejects_newer_schema() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tickets.json");
        std::fs::write(
            &path,
            r#"{"schema_version": 99, "copies": [], "discussions": []}"#,
        )
        .expect("write");
        assert!(JsonFileStore::open(&path).is_err());
    }
}
