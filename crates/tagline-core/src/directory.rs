//! Membership/workspace directory interface and its TTL cache.
//!
//! The directory answers two different questions about a token: "is this a
//! user tag at all" (classification — true even for members who have left)
//! and "does it belong to an active member" (validity). Conflating the two
//! would make an ex-member's tag decode as free text and defeat the
//! assignee-repair flow.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Read-only view of the chat platform's member/workspace-tag directory.
pub trait Directory: Send + Sync {
    /// The token is (or was) a member tag in this channel's workspace.
    fn is_user_tag(&self, tag: &str, channel: &str) -> bool;

    /// The token belongs to a currently active workspace member.
    fn is_active_member(&self, tag: &str, channel: &str) -> bool;

    /// Tags of all currently active members visible from the channel.
    fn list_active_members(&self, channel: &str) -> Vec<String>;
}

impl<D: Directory + ?Sized> Directory for std::sync::Arc<D> {
    fn is_user_tag(&self, tag: &str, channel: &str) -> bool {
        (**self).is_user_tag(tag, channel)
    }

    fn is_active_member(&self, tag: &str, channel: &str) -> bool {
        (**self).is_active_member(tag, channel)
    }

    fn list_active_members(&self, channel: &str) -> Vec<String> {
        (**self).list_active_members(channel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ProbeKind {
    UserTag,
    ActiveMember,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProbeKey {
    kind: ProbeKind,
    tag: String,
    channel: String,
}

#[derive(Debug, Clone, Copy)]
struct CachedProbe {
    value: bool,
    fetched_at: Instant,
}

/// TTL-bounded memoization of directory probes.
///
/// Decoding one message probes the same tags repeatedly (classification,
/// promotion, repair); the underlying directory is a remote lookup. Entries
/// expire after the configured TTL; `list_active_members` passes through
/// uncached since it is only hit on explicit membership sweeps.
pub struct CachedDirectory<D> {
    inner: D,
    ttl: Duration,
    probes: Mutex<HashMap<ProbeKey, CachedProbe>>,
}

impl<D: Directory> CachedDirectory<D> {
    pub fn new(inner: D, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            probes: Mutex::new(HashMap::new()),
        }
    }

    /// Drop all cached probes, forcing fresh lookups.
    pub fn invalidate(&self) {
        self.lock_probes().clear();
    }

    fn lock_probes(&self) -> std::sync::MutexGuard<'_, HashMap<ProbeKey, CachedProbe>> {
        self.probes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn probe(&self, key: ProbeKey, fetch: impl FnOnce() -> bool) -> bool {
        let now = Instant::now();
        let mut probes = self.lock_probes();
        if let Some(cached) = probes.get(&key) {
            if now.duration_since(cached.fetched_at) < self.ttl {
                return cached.value;
            }
        }
        let value = fetch();
        probes.insert(
            key,
            CachedProbe {
                value,
                fetched_at: now,
            },
        );
        value
    }
}

impl<D: Directory> Directory for CachedDirectory<D> {
    fn is_user_tag(&self, tag: &str, channel: &str) -> bool {
        self.probe(
            ProbeKey {
                kind: ProbeKind::UserTag,
                tag: tag.to_owned(),
                channel: channel.to_owned(),
            },
            || self.inner.is_user_tag(tag, channel),
        )
    }

    fn is_active_member(&self, tag: &str, channel: &str) -> bool {
        self.probe(
            ProbeKey {
                kind: ProbeKind::ActiveMember,
                tag: tag.to_owned(),
                channel: channel.to_owned(),
            },
            || self.inner.is_active_member(tag, channel),
        )
    }

    fn list_active_members(&self, channel: &str) -> Vec<String> {
        self.inner.list_active_members(channel)
    }
}
