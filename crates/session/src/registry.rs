// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Entity Registry.
//!
//! All tables live behind a single mutex so that an existence check and the
//! `put` that follows it (identity allocation), or a cross-table cascade
//! (session close), are one critical section. The lock is never held across
//! an `.await`; engine calls that may take time run after the relevant
//! entries have been detached from the registry.
//!
//! Process-scoped tables: sessions, local streams, local tracks, renderers,
//! key providers, frame cryptors. Session-scoped tables (remote streams,
//! remote tracks, data channels) live inside each [`SessionEntry`].

use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use indexmap::{IndexMap, IndexSet};
use rtcbridge_core::{BridgeError, Handle, ResourceKind, Result};

use crate::allocator::IdentityAllocator;
use crate::audio_routing::AudioRoutingRef;
use crate::constants::{FIRST_TEXTURE_ID, LOCAL_OWNER_TAG, RETIRED_HANDLE_CAPACITY};
use crate::entities::{
    FrameCryptorEntry, KeyProviderEntry, LocalStreamEntry, LocalTrackEntry, RendererEntry,
    SessionEntry, StreamRef, TrackRef,
};

/// Handle-to-entry map for one resource kind.
///
/// Iteration follows insertion order, which makes "first match" lookups
/// deterministic.
#[derive(Debug)]
pub struct Table<K, V> {
    kind: ResourceKind,
    entries: IndexMap<K, V>,
}

impl<K: Hash + Eq + Display, V> Table<K, V> {
    pub fn new(kind: ResourceKind) -> Self {
        Self { kind, entries: IndexMap::new() }
    }

    pub const fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Inserts or replaces the entry for `key`, returning the previous one.
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        self.entries.insert(key, value)
    }

    pub fn get<Q>(&self, key: &Q) -> Result<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Display + ?Sized,
    {
        self.entries.get(key).ok_or_else(|| BridgeError::not_found(self.kind, key.to_string()))
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Result<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Display + ?Sized,
    {
        let kind = self.kind;
        self.entries.get_mut(key).ok_or_else(|| BridgeError::not_found(kind, key.to_string()))
    }

    /// Removes the entry for `key`. Remaining entries keep their order.
    pub fn remove<Q>(&mut self, key: &Q) -> Result<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Display + ?Sized,
    {
        self.entries
            .shift_remove(key)
            .ok_or_else(|| BridgeError::not_found(self.kind, key.to_string()))
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains_key(key)
    }

    pub fn list(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries.values_mut()
    }

    /// Removes every entry, returning them in insertion order.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        self.entries.drain(..).collect()
    }

    pub fn retain(&mut self, keep: impl FnMut(&K, &mut V) -> bool) {
        self.entries.retain(keep);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Bounded memory of disposed handles.
#[derive(Debug, Default)]
pub struct RetiredSet {
    entries: IndexSet<(ResourceKind, String)>,
}

impl RetiredSet {
    pub fn insert(&mut self, kind: ResourceKind, key: impl Display) {
        self.entries.insert((kind, key.to_string()));
        while self.entries.len() > RETIRED_HANDLE_CAPACITY {
            self.entries.shift_remove_index(0);
        }
    }

    pub fn contains(&self, kind: ResourceKind, key: &str) -> bool {
        self.entries.contains(&(kind, key.to_string()))
    }

    /// True if `key` was retired under any kind.
    pub fn contains_any(&self, key: &str) -> bool {
        self.entries.iter().any(|(_, k)| k == key)
    }
}

/// Entry counts per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub sessions: usize,
    pub local_streams: usize,
    pub local_tracks: usize,
    pub remote_streams: usize,
    pub remote_tracks: usize,
    pub data_channels: usize,
    pub renderers: usize,
    pub key_providers: usize,
    pub frame_cryptors: usize,
}

/// Everything guarded by the registry lock.
#[derive(Debug)]
pub struct RegistryInner {
    pub sessions: Table<Handle, SessionEntry>,
    pub local_streams: Table<Handle, LocalStreamEntry>,
    pub local_tracks: Table<Handle, LocalTrackEntry>,
    pub renderers: Table<i64, RendererEntry>,
    pub key_providers: Table<Handle, KeyProviderEntry>,
    pub frame_cryptors: Table<Handle, FrameCryptorEntry>,
    pub retired: RetiredSet,
    pub audio_routing: AudioRoutingRef,
    /// Handles handed out for entries still being built outside the lock.
    reserved: HashSet<String>,
    allocator: IdentityAllocator,
    next_texture_id: i64,
}

impl RegistryInner {
    /// True if any handle-keyed table (or the retired set) knows `handle`.
    ///
    /// This is the collision check behind identity allocation; it spans every
    /// kind because track and stream lookups scan local and remote tables
    /// together.
    pub fn handle_in_use(&self, handle: &str) -> bool {
        self.sessions.contains(handle)
            || self.local_streams.contains(handle)
            || self.local_tracks.contains(handle)
            || self.key_providers.contains(handle)
            || self.frame_cryptors.contains(handle)
            || self.sessions.values().any(|s| {
                s.remote_streams.contains(handle) || s.remote_tracks.contains(handle)
            })
            || self.reserved.contains(handle)
            || self.retired.contains_any(handle)
    }

    /// Draws a handle no live or retired entry uses.
    ///
    /// The caller must `put` the new entry before releasing the lock.
    pub fn allocate_handle(&self, kind: ResourceKind) -> Result<Handle> {
        self.allocator.allocate(kind, |candidate| self.handle_in_use(candidate))
    }

    /// Allocates a handle for an entry that can only be inserted after an
    /// `.await`. The handle stays unavailable until [`Self::unreserve`].
    pub fn reserve_handle(&mut self, kind: ResourceKind) -> Result<Handle> {
        let handle = self.allocate_handle(kind)?;
        self.reserved.insert(handle.to_string());
        Ok(handle)
    }

    pub fn unreserve(&mut self, handle: &str) {
        self.reserved.remove(handle);
    }

    pub fn allocate_texture_id(&mut self) -> i64 {
        let id = self.next_texture_id;
        self.next_texture_id += 1;
        id
    }

    /// Finds a track by id: local tracks first, then every session's remote
    /// tracks in session creation order.
    pub fn find_track(&self, id: &str) -> Result<TrackRef> {
        if let Ok(entry) = self.local_tracks.get(id) {
            return Ok(TrackRef::Local(entry.clone()));
        }
        self.sessions
            .values()
            .find_map(|session| {
                session.remote_tracks.get(id).ok().map(|entry| TrackRef::Remote {
                    session: session.handle.clone(),
                    entry: entry.clone(),
                })
            })
            .ok_or_else(|| BridgeError::not_found(ResourceKind::MediaTrack, id))
    }

    /// Finds a stream by id.
    ///
    /// With an owner tag naming a session, only that session's remote streams
    /// are searched. Otherwise local streams are searched first, then every
    /// session's remote streams.
    pub fn find_stream(&self, id: &str, owner_tag: Option<&str>) -> Result<StreamRef> {
        match owner_tag {
            Some(tag) if !tag.is_empty() && tag != LOCAL_OWNER_TAG => {
                let session = self.sessions.get(tag)?;
                let entry = session.remote_streams.get(id)?;
                Ok(StreamRef::Remote { session: session.handle.clone(), entry: entry.clone() })
            },
            _ => {
                if let Ok(entry) = self.local_streams.get(id) {
                    return Ok(StreamRef::Local(entry.clone()));
                }
                self.sessions
                    .values()
                    .find_map(|session| {
                        session.remote_streams.get(id).ok().map(|entry| StreamRef::Remote {
                            session: session.handle.clone(),
                            entry: entry.clone(),
                        })
                    })
                    .ok_or_else(|| BridgeError::not_found(ResourceKind::MediaStream, id))
            },
        }
    }

    /// Sessions whose senders (or legacy attached streams) reference `track`.
    pub fn sessions_sending(&self, track: &str) -> Vec<Handle> {
        self.sessions
            .values()
            .filter(|session| {
                session.sender_tracks.values().any(|t| t.as_str() == track)
                    || self.local_streams.values().any(|stream| {
                        stream.attached_to.as_ref() == Some(&session.handle)
                            && stream.tracks.iter().any(|t| t.as_str() == track)
                    })
            })
            .map(|session| session.handle.clone())
            .collect()
    }

    /// Local streams other than `except` that hold `track`.
    pub fn streams_holding(&self, track: &str, except: &str) -> usize {
        self.local_streams
            .values()
            .filter(|s| s.handle.as_str() != except && s.tracks.iter().any(|t| t.as_str() == track))
            .count()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            sessions: self.sessions.len(),
            local_streams: self.local_streams.len(),
            local_tracks: self.local_tracks.len(),
            remote_streams: self.sessions.values().map(|s| s.remote_streams.len()).sum(),
            remote_tracks: self.sessions.values().map(|s| s.remote_tracks.len()).sum(),
            data_channels: self.sessions.values().map(|s| s.data_channels.len()).sum(),
            renderers: self.renderers.len(),
            key_providers: self.key_providers.len(),
            frame_cryptors: self.frame_cryptors.len(),
        }
    }
}

/// Shared registry of every live entity.
#[derive(Debug)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new(audio_routing: AudioRoutingRef, allocator: IdentityAllocator) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                sessions: Table::new(ResourceKind::Session),
                local_streams: Table::new(ResourceKind::MediaStream),
                local_tracks: Table::new(ResourceKind::MediaTrack),
                renderers: Table::new(ResourceKind::Renderer),
                key_providers: Table::new(ResourceKind::KeyProvider),
                frame_cryptors: Table::new(ResourceKind::FrameCryptor),
                retired: RetiredSet::default(),
                audio_routing,
                reserved: HashSet::new(),
                allocator,
                next_texture_id: FIRST_TEXTURE_ID,
            }),
        }
    }

    /// Locks the registry. A poisoned lock is recovered: every mutation
    /// leaves the tables consistent before it can panic.
    pub fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.lock().snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn table_reports_kind_and_handle_on_miss() {
        let mut table: Table<Handle, u32> = Table::new(ResourceKind::MediaStream);
        table.put(Handle::from("a"), 1);
        assert_eq!(*table.get("a").unwrap(), 1);

        let err = table.get("b").unwrap_err();
        assert_eq!(err, BridgeError::not_found(ResourceKind::MediaStream, "b"));
        assert_eq!(table.remove("a").unwrap(), 1);
        assert!(table.remove("a").is_err());
    }

    #[test]
    fn table_keeps_insertion_order_after_remove() {
        let mut table: Table<u32, &str> = Table::new(ResourceKind::DataChannel);
        for (k, v) in [(3, "c"), (1, "a"), (2, "b")] {
            table.put(k, v);
        }
        let _ = table.remove(&1);
        assert_eq!(table.keys().copied().collect::<Vec<_>>(), vec![3, 2]);
    }

    #[test]
    fn retired_set_is_bounded() {
        let mut retired = RetiredSet::default();
        for i in 0..=RETIRED_HANDLE_CAPACITY {
            retired.insert(ResourceKind::MediaTrack, i);
        }
        assert!(!retired.contains(ResourceKind::MediaTrack, "0"));
        assert!(retired.contains(ResourceKind::MediaTrack, "1"));
        assert!(!retired.contains(ResourceKind::MediaStream, "1"));
    }
}
