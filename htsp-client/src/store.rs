//! Local mirror of server state.
//!
//! Channels, tags and DVR entries live behind one reader/writer lock and are
//! only written by the reader loop. Every accessor hands out owned copies, so
//! callers may iterate while pushes keep arriving. Events fetched on demand
//! are memoized under a separate lock.

use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use htsp_protocol::{EntityKind, Message, Mutation, ProtocolError};

use crate::model::{Channel, Event, Mirrored, Recording, Tag};

#[derive(Default)]
struct Mirror {
    channels: BTreeMap<u32, Channel>,
    tags: BTreeMap<u32, Tag>,
    recordings: BTreeMap<u32, Recording>,
}

#[derive(Default)]
pub struct StateStore {
    mirror: RwLock<Mirror>,
    events: Mutex<HashMap<u32, Event>>,
}

/// Build the new version of an entity off to the side, then swap it in.
///
/// Adds and updates both merge into the current entity, or a fresh one if
/// the id is unknown.
fn upsert<T: Mirrored>(map: &mut BTreeMap<u32, T>, msg: &Message) -> Result<(), ProtocolError> {
    let id = msg.u32(T::ID_FIELD)?;
    let mut entity = match map.get(&id) {
        Some(current) => current.clone(),
        None => T::new(id),
    };
    entity.merge(msg)?;
    map.insert(id, entity);
    Ok(())
}

fn remove<T: Mirrored>(map: &mut BTreeMap<u32, T>, msg: &Message) -> Result<(), ProtocolError> {
    let id = msg.u32(T::ID_FIELD)?;
    if map.remove(&id).is_none() {
        debug!("Delete for unknown {}={}", T::ID_FIELD, id);
    }
    Ok(())
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one push mutation. On error the store is left unchanged.
    pub fn apply(
        &self,
        kind: EntityKind,
        mutation: Mutation,
        msg: &Message,
    ) -> Result<(), ProtocolError> {
        match mutation {
            Mutation::Add => self.apply_add(kind, msg),
            Mutation::Update => self.apply_update(kind, msg),
            Mutation::Delete => self.apply_delete(kind, msg),
        }
    }

    pub fn apply_add(&self, kind: EntityKind, msg: &Message) -> Result<(), ProtocolError> {
        self.upsert(kind, msg)
    }

    /// Merge into an existing entity. Unknown ids are inserted.
    pub fn apply_update(&self, kind: EntityKind, msg: &Message) -> Result<(), ProtocolError> {
        self.upsert(kind, msg)
    }

    /// Remove an entity. Unknown ids are a no-op.
    pub fn apply_delete(&self, kind: EntityKind, msg: &Message) -> Result<(), ProtocolError> {
        let mut mirror = self.mirror.write();
        match kind {
            EntityKind::Channel => remove(&mut mirror.channels, msg),
            EntityKind::Tag => remove(&mut mirror.tags, msg),
            EntityKind::DvrEntry => remove(&mut mirror.recordings, msg),
        }
    }

    fn upsert(&self, kind: EntityKind, msg: &Message) -> Result<(), ProtocolError> {
        let mut mirror = self.mirror.write();
        match kind {
            EntityKind::Channel => upsert(&mut mirror.channels, msg),
            EntityKind::Tag => upsert(&mut mirror.tags, msg),
            EntityKind::DvrEntry => upsert(&mut mirror.recordings, msg),
        }
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.mirror.read().channels.values().cloned().collect()
    }

    pub fn channel(&self, id: u32) -> Option<Channel> {
        self.mirror.read().channels.get(&id).cloned()
    }

    /// Channels belonging to a tag, in member order. Tag 0 means all channels;
    /// an unknown tag yields nothing. Members that don't resolve are skipped.
    pub fn channels_in_tag(&self, tag_id: u32) -> Vec<Channel> {
        let mirror = self.mirror.read();
        if tag_id == 0 {
            return mirror.channels.values().cloned().collect();
        }
        let tag = match mirror.tags.get(&tag_id) {
            Some(tag) => tag,
            None => return Vec::new(),
        };

        tag.members
            .iter()
            .filter_map(|id| {
                let channel = mirror.channels.get(id).cloned();
                if channel.is_none() {
                    warn!("Tag {} points to unknown channel {}", tag_id, id);
                }
                channel
            })
            .collect()
    }

    pub fn tags(&self) -> Vec<Tag> {
        self.mirror.read().tags.values().cloned().collect()
    }

    /// DVR entries filtered by lifecycle: `recorded` selects completed and
    /// aborted entries, `scheduled` selects pending and running ones.
    pub fn dvr_entries(&self, recorded: bool, scheduled: bool) -> Vec<Recording> {
        self.mirror
            .read()
            .recordings
            .values()
            .filter(|r| (recorded && r.state.is_recorded()) || (scheduled && r.state.is_timer()))
            .cloned()
            .collect()
    }

    pub fn dvr_entry(&self, id: u32) -> Option<Recording> {
        self.mirror.read().recordings.get(&id).cloned()
    }

    pub fn cached_event(&self, id: u32) -> Option<Event> {
        self.events.lock().get(&id).cloned()
    }

    pub fn memoize_event(&self, event: Event) {
        self.events.lock().insert(event.id, event);
    }

    /// Drop everything, before a fresh initial sync.
    pub fn clear(&self) {
        *self.mirror.write() = Mirror::default();
        self.events.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use htsp_protocol::Value;

    fn channel(id: u32, name: &str) -> Message {
        Message::method("channelAdd")
            .with_u32("channelId", id)
            .with_str("channelName", name)
    }

    #[test]
    fn test_update_unknown_id_behaves_as_add() {
        let added = StateStore::new();
        added
            .apply_add(EntityKind::Channel, &channel(4, "Four"))
            .unwrap();

        let updated = StateStore::new();
        updated
            .apply_update(EntityKind::Channel, &channel(4, "Four"))
            .unwrap();

        assert_eq!(added.channels(), updated.channels());
        assert_eq!(updated.channel(4).unwrap().name, "Four");
    }

    #[test]
    fn test_delete_unknown_id_is_noop() {
        let store = StateStore::new();
        store
            .apply_add(EntityKind::Channel, &channel(1, "One"))
            .unwrap();

        let delete = Message::method("channelDelete").with_u32("channelId", 42);
        store.apply_delete(EntityKind::Channel, &delete).unwrap();
        assert_eq!(store.channels().len(), 1);

        let delete = Message::method("dvrEntryDelete").with_u32("id", 42);
        store.apply_delete(EntityKind::DvrEntry, &delete).unwrap();
    }

    #[test]
    fn test_add_and_update_both_merge() {
        let store = StateStore::new();
        store
            .apply_add(
                EntityKind::Channel,
                &channel(1, "One").with_u32("channelNumber", 1),
            )
            .unwrap();

        store
            .apply_update(
                EntityKind::Channel,
                &Message::new().with_u32("channelId", 1).with_u32("eventId", 9),
            )
            .unwrap();
        let merged = store.channel(1).unwrap();
        assert_eq!((merged.number, merged.event_id), (1, 9));

        // A repeated add only overwrites the fields it carries.
        store
            .apply_add(EntityKind::Channel, &channel(1, "Uno"))
            .unwrap();
        let readded = store.channel(1).unwrap();
        assert_eq!(readded.name, "Uno");
        assert_eq!((readded.number, readded.event_id), (1, 9));
    }

    #[test]
    fn test_missing_id_is_rejected() {
        let store = StateStore::new();
        let result = store.apply_add(
            EntityKind::Tag,
            &Message::method("tagAdd").with_str("tagName", "Films"),
        );
        assert_eq!(result, Err(ProtocolError::FieldMissing("tagId".into())));
        assert!(store.tags().is_empty());
    }

    #[test]
    fn test_tag_with_dangling_member() {
        let store = StateStore::new();
        store
            .apply_add(EntityKind::Channel, &channel(5, "Five"))
            .unwrap();
        store
            .apply_add(
                EntityKind::Tag,
                &Message::method("tagAdd")
                    .with_u32("tagId", 1)
                    .with_str("tagName", "Favourites")
                    .with("members", Value::List(vec![Value::S64(5), Value::S64(99)])),
            )
            .unwrap();

        let channels = store.channels_in_tag(1);
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].id, 5);

        assert!(store.channels_in_tag(2).is_empty());
        assert_eq!(store.channels_in_tag(0).len(), 1);
    }

    #[test]
    fn test_dvr_entry_views() {
        let store = StateStore::new();
        for (id, state) in [(1, "scheduled"), (2, "recording"), (3, "completed"), (4, "invalid")] {
            store
                .apply_add(
                    EntityKind::DvrEntry,
                    &Message::method("dvrEntryAdd")
                        .with_u32("id", id)
                        .with_str("state", state),
                )
                .unwrap();
        }

        let ids = |entries: Vec<Recording>| entries.iter().map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(ids(store.dvr_entries(false, true)), vec![1, 2]);
        assert_eq!(ids(store.dvr_entries(true, false)), vec![3, 4]);
        assert_eq!(store.dvr_entries(true, true).len(), 4);
        assert!(store.dvr_entries(false, false).is_empty());

        // Recording finishes.
        store
            .apply_update(
                EntityKind::DvrEntry,
                &Message::new().with_u32("id", 2).with_str("state", "completed"),
            )
            .unwrap();
        assert_eq!(ids(store.dvr_entries(true, false)), vec![2, 3, 4]);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let store = StateStore::new();
        store
            .apply_add(EntityKind::Channel, &channel(1, "One"))
            .unwrap();
        let snapshot = store.channels();

        store
            .apply_delete(
                EntityKind::Channel,
                &Message::new().with_u32("channelId", 1),
            )
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(store.channels().is_empty());
    }

    #[test]
    fn test_event_memo_and_clear() {
        let store = StateStore::new();
        store.memoize_event(Event {
            id: 8,
            title: "Film".into(),
            ..Default::default()
        });
        assert_eq!(store.cached_event(8).unwrap().title, "Film");

        store.clear();
        assert_eq!(store.cached_event(8), None);
    }
}
