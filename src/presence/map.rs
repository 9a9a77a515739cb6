//! # Presence Map
//!
//! Latest known presence state per member (`{connection_id}:{client_id}`).
//!
//! Last writer wins by timestamp; on equal timestamps the later arrival
//! wins. During a sync, members known before the sync started are tracked
//! as residual until the sync re-confirms them; whoever is still residual
//! when the sync ends has left.

use std::collections::{HashMap, HashSet};

use crate::protocol::{now_millis, PresenceAction, PresenceMessage};

/// Whether a sync `channel_serial` (`{sync_id}:{cursor}`) announces more pages
pub fn sync_has_more(channel_serial: Option<&str>) -> bool {
    channel_serial
        .and_then(|serial| serial.split_once(':'))
        .map_or(false, |(_, cursor)| !cursor.is_empty())
}

#[derive(Debug, Default)]
pub struct PresenceMap {
    members: HashMap<String, PresenceMessage>,
    residual_members: Option<HashSet<String>>,
    sync_complete: bool,
}

impl PresenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a member is present. Returns false when a newer state for
    /// the same member is already stored.
    pub fn put(&mut self, message: &PresenceMessage) -> bool {
        let key = message.member_key();
        if let Some(residual) = self.residual_members.as_mut() {
            residual.remove(&key);
        }
        if let Some(existing) = self.members.get(&key) {
            if existing.is_newer_than(message) {
                return false;
            }
        }

        let mut stored = message.clone();
        stored.action = PresenceAction::Present;
        self.members.insert(key, stored);
        true
    }

    /// Record that a member left. Returns true when a present member was
    /// removed.
    ///
    /// While a sync is in progress the member is replaced by an `Absent`
    /// witness so an older `Present` from a later sync page cannot revive it.
    pub fn remove(&mut self, message: &PresenceMessage) -> bool {
        let key = message.member_key();
        let existing = match self.members.get(&key) {
            Some(existing) if existing.is_newer_than(message) => return false,
            Some(existing) => Some(existing.action),
            None => None,
        };

        if self.is_sync_in_progress() {
            if let Some(residual) = self.residual_members.as_mut() {
                residual.remove(&key);
            }
            let mut witness = message.clone();
            witness.action = PresenceAction::Absent;
            self.members.insert(key, witness);
        } else {
            self.members.remove(&key);
        }

        matches!(existing, Some(action) if action != PresenceAction::Absent)
    }

    /// Begin a sync. A sync already in progress is left untouched.
    pub fn start_sync(&mut self) {
        if self.residual_members.is_none() {
            self.residual_members = Some(self.members.keys().cloned().collect());
            self.sync_complete = false;
        }
    }

    /// Finish a sync: drop `Absent` witnesses and every member that was not
    /// re-confirmed. Returns synthesized `Leave` messages for the members
    /// that disappeared. No-op when no sync is in progress.
    pub fn end_sync(&mut self) -> Vec<PresenceMessage> {
        let Some(residual) = self.residual_members.take() else {
            return Vec::new();
        };

        self.members
            .retain(|_, member| member.action != PresenceAction::Absent);

        let mut departed = Vec::new();
        for key in residual {
            if let Some(mut member) = self.members.remove(&key) {
                member.action = PresenceAction::Leave;
                member.timestamp = Some(now_millis());
                departed.push(member);
            }
        }
        self.sync_complete = true;
        departed
    }

    pub fn is_sync_in_progress(&self) -> bool {
        self.residual_members.is_some()
    }

    pub fn is_sync_complete(&self) -> bool {
        self.sync_complete
    }

    /// Present members, excluding sync witnesses
    pub fn values(&self) -> Vec<PresenceMessage> {
        let mut members: Vec<PresenceMessage> = self
            .members
            .values()
            .filter(|m| m.action != PresenceAction::Absent)
            .cloned()
            .collect();
        members.sort_by(|a, b| a.member_key().cmp(&b.member_key()));
        members
    }

    pub fn get(&self, member_key: &str) -> Option<&PresenceMessage> {
        self.members
            .get(member_key)
            .filter(|m| m.action != PresenceAction::Absent)
    }

    pub fn len(&self) -> usize {
        self.members
            .values()
            .filter(|m| m.action != PresenceAction::Absent)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything, including an unfinished sync
    pub fn clear(&mut self) {
        self.members.clear();
        self.residual_members = None;
        self.sync_complete = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(client: &str, action: PresenceAction, timestamp: i64) -> PresenceMessage {
        let mut msg = PresenceMessage::new(action, client, None);
        msg.connection_id = Some(format!("conn-{}", client));
        msg.timestamp = Some(timestamp);
        msg
    }

    fn clients(map: &PresenceMap) -> Vec<String> {
        map.values().into_iter().map(|m| m.client_id).collect()
    }

    #[test]
    fn test_put_ignores_older_state() {
        let mut map = PresenceMap::new();
        assert!(map.put(&member("a", PresenceAction::Enter, 200)));
        assert!(!map.put(&member("a", PresenceAction::Update, 100)));
        assert!(map.put(&member("a", PresenceAction::Update, 200)));

        let stored = map.get("conn-a:a").unwrap();
        assert_eq!(stored.action, PresenceAction::Present);
        assert_eq!(stored.timestamp, Some(200));
    }

    #[test]
    fn test_remove_outside_sync() {
        let mut map = PresenceMap::new();
        map.put(&member("a", PresenceAction::Enter, 100));

        assert!(!map.remove(&member("a", PresenceAction::Leave, 50)));
        assert_eq!(map.len(), 1);

        assert!(map.remove(&member("a", PresenceAction::Leave, 150)));
        assert!(map.is_empty());
        assert!(!map.remove(&member("a", PresenceAction::Leave, 150)));
    }

    #[test]
    fn test_sync_purges_unconfirmed_members() {
        let mut map = PresenceMap::new();
        for client in ["a", "b", "c"] {
            map.put(&member(client, PresenceAction::Enter, 100));
        }

        map.start_sync();
        assert!(map.is_sync_in_progress());
        map.put(&member("a", PresenceAction::Present, 110));
        map.put(&member("b", PresenceAction::Present, 110));
        let departed = map.end_sync();

        assert_eq!(clients(&map), vec!["a", "b"]);
        assert_eq!(departed.len(), 1);
        assert_eq!(departed[0].client_id, "c");
        assert_eq!(departed[0].action, PresenceAction::Leave);
        assert!(map.is_sync_complete());
    }

    #[test]
    fn test_leave_during_sync_leaves_witness_until_end() {
        let mut map = PresenceMap::new();
        map.start_sync();
        map.remove(&member("a", PresenceAction::Leave, 200));
        // An older page of the sync must not bring the member back
        assert!(!map.put(&member("a", PresenceAction::Present, 100)));
        assert!(map.is_empty());
        assert!(map.get("conn-a:a").is_none());

        map.end_sync();
        assert!(map.is_empty());
        assert!(!map.remove(&member("a", PresenceAction::Leave, 300)));
    }

    #[test]
    fn test_removing_a_witness_is_a_noop() {
        let mut map = PresenceMap::new();
        map.put(&member("a", PresenceAction::Enter, 100));
        map.start_sync();
        assert!(map.remove(&member("a", PresenceAction::Leave, 150)));
        assert!(!map.remove(&member("a", PresenceAction::Leave, 160)));
    }

    #[test]
    fn test_end_sync_is_idempotent() {
        let mut map = PresenceMap::new();
        map.put(&member("a", PresenceAction::Enter, 100));
        assert!(map.end_sync().is_empty());
        assert_eq!(map.len(), 1);

        map.start_sync();
        map.end_sync();
        assert!(map.end_sync().is_empty());
        assert!(map.is_empty());
    }

    #[test]
    fn test_start_sync_twice_keeps_first_snapshot() {
        let mut map = PresenceMap::new();
        map.put(&member("a", PresenceAction::Enter, 100));
        map.start_sync();
        map.put(&member("b", PresenceAction::Present, 100));
        map.start_sync();
        let departed = map.end_sync();
        assert_eq!(departed.len(), 1);
        assert_eq!(clients(&map), vec!["b"]);
    }

    #[test]
    fn test_sync_has_more() {
        assert!(sync_has_more(Some("sync-1:cursor-2")));
        assert!(!sync_has_more(Some("sync-1:")));
        assert!(!sync_has_more(Some("sync-1")));
        assert!(!sync_has_more(None));
    }
}
