//! Room data type
//!
//! A room groups the peer sessions of its members. The room holds session
//! handles only; the sessions themselves live in the daemon's arena.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;

use rtcpilot_core::{MemberId, RoomId, SessionHandle};

/// Room lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoomState {
    /// Entry exists but has never held a member
    Creating,
    /// At least one member has joined
    Active,
    /// Members are being torn down
    Closing,
    /// Torn down, about to be removed
    Closed,
}

/// A room and its members
#[derive(Debug)]
pub struct Room {
    pub id: RoomId,

    state: RoomState,

    /// Member id -> session handle
    members: HashMap<MemberId, SessionHandle>,

    /// Payload of the last pilot update
    attributes: Option<Value>,

    /// Set once the room has had a member
    had_members: bool,

    created_at: Instant,

    /// Last activity time
    last_activity: Instant,
}

/// Room errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("room {0} is full")]
    Full(RoomId),

    #[error("room {0} is closing")]
    Closing(RoomId),
}

impl Room {
    /// Create a new room
    pub fn new(id: impl Into<RoomId>) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            state: RoomState::Creating,
            members: HashMap::new(),
            attributes: None,
            had_members: false,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn state(&self) -> RoomState {
        self.state
    }

    /// Add a member, returning the session it replaced if the member id was
    /// already present
    pub fn add_member(
        &mut self,
        member: impl Into<MemberId>,
        session: SessionHandle,
    ) -> Result<Option<SessionHandle>, RoomError> {
        if matches!(self.state, RoomState::Closing | RoomState::Closed) {
            return Err(RoomError::Closing(self.id.clone()));
        }
        let member = member.into();
        if !self.members.contains_key(&member) && self.members.len() >= crate::MAX_MEMBERS_PER_ROOM
        {
            return Err(RoomError::Full(self.id.clone()));
        }

        let replaced = self.members.insert(member, session);
        self.had_members = true;
        self.state = RoomState::Active;
        self.touch();
        Ok(replaced)
    }

    /// Remove a member
    pub fn remove_member(&mut self, member: &str) -> Option<SessionHandle> {
        self.touch();
        self.members.remove(member)
    }

    /// Remove a member only if it is still bound to `session`
    pub fn remove_session(&mut self, session: SessionHandle) -> Option<MemberId> {
        let member = self
            .members
            .iter()
            .find(|(_, h)| **h == session)
            .map(|(m, _)| m.clone())?;
        self.members.remove(&member);
        self.touch();
        Some(member)
    }

    pub fn member(&self, member: &str) -> Option<SessionHandle> {
        self.members.get(member).copied()
    }

    pub fn members(&self) -> impl Iterator<Item = (&MemberId, &SessionHandle)> {
        self.members.iter()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// True once a room that had members is empty again
    pub fn is_abandoned(&self) -> bool {
        self.had_members && self.members.is_empty()
    }

    /// Enter `Closing` and hand back every member for teardown
    pub fn begin_close(&mut self) -> Vec<(MemberId, SessionHandle)> {
        self.state = RoomState::Closing;
        self.members.drain().collect()
    }

    pub fn mark_closed(&mut self) {
        self.state = RoomState::Closed;
    }

    pub fn attributes(&self) -> Option<&Value> {
        self.attributes.as_ref()
    }

    pub fn set_attributes(&mut self, attributes: Value) {
        self.attributes = Some(attributes);
        self.touch();
    }

    pub fn age_secs(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }

    /// Seconds since the last membership or attribute change
    pub fn idle_secs(&self) -> u64 {
        self.last_activity.elapsed().as_secs()
    }

    /// Update last activity time
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handle(key: u32) -> SessionHandle {
        SessionHandle::new(key, 0)
    }

    #[test]
    fn test_room_lifecycle() {
        let mut room = Room::new("room-1");
        assert_eq!(room.state(), RoomState::Creating);
        assert!(!room.is_abandoned());

        room.add_member("alice", handle(1)).unwrap();
        assert_eq!(room.state(), RoomState::Active);
        assert_eq!(room.member_count(), 1);

        assert_eq!(room.remove_member("alice"), Some(handle(1)));
        assert!(room.is_abandoned());
    }

    #[test]
    fn test_duplicate_member_replaces() {
        let mut room = Room::new("room-1");
        assert_eq!(room.add_member("alice", handle(1)).unwrap(), None);
        assert_eq!(room.add_member("alice", handle(2)).unwrap(), Some(handle(1)));
        assert_eq!(room.member_count(), 1);
        assert_eq!(room.member("alice"), Some(handle(2)));
    }

    #[test]
    fn test_remove_session_checks_handle() {
        let mut room = Room::new("room-1");
        room.add_member("alice", handle(2)).unwrap();
        assert_eq!(room.remove_session(handle(1)), None);
        assert_eq!(room.remove_session(handle(2)), Some("alice".to_string()));
        assert!(room.is_empty());
    }

    #[test]
    fn test_begin_close_drains() {
        let mut room = Room::new("room-1");
        room.add_member("a", handle(1)).unwrap();
        room.add_member("b", handle(2)).unwrap();

        let members = room.begin_close();
        assert_eq!(members.len(), 2);
        assert_eq!(room.state(), RoomState::Closing);
        assert_eq!(
            room.add_member("c", handle(3)),
            Err(RoomError::Closing("room-1".into()))
        );

        room.mark_closed();
        assert_eq!(room.state(), RoomState::Closed);
    }

    #[test]
    fn test_room_full() {
        let mut room = Room::new("big");
        for i in 0..crate::MAX_MEMBERS_PER_ROOM {
            room.add_member(format!("m{}", i), handle(i as u32)).unwrap();
        }
        assert_eq!(
            room.add_member("late", handle(9999)),
            Err(RoomError::Full("big".into()))
        );
        // Replacing an existing member is still allowed
        assert!(room.add_member("m0", handle(10000)).is_ok());
    }

    #[test]
    fn test_attributes() {
        let mut room = Room::new("room-1");
        assert!(room.attributes().is_none());
        room.set_attributes(json!({"title": "standup"}));
        assert_eq!(room.attributes(), Some(&json!({"title": "standup"})));
        assert!(room.idle_secs() < 60);
    }
}
