//! Room membership registry.
//!
//! Owns every room's ordered member list and nothing else. All mutation
//! happens through [`RoomRegistry::join`] and [`RoomRegistry::leave`]; the
//! caller (the server loop) is responsible for delivering the presence
//! notifications described by the returned values.

use std::collections::HashMap;

use crate::error::Error;
use crate::protocol::{ParticipantId, RoomId, ROOM_CAPACITY};

#[derive(Debug, Default)]
struct Room {
    /// Insertion order is join order; role assignment depends on it.
    participants: Vec<ParticipantId>,
}

/// Result of an admission: who was already there, and whether this join
/// filled the room.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub others: Vec<ParticipantId>,
    pub at_capacity: bool,
}

/// Result of a departure, for notifying the remaining members.
#[derive(Debug, Clone, PartialEq)]
pub struct Departure {
    pub room_id: RoomId,
    pub remaining: Vec<ParticipantId>,
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
    memberships: HashMap<ParticipantId, RoomId>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits `participant` into `room_id`, creating the room if absent.
    ///
    /// On success the returned [`Admission`] lists the other members in
    /// join order. A full room rejects without mutating anything.
    pub fn join(
        &mut self,
        participant: &ParticipantId,
        room_id: &RoomId,
    ) -> Result<Admission, Error> {
        let room = self.rooms.entry(room_id.clone()).or_default();
        if room.participants.len() >= ROOM_CAPACITY {
            return Err(Error::RoomFull);
        }

        let others = room.participants.clone();
        room.participants.push(participant.clone());
        let at_capacity = room.participants.len() == ROOM_CAPACITY;
        self.memberships.insert(participant.clone(), room_id.clone());

        Ok(Admission {
            others,
            at_capacity,
        })
    }

    /// Removes `participant` from its room, deleting the room when it
    /// empties. A no-op for participants that are not in any room.
    pub fn leave(&mut self, participant: &ParticipantId) -> Option<Departure> {
        let room_id = self.memberships.remove(participant)?;
        let room = self.rooms.get_mut(&room_id)?;
        room.participants.retain(|p| p != participant);

        let remaining = room.participants.clone();
        if remaining.is_empty() {
            self.rooms.remove(&room_id);
        }
        Some(Departure { room_id, remaining })
    }

    /// Current members of `room_id` in join order.
    pub fn members(&self, room_id: &RoomId) -> Vec<ParticipantId> {
        self.rooms
            .get(room_id)
            .map(|r| r.participants.clone())
            .unwrap_or_default()
    }

    pub fn room_of(&self, participant: &ParticipantId) -> Option<&RoomId> {
        self.memberships.get(participant)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ParticipantId {
        s.to_string()
    }

    #[test]
    fn join_returns_prior_members_in_join_order() {
        let mut reg = RoomRegistry::new();
        let room = id("r1");

        let a = reg.join(&id("a"), &room).unwrap();
        assert!(a.others.is_empty());
        assert!(!a.at_capacity);

        let b = reg.join(&id("b"), &room).unwrap();
        assert_eq!(b.others, vec![id("a")]);

        let c = reg.join(&id("c"), &room).unwrap();
        assert_eq!(c.others, vec![id("a"), id("b")]);
        assert!(c.at_capacity);
    }

    #[test]
    fn fourth_join_is_rejected_without_mutation() {
        let mut reg = RoomRegistry::new();
        let room = id("r1");
        for p in ["a", "b", "c"] {
            reg.join(&id(p), &room).unwrap();
        }

        assert!(matches!(reg.join(&id("d"), &room), Err(Error::RoomFull)));
        assert_eq!(reg.members(&room), vec![id("a"), id("b"), id("c")]);
        assert!(reg.room_of(&id("d")).is_none());
    }

    #[test]
    fn membership_never_exceeds_capacity() {
        let mut reg = RoomRegistry::new();
        let room = id("r1");
        for i in 0..10 {
            let _ = reg.join(&format!("p{}", i), &room);
            assert!(reg.members(&room).len() <= ROOM_CAPACITY);
        }
    }

    #[test]
    fn leave_notifies_remaining_and_deletes_empty_rooms() {
        let mut reg = RoomRegistry::new();
        let room = id("r1");
        reg.join(&id("a"), &room).unwrap();
        reg.join(&id("b"), &room).unwrap();

        let dep = reg.leave(&id("a")).unwrap();
        assert_eq!(dep.room_id, room);
        assert_eq!(dep.remaining, vec![id("b")]);
        assert_eq!(reg.room_count(), 1);

        let dep = reg.leave(&id("b")).unwrap();
        assert!(dep.remaining.is_empty());
        assert_eq!(reg.room_count(), 0, "empty rooms are never kept");
    }

    #[test]
    fn leave_is_idempotent() {
        let mut reg = RoomRegistry::new();
        assert!(reg.leave(&id("ghost")).is_none());

        let room = id("r1");
        reg.join(&id("a"), &room).unwrap();
        assert!(reg.leave(&id("a")).is_some());
        assert!(reg.leave(&id("a")).is_none());
    }

    #[test]
    fn rejoining_after_room_drains_works() {
        let mut reg = RoomRegistry::new();
        let room = id("r1");
        for p in ["a", "b", "c"] {
            reg.join(&id(p), &room).unwrap();
        }
        reg.leave(&id("b")).unwrap();

        let adm = reg.join(&id("d"), &room).unwrap();
        assert_eq!(adm.others, vec![id("a"), id("c")]);
        assert!(adm.at_capacity);
    }
}
