//! Ownership of shared dynamic scene objects.
//!
//! First claimant wins: a claim succeeds only on an unowned object or one the
//! requester already owns, and only the owner may move an object or give it
//! up. Objects are created the first time anyone mentions them and are kept
//! when their owner leaves, just released. The table holds at most
//! `max_objects` entries; ids beyond that are refused.

use log::debug;
use shared::{Quaternion, SceneObject, SessionId, Vector3};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("session {requester} may not modify object {object:?} owned by {owner}")]
pub struct OwnershipConflict {
    pub object: String,
    pub owner: SessionId,
    pub requester: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("object table holds its limit of {limit} objects, refusing {object:?}")]
pub struct ObjectLimitReached {
    pub object: String,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vector3,
    pub scale: Vector3,
    pub orientation: Quaternion,
}

impl Transform {
    pub fn of(object: &SceneObject) -> Self {
        Self {
            position: object.position,
            scale: object.scale,
            orientation: object.orientation,
        }
    }
}

#[derive(Debug)]
pub struct OwnershipTable {
    objects: HashMap<String, SceneObject>,
    max_objects: usize,
}

impl Default for OwnershipTable {
    fn default() -> Self {
        Self::with_limit(usize::MAX)
    }
}

impl OwnershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_objects: usize) -> Self {
        Self {
            objects: HashMap::new(),
            max_objects,
        }
    }

    fn is_full(&self) -> bool {
        self.objects.len() >= self.max_objects
    }

    /// Owner of `object_id`; `SessionId::NONE` if unknown or unowned.
    pub fn get_owner(&self, object_id: &str) -> SessionId {
        self.objects
            .get(object_id)
            .map_or(SessionId::NONE, |object| object.owner)
    }

    pub fn get(&self, object_id: &str) -> Option<&SceneObject> {
        self.objects.get(object_id)
    }

    pub fn contains(&self, object_id: &str) -> bool {
        self.objects.contains_key(object_id)
    }

    /// Creates an unowned entry with `transform` unless the object exists.
    /// Returns true if the entry was created.
    pub fn announce(
        &mut self,
        object_id: &str,
        transform: Transform,
    ) -> Result<bool, ObjectLimitReached> {
        if self.objects.contains_key(object_id) {
            return Ok(false);
        }
        if self.is_full() {
            return Err(ObjectLimitReached {
                object: object_id.to_string(),
                limit: self.max_objects,
            });
        }
        debug!("Scene object {:?} created", object_id);
        let object = SceneObject::new(object_id).with_transform(
            transform.position,
            transform.scale,
            transform.orientation,
        );
        self.objects.insert(object_id.to_string(), object);
        Ok(true)
    }

    /// Claims `object_id` for `requester`, creating it if there is room.
    pub fn claim(&mut self, object_id: &str, requester: SessionId) -> bool {
        if !requester.is_assigned() {
            return false;
        }
        if !self.objects.contains_key(object_id) && self.is_full() {
            return false;
        }
        let object = self
            .objects
            .entry(object_id.to_string())
            .or_insert_with(|| SceneObject::new(object_id));

        if object.owner == SessionId::NONE || object.owner == requester {
            object.owner = requester;
            true
        } else {
            false
        }
    }

    /// Clears ownership if `requester` holds it; a no-op returning false otherwise.
    pub fn release(&mut self, object_id: &str, requester: SessionId) -> bool {
        match self.objects.get_mut(object_id) {
            Some(object) if requester.is_assigned() && object.owner == requester => {
                object.owner = SessionId::NONE;
                true
            }
            _ => false,
        }
    }

    pub fn update_pose(
        &mut self,
        object_id: &str,
        requester: SessionId,
        transform: Transform,
    ) -> Result<&SceneObject, OwnershipConflict> {
        let owner = self.get_owner(object_id);
        if !requester.is_assigned() || owner != requester {
            return Err(OwnershipConflict {
                object: object_id.to_string(),
                owner,
                requester,
            });
        }

        let object = self
            .objects
            .get_mut(object_id)
            .ok_or_else(|| OwnershipConflict {
                object: object_id.to_string(),
                owner,
                requester,
            })?;
        object.position = transform.position;
        object.scale = transform.scale;
        object.orientation = transform.orientation;
        Ok(&*object)
    }

    /// Releases everything `owner` holds, returning the released objects.
    pub fn release_all(&mut self, owner: SessionId) -> Vec<SceneObject> {
        if !owner.is_assigned() {
            return Vec::new();
        }
        let mut released: Vec<SceneObject> = self
            .objects
            .values_mut()
            .filter(|object| object.owner == owner)
            .map(|object| {
                object.owner = SessionId::NONE;
                object.clone()
            })
            .collect();
        released.sort_by(|a, b| a.id.cmp(&b.id));
        released
    }

    pub fn snapshot(&self) -> Vec<SceneObject> {
        let mut objects: Vec<SceneObject> = self.objects.values().cloned().collect();
        objects.sort_by(|a, b| a.id.cmp(&b.id));
        objects
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
