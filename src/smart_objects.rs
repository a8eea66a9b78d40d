use crate::config::SearchConfig;
use crate::external::SmartObjectUser;
use bevy_ecs::prelude::{Entity, Resource};
use glam::Vec2;
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmartObjectId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Claimed,
    Occupied,
}

/// Exclusive reservation of one slot by one user. Valid only while the slot
/// still records this user in `Claimed` or `Occupied` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimHandle {
    pub object: SmartObjectId,
    pub slot: u16,
    pub user: Entity,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub object: SmartObjectId,
    pub cost: f32,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub processed: bool,
    pub candidates: SmallVec<[Candidate; 8]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(ClaimHandle),
    InvalidRequest,
    UnprocessedRequest,
    NoAvailableCandidate,
}

#[derive(Debug, Clone, Copy)]
struct SlotRuntime {
    state: SlotState,
    user: Option<Entity>,
}

struct ObjectRuntime {
    id: SmartObjectId,
    position: Vec2,
    slots: SmallVec<[SlotRuntime; 2]>,
    live: bool,
}

struct SearchRequest {
    id: RequestId,
    requester: Entity,
    origin: Vec2,
    result: SearchResult,
}

/// Runtime registry for interactable resources and the claims held on their
/// slots. Explicitly constructed per world; all mutation goes through the
/// claim/use/release API.
#[derive(Resource)]
pub struct SmartObjectRegistry {
    objects: Vec<ObjectRuntime>,
    index_of: HashMap<SmartObjectId, usize>,
    requests: Vec<SearchRequest>,
    next_object: u32,
    next_request: u64,
    max_candidates: usize,
    retry_cooldown: f64,
    inbox: HashMap<Entity, SmallVec<[ClaimHandle; 2]>>,
    invalidated: Vec<(Entity, SmartObjectId)>,
}

impl SmartObjectRegistry {
    pub fn new(config: &SearchConfig) -> Self {
        Self {
            objects: Vec::new(),
            index_of: HashMap::new(),
            requests: Vec::new(),
            next_object: 0,
            next_request: 0,
            max_candidates: config.max_candidates,
            retry_cooldown: config.retry_cooldown_seconds as f64,
            inbox: HashMap::new(),
            invalidated: Vec::new(),
        }
    }

    // ---------- Object lifecycle ----------

    pub fn register_object(&mut self, position: Vec2, slot_count: u16) -> SmartObjectId {
        let id = SmartObjectId(self.next_object);
        self.next_object += 1;
        let slots = (0..slot_count.max(1))
            .map(|_| SlotRuntime { state: SlotState::Free, user: None })
            .collect();
        self.index_of.insert(id, self.objects.len());
        self.objects.push(ObjectRuntime { id, position, slots, live: true });
        id
    }

    /// Removes the object. Claims held on it are forcibly released: each
    /// holder gets an inbox notice and a pending invalidation signal.
    pub fn unregister_object(&mut self, id: SmartObjectId) -> bool {
        let Self { objects, index_of, inbox, invalidated, .. } = self;
        let Some(&index) = index_of.get(&id) else {
            return false;
        };
        let object = &mut objects[index];
        if !object.live {
            return false;
        }
        for (slot_index, slot) in object.slots.iter_mut().enumerate() {
            if slot.state != SlotState::Free {
                if let Some(user) = slot.user {
                    let claim = ClaimHandle { object: id, slot: slot_index as u16, user };
                    inbox.entry(user).or_default().push(claim);
                    invalidated.push((user, id));
                }
            }
            *slot = SlotRuntime { state: SlotState::Free, user: None };
        }
        object.live = false;
        index_of.remove(&id);
        true
    }

    // ---------- Candidate search ----------

    /// Issues a search, non-blocking. The result is filled by a later
    /// `process_requests` pass; poll `request_result` for `processed`.
    pub fn find_candidates_async(&mut self, requester: Entity, origin: Vec2) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        self.requests.push(SearchRequest { id, requester, origin, result: SearchResult::default() });
        id
    }

    /// Cooldown-guarded search entry point for smart-object users.
    pub fn begin_search(
        &mut self,
        requester: Entity,
        user: &mut SmartObjectUser,
        origin: Vec2,
        now: f64,
    ) -> Option<RequestId> {
        if !user.search_allowed(now) {
            return None;
        }
        user.next_search_at = now + self.retry_cooldown;
        Some(self.find_candidates_async(requester, origin))
    }

    /// Batch pass: ranks objects that still have a free slot by ascending
    /// squared distance. Appending stops once the candidate buffer is full;
    /// candidates found up to that point remain valid.
    pub fn process_requests(&mut self) -> usize {
        let Self { objects, requests, max_candidates, .. } = self;
        let mut processed = 0;
        for request in requests.iter_mut() {
            if request.result.processed {
                continue;
            }
            let mut candidates: SmallVec<[Candidate; 8]> = SmallVec::new();
            for object in objects.iter() {
                if !object.live {
                    continue;
                }
                if !object.slots.iter().any(|slot| slot.state == SlotState::Free) {
                    continue;
                }
                if candidates.len() >= *max_candidates {
                    break;
                }
                candidates.push(Candidate {
                    object: object.id,
                    cost: request.origin.distance_squared(object.position),
                });
            }
            candidates.sort_by(|a, b| a.cost.partial_cmp(&b.cost).unwrap_or(Ordering::Equal));
            request.result = SearchResult { processed: true, candidates };
            processed += 1;
        }
        processed
    }

    pub fn request_result(&self, id: RequestId) -> Option<&SearchResult> {
        self.requests.iter().find(|request| request.id == id).map(|request| &request.result)
    }

    /// Releases the transient request record. Safe whether or not the request
    /// was ever processed.
    pub fn remove_request(&mut self, id: RequestId) -> bool {
        let before = self.requests.len();
        self.requests.retain(|request| request.id != id);
        self.requests.len() != before
    }

    // ---------- Claims ----------

    /// Walks the ranked candidates in order and claims the first free slot.
    pub fn claim_candidate(&mut self, entity: Entity, id: RequestId) -> ClaimOutcome {
        let Some(index) = self.requests.iter().position(|request| request.id == id) else {
            return ClaimOutcome::InvalidRequest;
        };
        if !self.requests[index].result.processed {
            return ClaimOutcome::UnprocessedRequest;
        }
        let candidates = self.requests[index].result.candidates.clone();
        for candidate in candidates {
            if let Some(claim) = self.claim_slot(candidate.object, entity) {
                return ClaimOutcome::Claimed(claim);
            }
        }
        ClaimOutcome::NoAvailableCandidate
    }

    /// `Free -> Claimed` on the first available slot, or `None` if the object
    /// is gone or fully claimed.
    pub fn claim_slot(&mut self, object: SmartObjectId, user: Entity) -> Option<ClaimHandle> {
        let &index = self.index_of.get(&object)?;
        let runtime = &mut self.objects[index];
        if !runtime.live {
            return None;
        }
        for (slot_index, slot) in runtime.slots.iter_mut().enumerate() {
            if slot.state == SlotState::Free {
                slot.state = SlotState::Claimed;
                slot.user = Some(user);
                return Some(ClaimHandle { object, slot: slot_index as u16, user });
            }
        }
        None
    }

    /// `Claimed -> Occupied`. Out-of-order use is a protocol error: asserts
    /// in debug builds, reports failure in release.
    pub fn use_slot(&mut self, claim: ClaimHandle) -> bool {
        let Some(slot) = self.slot_mut(claim) else {
            debug_assert!(false, "use_slot on an invalid claim");
            return false;
        };
        if slot.state != SlotState::Claimed || slot.user != Some(claim.user) {
            debug_assert!(false, "use_slot out of order");
            return false;
        }
        slot.state = SlotState::Occupied;
        true
    }

    /// Removes the claim record and frees the slot. Releasing a claim that no
    /// longer holds the slot is a no-op, not an error. With `aborted` the
    /// holder is notified through its invalidation inbox first.
    pub fn release_slot(&mut self, claim: ClaimHandle, aborted: bool) -> bool {
        let Some(slot) = self.slot_mut(claim) else {
            return false;
        };
        if slot.state == SlotState::Free || slot.user != Some(claim.user) {
            return false;
        }
        *slot = SlotRuntime { state: SlotState::Free, user: None };
        if aborted {
            self.inbox.entry(claim.user).or_default().push(claim);
            self.invalidated.push((claim.user, claim.object));
        }
        true
    }

    /// Frees every slot still held by `user`, for entity teardown. No inbox
    /// notices are posted; the holder is going away.
    pub fn release_all_for_user(&mut self, user: Entity) -> usize {
        let mut released = 0;
        for object in &mut self.objects {
            if !object.live {
                continue;
            }
            for slot in object.slots.iter_mut() {
                if slot.user == Some(user) && slot.state != SlotState::Free {
                    *slot = SlotRuntime { state: SlotState::Free, user: None };
                    released += 1;
                }
            }
        }
        self.requests.retain(|request| request.requester != user);
        self.inbox.remove(&user);
        released
    }

    pub fn is_claim_valid(&self, claim: ClaimHandle) -> bool {
        self.index_of
            .get(&claim.object)
            .and_then(|&index| self.objects[index].slots.get(claim.slot as usize))
            .map_or(false, |slot| slot.state != SlotState::Free && slot.user == Some(claim.user))
    }

    pub fn slot_state(&self, object: SmartObjectId, slot: u16) -> Option<SlotState> {
        let &index = self.index_of.get(&object)?;
        self.objects[index].slots.get(slot as usize).map(|slot| slot.state)
    }

    // ---------- Invalidation delivery ----------

    /// Drained by the holder on its next tick; a claim that shows up here is
    /// void the moment it is read.
    pub fn take_invalidations(&mut self, entity: Entity) -> SmallVec<[ClaimHandle; 2]> {
        self.inbox.remove(&entity).unwrap_or_default()
    }

    pub(crate) fn drain_invalidation_signals(&mut self) -> Vec<(Entity, SmartObjectId)> {
        std::mem::take(&mut self.invalidated)
    }

    // ---------- Inspection ----------

    pub fn live_object_count(&self) -> usize {
        self.index_of.len()
    }

    pub fn pending_request_count(&self) -> usize {
        self.requests.len()
    }

    fn slot_mut(&mut self, claim: ClaimHandle) -> Option<&mut SlotRuntime> {
        let &index = self.index_of.get(&claim.object)?;
        self.objects[index].slots.get_mut(claim.slot as usize)
    }
}
