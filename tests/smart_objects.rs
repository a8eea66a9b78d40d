use bevy_ecs::prelude::Entity;
use glam::Vec2;
use goshawk::config::SearchConfig;
use goshawk::external::SmartObjectUser;
use goshawk::smart_objects::{ClaimOutcome, SlotState, SmartObjectRegistry};

fn registry() -> SmartObjectRegistry {
    SmartObjectRegistry::new(&SearchConfig::default())
}

fn entity(index: u32) -> Entity {
    Entity::from_raw(index)
}

#[test]
fn search_is_a_two_call_protocol() {
    let mut registry = registry();
    registry.register_object(Vec2::new(10.0, 0.0), 1);
    registry.register_object(Vec2::new(2.0, 0.0), 1);
    registry.register_object(Vec2::new(5.0, 0.0), 1);

    let request = registry.find_candidates_async(entity(0), Vec2::ZERO);

    // Same tick: issued but not yet processed.
    let result = registry.request_result(request).unwrap();
    assert!(!result.processed);
    assert!(result.candidates.is_empty());

    registry.process_requests();

    let result = registry.request_result(request).unwrap();
    assert!(result.processed);
    let costs: Vec<f32> = result.candidates.iter().map(|c| c.cost).collect();
    assert_eq!(costs, vec![4.0, 25.0, 100.0]);

    assert!(registry.remove_request(request));
    assert!(registry.request_result(request).is_none());
    // Removing again is safe.
    assert!(!registry.remove_request(request));
}

#[test]
fn claim_takes_the_cheapest_free_candidate() {
    let mut registry = registry();
    let far = registry.register_object(Vec2::new(9.0, 0.0), 1);
    let near = registry.register_object(Vec2::new(1.0, 0.0), 1);

    let request = registry.find_candidates_async(entity(0), Vec2::ZERO);
    assert_eq!(registry.claim_candidate(entity(1), request), ClaimOutcome::UnprocessedRequest);

    registry.process_requests();
    match registry.claim_candidate(entity(1), request) {
        ClaimOutcome::Claimed(claim) => {
            assert_eq!(claim.object, near);
            assert_eq!(registry.slot_state(near, 0), Some(SlotState::Claimed));
            assert_eq!(registry.slot_state(far, 0), Some(SlotState::Free));
        }
        other => panic!("expected a claim, got {other:?}"),
    }
}

#[test]
fn invalid_request_is_reported() {
    let mut registry = registry();
    let request = registry.find_candidates_async(entity(0), Vec2::ZERO);
    registry.remove_request(request);
    assert_eq!(registry.claim_candidate(entity(1), request), ClaimOutcome::InvalidRequest);
}

#[test]
fn single_slot_races_have_exactly_one_winner() {
    let mut registry = registry();
    let object = registry.register_object(Vec2::ZERO, 1);

    let first_request = registry.find_candidates_async(entity(1), Vec2::new(1.0, 0.0));
    let second_request = registry.find_candidates_async(entity(2), Vec2::new(-1.0, 0.0));
    registry.process_requests();

    let first = registry.claim_candidate(entity(1), first_request);
    let second = registry.claim_candidate(entity(2), second_request);

    assert!(matches!(first, ClaimOutcome::Claimed(_)));
    assert_eq!(second, ClaimOutcome::NoAvailableCandidate);
    assert_eq!(registry.slot_state(object, 0), Some(SlotState::Claimed));
}

#[test]
fn claim_use_release_walks_the_slot_state_machine() {
    let mut registry = registry();
    let object = registry.register_object(Vec2::ZERO, 1);

    let claim = registry.claim_slot(object, entity(7)).unwrap();
    assert!(registry.is_claim_valid(claim));
    assert_eq!(registry.slot_state(object, 0), Some(SlotState::Claimed));

    assert!(registry.use_slot(claim));
    assert_eq!(registry.slot_state(object, 0), Some(SlotState::Occupied));
    assert!(registry.is_claim_valid(claim));

    assert!(registry.release_slot(claim, false));
    assert_eq!(registry.slot_state(object, 0), Some(SlotState::Free));
    assert!(!registry.is_claim_valid(claim));

    // Idempotent: releasing an already-free slot is a no-op.
    assert!(!registry.release_slot(claim, false));
    assert_eq!(registry.slot_state(object, 0), Some(SlotState::Free));
}

#[test]
fn abort_before_use_frees_the_slot_directly() {
    let mut registry = registry();
    let object = registry.register_object(Vec2::ZERO, 1);
    let user = entity(3);

    let claim = registry.claim_slot(object, user).unwrap();
    assert!(registry.release_slot(claim, true));
    assert_eq!(registry.slot_state(object, 0), Some(SlotState::Free));

    // The holder aborted itself, so the notice lands in its own inbox.
    let invalidations = registry.take_invalidations(user);
    assert_eq!(invalidations.len(), 1);
    assert_eq!(invalidations[0], claim);
}

#[test]
fn two_users_cannot_hold_the_same_slot() {
    let mut registry = registry();
    let object = registry.register_object(Vec2::ZERO, 2);

    let first = registry.claim_slot(object, entity(1)).unwrap();
    let second = registry.claim_slot(object, entity(2)).unwrap();
    assert_ne!(first.slot, second.slot);

    // Both slots taken; a third user finds nothing.
    assert!(registry.claim_slot(object, entity(3)).is_none());
}

#[test]
fn destroying_an_object_invalidates_its_holders() {
    let mut registry = registry();
    let object = registry.register_object(Vec2::ZERO, 1);
    let user = entity(4);

    let claim = registry.claim_slot(object, user).unwrap();
    assert!(registry.use_slot(claim));

    assert!(registry.unregister_object(object));
    assert_eq!(registry.live_object_count(), 0);
    assert!(!registry.is_claim_valid(claim));

    let invalidations = registry.take_invalidations(user);
    assert_eq!(invalidations.len(), 1);
    assert_eq!(invalidations[0].object, object);

    // Second drain comes back empty; the notice fires exactly once.
    assert!(registry.take_invalidations(user).is_empty());
    // The dead object is no longer claimable.
    assert!(registry.claim_slot(object, user).is_none());
}

#[test]
fn full_objects_drop_out_of_search_results() {
    let mut registry = registry();
    let near = registry.register_object(Vec2::new(1.0, 0.0), 1);
    let far = registry.register_object(Vec2::new(5.0, 0.0), 1);

    let claim = registry.claim_slot(near, entity(1)).unwrap();
    let request = registry.find_candidates_async(entity(0), Vec2::ZERO);
    registry.process_requests();

    let result = registry.request_result(request).unwrap();
    assert_eq!(result.candidates.len(), 1);
    assert_eq!(result.candidates[0].object, far);

    registry.release_slot(claim, false);
}

#[test]
fn candidate_buffer_stops_at_the_configured_cap() {
    let config = SearchConfig { max_candidates: 4, ..SearchConfig::default() };
    let mut registry = SmartObjectRegistry::new(&config);
    for i in 0..10 {
        registry.register_object(Vec2::new(i as f32, 0.0), 1);
    }
    let request = registry.find_candidates_async(entity(0), Vec2::ZERO);
    registry.process_requests();

    let result = registry.request_result(request).unwrap();
    assert_eq!(result.candidates.len(), 4);
    // Still ranked ascending within what was found.
    let costs: Vec<f32> = result.candidates.iter().map(|c| c.cost).collect();
    let mut sorted = costs.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(costs, sorted);
}

#[test]
fn teardown_releases_everything_a_user_held() {
    let mut registry = registry();
    let object_a = registry.register_object(Vec2::ZERO, 1);
    let object_b = registry.register_object(Vec2::new(3.0, 0.0), 1);
    let user = entity(6);

    let claim_a = registry.claim_slot(object_a, user).unwrap();
    registry.use_slot(claim_a);
    registry.claim_slot(object_b, user).unwrap();
    registry.find_candidates_async(user, Vec2::ZERO);

    assert_eq!(registry.release_all_for_user(user), 2);
    assert_eq!(registry.slot_state(object_a, 0), Some(SlotState::Free));
    assert_eq!(registry.slot_state(object_b, 0), Some(SlotState::Free));
    assert_eq!(registry.pending_request_count(), 0);
    // No invalidation notices for a holder that is going away.
    assert!(registry.take_invalidations(user).is_empty());
}

#[test]
fn search_cooldown_throttles_retries() {
    let mut registry = registry();
    registry.register_object(Vec2::ZERO, 1);
    let mut user = SmartObjectUser::default();

    assert!(registry.begin_search(entity(9), &mut user, Vec2::ZERO, 0.0).is_some());
    assert!(registry.begin_search(entity(9), &mut user, Vec2::ZERO, 0.5).is_none());
    assert!(registry.begin_search(entity(9), &mut user, Vec2::ZERO, 1.5).is_some());
}
