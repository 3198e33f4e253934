//! Pure derivations over rows read from the store. Nothing here caches or
//! writes; callers re-read and re-derive on every change signal.

use std::collections::{HashMap, HashSet};

use shared::domain::{Intention, PlaceId, PlaceTally, SelectedPlace, Selection, Vote};

/// The place every current participant voted for, if any.
///
/// Strict unanimity: a place wins only when its vote count equals
/// `participant_count`. Places are considered in the order their first vote
/// was cast.
pub fn unanimous_winner(votes: &[Vote], participant_count: usize) -> Option<PlaceId> {
    if participant_count == 0 {
        return None;
    }
    let mut order: Vec<&PlaceId> = Vec::new();
    let mut counts: HashMap<&PlaceId, usize> = HashMap::new();
    for vote in votes {
        let count = counts.entry(&vote.place_id).or_insert_with(|| {
            order.push(&vote.place_id);
            0
        });
        *count += 1;
    }
    order
        .into_iter()
        .find(|place_id| counts.get(place_id).copied() == Some(participant_count))
        .cloned()
}

/// Union of every participant's selection keyed by place id, in first-seen order.
pub fn candidate_places(selections: &[Selection]) -> Vec<SelectedPlace> {
    let mut seen = HashSet::new();
    selections
        .iter()
        .flat_map(|selection| selection.places.iter())
        .filter(|place| seen.insert(place.id.clone()))
        .cloned()
        .collect()
}

pub fn tally_votes(candidates: &[SelectedPlace], votes: &[Vote]) -> Vec<PlaceTally> {
    candidates
        .iter()
        .map(|place| PlaceTally {
            place_id: place.id.clone(),
            votes: votes.iter().filter(|v| v.place_id == place.id).count(),
        })
        .collect()
}

/// One `name: task` line per intention.
pub fn merge_intentions(intentions: &[Intention]) -> String {
    intentions
        .iter()
        .map(|intention| format!("{}: {}", intention.display_name(), intention.task_description))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
#[path = "tests/derive_tests.rs"]
mod tests;
