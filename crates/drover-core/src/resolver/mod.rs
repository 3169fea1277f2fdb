//! Pure dependency/readiness math over catalog rows.
//!
//! Nothing here touches the catalog or the pools; the scheduler feeds in
//! a snapshot and gets back deterministic orderings.

use std::collections::{HashMap, HashSet};

use drover_catalog::Feature;

/// True iff every dependency of `feature` is in `passing_ids`.
///
/// A dependency id that does not resolve to any feature counts as
/// unsatisfied, so a dangling reference blocks forever instead of
/// silently unblocking.
pub fn are_dependencies_satisfied(feature: &Feature, passing_ids: &HashSet<i64>) -> bool {
    feature.dependencies.iter().all(|id| passing_ids.contains(id))
}

/// Urgency score per feature: the number of features that transitively
/// depend on it. Unblocking a feature with many downstream dependents
/// opens up more of the graph, so it schedules first.
///
/// Total over the input ids and deterministic for a given snapshot.
pub fn compute_scheduling_scores(all: &[Feature]) -> HashMap<i64, i64> {
    // Reverse adjacency: dependency -> features that declare it.
    let known: HashSet<i64> = all.iter().map(|f| f.id).collect();
    let mut dependents: HashMap<i64, Vec<i64>> = HashMap::new();
    for f in all {
        for dep in &f.dependencies {
            if known.contains(dep) {
                dependents.entry(*dep).or_default().push(f.id);
            }
        }
    }

    let mut scores = HashMap::with_capacity(all.len());
    for f in all {
        let mut seen: HashSet<i64> = HashSet::new();
        let mut stack: Vec<i64> = dependents.get(&f.id).cloned().unwrap_or_default();
        while let Some(id) = stack.pop() {
            if seen.insert(id) {
                if let Some(next) = dependents.get(&id) {
                    stack.extend(next.iter().copied());
                }
            }
        }
        scores.insert(f.id, seen.len() as i64);
    }
    scores
}

/// Sort features into the canonical scheduling order:
/// score descending, then priority ascending, then id ascending.
pub fn schedule_order(features: &mut [&Feature], scores: &HashMap<i64, i64>) {
    features.sort_by_key(|f| {
        (
            std::cmp::Reverse(scores.get(&f.id).copied().unwrap_or(0)),
            f.priority,
            f.id,
        )
    });
}

/// Ids of passing features in a snapshot.
pub fn passing_ids(all: &[Feature]) -> HashSet<i64> {
    all.iter().filter(|f| f.passes).map(|f| f.id).collect()
}
