//! Minimum hitting set over affected-version lists.
//!
//! Given one list of affected versions per vulnerability, selects the smallest
//! set of versions that covers every list. Among minimum covers, the sum of
//! version dates is maximized so newer revisions are preferred.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::debug;

/// Search nodes allowed per stage before giving up on proving optimality.
const NODE_BUDGET: u64 = 5_000_000;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("input list {list} is empty and can never be hit")]
    UncoverableList { list: usize },
    #[error("version {version:?} has no date")]
    MissingDate { version: String },
    #[error("stage {stage}/2 exhausted its search budget before proving optimality")]
    BudgetExhausted { stage: u8 },
}

/// Solve the two-stage hitting set problem.
///
/// Stage 1 finds the minimum number of versions covering every list. Stage 2
/// re-searches with the cardinality fixed at that optimum and maximizes the
/// total date. The returned versions are sorted.
pub fn solve_hitting_set(
    lists: &[Vec<String>],
    version_dates: &BTreeMap<String, i64>,
) -> Result<Vec<String>, SolverError> {
    if lists.is_empty() {
        return Ok(Vec::new());
    }

    // Sorted universe gives a canonical variable ordering, which keeps
    // tie-breaking deterministic across runs.
    let mut universe = BTreeSet::new();
    for (i, list) in lists.iter().enumerate() {
        if list.is_empty() {
            return Err(SolverError::UncoverableList { list: i });
        }
        for version in list {
            if !version_dates.contains_key(version) {
                return Err(SolverError::MissingDate {
                    version: version.clone(),
                });
            }
            universe.insert(version.clone());
        }
    }
    let versions: Vec<String> = universe.into_iter().collect();
    let index: BTreeMap<&str, usize> = versions
        .iter()
        .enumerate()
        .map(|(i, v)| (v.as_str(), i))
        .collect();
    let dates: Vec<i64> = versions.iter().map(|v| version_dates[v]).collect();

    let sets: Vec<Vec<usize>> = lists
        .iter()
        .map(|list| {
            let mut set: Vec<usize> = list.iter().map(|v| index[v.as_str()]).collect();
            set.sort_unstable();
            set.dedup();
            set
        })
        .collect();

    let mut budget = NODE_BUDGET;
    let min_size = minimum_cover_size(&sets, &mut budget)
        .ok_or(SolverError::BudgetExhausted { stage: 1 })?;

    let mut budget = NODE_BUDGET;
    let chosen = best_cover_of_size(&sets, &dates, min_size, &mut budget)
        .ok_or(SolverError::BudgetExhausted { stage: 2 })?;

    let hitting_set: Vec<String> = chosen.iter().map(|&i| versions[i].clone()).collect();
    debug!(size = hitting_set.len(), "hitting set solved");
    Ok(hitting_set)
}

/// Cache key for a solver invocation: blake3 of the canonical JSON form of the
/// inputs. Any permutation of the lists, of the versions within a list, or of
/// the date entries produces the same key.
pub fn cache_key(lists: &[Vec<String>], version_dates: &BTreeMap<String, i64>) -> String {
    let mut sorted_lists: Vec<Vec<&String>> = lists
        .iter()
        .map(|list| {
            let mut sorted: Vec<&String> = list.iter().collect();
            sorted.sort();
            sorted
        })
        .collect();
    sorted_lists.sort();
    // BTreeMap iteration is already ordered by version.
    let sorted_dates: Vec<(&String, i64)> = version_dates.iter().map(|(v, &d)| (v, d)).collect();
    let payload = serde_json::to_string(&(sorted_lists, sorted_dates))
        .expect("solver inputs are always serializable");
    blake3::hash(payload.as_bytes()).to_hex().to_string()
}

/// Stage 1: minimum cardinality of a cover, by branch and bound. A greedy
/// cover seeds the upper bound, so `best` is always achievable.
fn minimum_cover_size(sets: &[Vec<usize>], budget: &mut u64) -> Option<usize> {
    let mut best = greedy_cover_size(sets);
    let mut chosen = Vec::new();
    search_min(sets, &mut chosen, &mut best, budget);
    if *budget == 0 {
        return None;
    }
    Some(best)
}

fn search_min(sets: &[Vec<usize>], chosen: &mut Vec<usize>, best: &mut usize, budget: &mut u64) {
    if *budget == 0 {
        return;
    }
    *budget -= 1;

    let uncovered = match pick_uncovered(sets, chosen) {
        Some(set) => set,
        None => {
            if chosen.len() < *best {
                *best = chosen.len();
            }
            return;
        }
    };
    // Any completion from here needs at least one more version.
    if chosen.len() + 1 >= *best {
        return;
    }
    for &candidate in uncovered {
        chosen.push(candidate);
        search_min(sets, chosen, best, budget);
        chosen.pop();
    }
}

/// Stage 2: among covers of exactly `size` versions, maximize the date sum.
fn best_cover_of_size(
    sets: &[Vec<usize>],
    dates: &[i64],
    size: usize,
    budget: &mut u64,
) -> Option<Vec<usize>> {
    let max_date = dates.iter().copied().max().unwrap_or(0);
    let mut chosen = Vec::new();
    let mut best: Option<(i64, Vec<usize>)> = None;
    search_best(sets, dates, size, max_date, &mut chosen, &mut best, budget);
    if *budget == 0 {
        return None;
    }
    best.map(|(_, mut cover)| {
        cover.sort_unstable();
        cover
    })
}

fn search_best(
    sets: &[Vec<usize>],
    dates: &[i64],
    size: usize,
    max_date: i64,
    chosen: &mut Vec<usize>,
    best: &mut Option<(i64, Vec<usize>)>,
    budget: &mut u64,
) {
    if *budget == 0 {
        return;
    }
    *budget -= 1;

    let sum: i64 = chosen.iter().map(|&i| dates[i]).sum();
    let uncovered = match pick_uncovered(sets, chosen) {
        Some(set) => set,
        None => {
            // Every minimum cover has exactly `size` elements, so a complete
            // cover here cannot be smaller.
            if best.as_ref().map(|(s, _)| sum > *s).unwrap_or(true) {
                *best = Some((sum, chosen.clone()));
            }
            return;
        }
    };
    if chosen.len() >= size {
        return;
    }
    // Even filling the remaining slots with the newest date cannot beat the
    // incumbent: prune.
    let remaining = (size - chosen.len()) as i64;
    if let Some((incumbent, _)) = best {
        if sum + remaining * max_date <= *incumbent {
            return;
        }
    }
    for &candidate in uncovered {
        chosen.push(candidate);
        search_best(sets, dates, size, max_date, chosen, best, budget);
        chosen.pop();
    }
}

/// First set not hit by the current choice, preferring the one with the
/// fewest candidates to keep the branching factor small.
fn pick_uncovered<'a>(sets: &'a [Vec<usize>], chosen: &[usize]) -> Option<&'a Vec<usize>> {
    sets.iter()
        .filter(|set| !set.iter().any(|v| chosen.contains(v)))
        .min_by_key(|set| set.len())
}

fn greedy_cover_size(sets: &[Vec<usize>]) -> usize {
    let mut chosen: Vec<usize> = Vec::new();
    loop {
        let uncovered: Vec<&Vec<usize>> = sets
            .iter()
            .filter(|set| !set.iter().any(|v| chosen.contains(v)))
            .collect();
        if uncovered.is_empty() {
            return chosen.len();
        }
        // Pick the version hitting the most uncovered sets; lowest index wins
        // ties for determinism.
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for set in &uncovered {
            for &v in *set {
                *counts.entry(v).or_insert(0) += 1;
            }
        }
        let (&pick, _) = counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .expect("uncovered sets are non-empty");
        chosen.push(pick);
    }
}
