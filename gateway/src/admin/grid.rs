//! Aggregation of grid model generations.
//!
//! Backends answer with line-oriented `producer:geometry:generation`
//! triples. Only tuples present on every backend are trusted; of
//! those, the newest generation per producer/geometry pair is
//! reported.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GridGeneration {
    pub producer: String,
    pub geometry: String,
    pub generation: String,
}

pub fn parse_lines(body: &str) -> Vec<GridGeneration> {
    body.lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(3, ':');
            let producer = parts.next()?.trim();
            let geometry = parts.next()?.trim();
            let generation = parts.next()?.trim();
            if producer.is_empty() || geometry.is_empty() || generation.is_empty() {
                return None;
            }
            Some(GridGeneration {
                producer: producer.to_string(),
                geometry: geometry.to_string(),
                generation: generation.to_string(),
            })
        })
        .collect()
}

/// Keeps tuples reported by all `backend_count` backends, then picks
/// the newest generation per producer/geometry pair.
pub fn cluster_generations(
    backend_listings: Vec<Vec<GridGeneration>>,
) -> Vec<GridGeneration> {
    let backend_count = backend_listings.len();
    if backend_count == 0 {
        return Vec::new();
    }

    let mut seen_on: HashMap<GridGeneration, usize> = HashMap::new();
    for listing in backend_listings {
        let unique: HashSet<GridGeneration> = listing.into_iter().collect();
        for tuple in unique {
            *seen_on.entry(tuple).or_insert(0) += 1;
        }
    }

    let mut newest: BTreeMap<(String, String), String> = BTreeMap::new();
    for (tuple, count) in seen_on {
        if count != backend_count {
            continue;
        }
        let key = (tuple.producer, tuple.geometry);
        match newest.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(tuple.generation);
            }
            Entry::Occupied(mut slot) => {
                if *slot.get() < tuple.generation {
                    slot.insert(tuple.generation);
                }
            }
        }
    }

    newest
        .into_iter()
        .map(|((producer, geometry), generation)| GridGeneration {
            producer,
            geometry,
            generation,
        })
        .collect()
}
