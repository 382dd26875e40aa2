//! Minority-class oversampling for the training split

use std::collections::HashSet;

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use super::bag::{Bag, BagId, BagStore};
use crate::utils::error::Result;

/// Duplicate randomly chosen minority-class bags until both primary-label
/// classes have the same number of bags
///
/// Duplicates get fresh identifiers that collide with neither `store` nor
/// `reserved` (the validation split): `max integer id + 1, + 2, ...` across
/// both stores when the store has integer ids, `"<id>#dupN"` otherwise. A
/// store with a single class is returned unchanged.
pub fn oversample_minority(store: &BagStore, reserved: &BagStore, seed: u64) -> Result<BagStore> {
    let (negative, positive): (Vec<&Bag>, Vec<&Bag>) = store.iter().partition(|b| b.is_negative());

    if negative.is_empty() || positive.is_empty() || negative.len() == positive.len() {
        return Ok(store.clone());
    }

    let (minority, majority_len) = if negative.len() < positive.len() {
        (negative, positive.len())
    } else {
        (positive, negative.len())
    };
    let needed = majority_len - minority.len();

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut next_int = store.iter().filter_map(|b| b.id.as_int()).max().map(|train_max| {
        reserved
            .iter()
            .filter_map(|b| b.id.as_int())
            .fold(train_max, i64::max)
    });
    let mut bags: Vec<Bag> = store.bags().to_vec();
    let mut minted = HashSet::new();

    for n in 0..needed {
        let source = minority[rng.gen_range(0..minority.len())];
        let id = match next_int.as_mut() {
            Some(max) => {
                *max += 1;
                BagId::Int(*max)
            }
            None => fresh_text_id(&source.id, n + 1, |id| {
                store.contains(id) || reserved.contains(id) || minted.contains(id)
            }),
        };
        minted.insert(id.clone());

        bags.push(Bag {
            id,
            ..source.clone()
        });
    }

    info!(
        "Oversampled minority class: added {} bags ({} -> {})",
        needed,
        store.len(),
        bags.len()
    );
    BagStore::from_bags(bags)
}

/// First `"<id>#dupN"` at or after `n` that is not taken
fn fresh_text_id(source: &BagId, mut n: usize, taken: impl Fn(&BagId) -> bool) -> BagId {
    loop {
        let id = BagId::Text(format!("{}#dup{}", source, n));
        if !taken(&id) {
            return id;
        }
        n += 1;
    }
}
