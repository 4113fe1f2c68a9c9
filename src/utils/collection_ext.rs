//! Collection helpers shared across the pipeline stages.

use std::collections::HashSet;
use std::hash::Hash;

/// Deduplicate preserving first-occurrence order.
///
/// Table detection and retrieval both promise "unique, preserving match
/// order"; this is the single implementation of that contract.
#[inline]
pub fn unique_ordered<T>(items: Vec<T>) -> Vec<T>
where
    T: Eq + Hash + Clone,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_first_occurrence() {
        let items = vec!["accounts", "customers", "accounts", "branches", "customers"];
        assert_eq!(unique_ordered(items), vec!["accounts", "customers", "branches"]);
    }

    #[test]
    fn empty_is_empty() {
        let items: Vec<String> = vec![];
        assert!(unique_ordered(items).is_empty());
    }
}
