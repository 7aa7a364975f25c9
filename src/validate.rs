//! Name normalization for trial states and study directions.
//!
//! Provides O(1) validation sets and synonym maps so callers of the
//! maintenance binary (and config files) can spell states and directions
//! loosely. Three-tier resolution: exact match → synonym lookup → error
//! with suggestion.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

// ── Valid value sets (O(1) lookups) ──────────────────────────

pub static VALID_STATES: LazyLock<HashSet<&str>> = LazyLock::new(|| {
    ["waiting", "running", "complete", "pruned", "fail"]
        .into_iter()
        .collect()
});

pub static VALID_DIRECTIONS: LazyLock<HashSet<&str>> =
    LazyLock::new(|| ["minimize", "maximize"].into_iter().collect());

// ── Synonym maps ─────────────────────────────────────────────

pub static STATE_SYNONYMS: LazyLock<HashMap<&str, &str>> = LazyLock::new(|| {
    [
        ("queued", "waiting"),
        ("enqueued", "waiting"),
        ("pending", "waiting"),
        ("active", "running"),
        ("started", "running"),
        ("completed", "complete"),
        ("done", "complete"),
        ("finished", "complete"),
        ("succeeded", "complete"),
        ("prune", "pruned"),
        ("stopped", "pruned"),
        ("failed", "fail"),
        ("error", "fail"),
        ("crashed", "fail"),
    ]
    .into_iter()
    .collect()
});

pub static DIRECTION_SYNONYMS: LazyLock<HashMap<&str, &str>> = LazyLock::new(|| {
    [
        ("min", "minimize"),
        ("minimise", "minimize"),
        ("lower", "minimize"),
        ("max", "maximize"),
        ("maximise", "maximize"),
        ("higher", "maximize"),
    ]
    .into_iter()
    .collect()
});

/// Normalize a trial state name via exact match or synonym lookup.
///
/// Returns the canonical lower-case state, or an error with the original
/// input and an optional suggestion.
pub fn normalize_state(input: &str) -> Result<String, (String, Option<String>)> {
    normalize(input, &VALID_STATES, &STATE_SYNONYMS)
}

/// Normalize a study direction name via exact match or synonym lookup.
pub fn normalize_direction(input: &str) -> Result<String, (String, Option<String>)> {
    normalize(input, &VALID_DIRECTIONS, &DIRECTION_SYNONYMS)
}

fn normalize(
    input: &str,
    valid: &HashSet<&str>,
    synonyms: &HashMap<&str, &str>,
) -> Result<String, (String, Option<String>)> {
    let lower = input.trim().to_lowercase();

    // Tier 1: exact match
    if valid.contains(lower.as_str()) {
        return Ok(lower);
    }

    // Tier 2: synonym lookup
    if let Some(&canonical) = synonyms.get(lower.as_str()) {
        return Ok(canonical.to_string());
    }

    // Tier 3: find closest suggestion
    let suggestion = find_closest_match(&lower, valid, synonyms);
    Err((input.to_string(), suggestion))
}

/// Find the closest matching value across valid set and synonyms.
fn find_closest_match(
    input: &str,
    valid: &HashSet<&str>,
    synonyms: &HashMap<&str, &str>,
) -> Option<String> {
    let mut best: Option<(&str, usize)> = None;

    for &v in valid.iter().chain(synonyms.keys()) {
        let dist = levenshtein_distance(input, v);
        if dist <= 3 && best.is_none_or(|(_, d)| dist < d) {
            // For synonyms, show what it maps to
            let shown = synonyms.get(v).copied().unwrap_or(v);
            best = Some((shown, dist));
        }
    }

    best.map(|(v, _)| v.to_string())
}

// ── Levenshtein distance ─────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
#[must_use]
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let a_len = a.len();
    let b_len = b.len();

    if a_len == 0 {
        return b_len;
    }
    if b_len == 0 {
        return a_len;
    }

    // Use single-row optimization (O(min(m,n)) space)
    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for i in 1..=a_len {
        curr[0] = i;
        for j in 1..=b_len {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1) // deletion
                .min(curr[j - 1] + 1) // insertion
                .min(prev[j - 1] + cost); // substitution
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_len]
}

/// Find existing study names similar to the searched one.
///
/// Returns up to `max` suggestions with edit distance ≤ 3,
/// sorted by distance then alphabetically.
#[must_use]
pub fn find_similar_names(searched: &str, existing: &[String], max: usize) -> Vec<String> {
    let mut candidates: Vec<(usize, &str)> = existing
        .iter()
        .map(|name| (levenshtein_distance(searched, name), name.as_str()))
        .filter(|(dist, _)| *dist <= 3)
        .collect();

    candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));

    candidates
        .into_iter()
        .take(max)
        .map(|(_, name)| name.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_state() {
        assert_eq!(normalize_state("running"), Ok("running".to_string()));
        assert_eq!(normalize_state("COMPLETE"), Ok("complete".to_string()));
        assert_eq!(normalize_state("failed"), Ok("fail".to_string()));
        assert_eq!(normalize_state("queued"), Ok("waiting".to_string()));
        assert!(normalize_state("nonsense").is_err());
    }

    #[test]
    fn test_normalize_state_suggestion() {
        let (input, suggestion) = normalize_state("prunned").unwrap_err();
        assert_eq!(input, "prunned");
        assert_eq!(suggestion.as_deref(), Some("pruned"));
    }

    #[test]
    fn test_normalize_direction() {
        assert_eq!(normalize_direction("minimize"), Ok("minimize".to_string()));
        assert_eq!(normalize_direction("MAX"), Ok("maximize".to_string()));
        assert_eq!(normalize_direction(" min "), Ok("minimize".to_string()));
        assert!(normalize_direction("sideways").is_err());
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein_distance("", ""), 0);
        assert_eq!(levenshtein_distance("abc", "abc"), 0);
        assert_eq!(levenshtein_distance("abc", "abd"), 1);
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
    }

    #[test]
    fn test_find_similar_names() {
        let names = vec![
            "mnist-lr".to_string(),
            "mnist-wd".to_string(),
            "resnet-depth".to_string(),
        ];
        let result = find_similar_names("mnist-l", &names, 3);
        assert!(!result.is_empty());
        assert_eq!(result[0], "mnist-lr");
        assert!(!result.contains(&"resnet-depth".to_string()));
    }
}
