//! String comparison used by the normalized and fuzzy tiers.

use strsim::{jaro_winkler, normalized_levenshtein};

/// Lowercase, `&` spelled out, punctuation dropped, whitespace collapsed and
/// a leading "the " removed.
pub fn normalize_for_match(title: &str) -> String {
    let lower = title.to_lowercase().replace('&', " and ");
    let cleaned: String = lower
        .chars()
        .filter_map(|c| match c {
            '\'' | '’' => None,
            c if c.is_alphanumeric() || c.is_whitespace() => Some(c),
            _ => Some(' '),
        })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.strip_prefix("the ") {
        Some(rest) => rest.to_string(),
        None => collapsed,
    }
}

/// Normalized Levenshtein similarity of the two titles with their tokens
/// sorted, so word order does not matter ("Godfather Part II, The").
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    fn sorted(s: &str) -> String {
        let mut tokens: Vec<&str> = s.split_whitespace().collect();
        tokens.sort_unstable();
        tokens.join(" ")
    }
    let a = sorted(&normalize_for_match(a));
    let b = sorted(&normalize_for_match(b));
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    normalized_levenshtein(&a, &b)
}

/// Loose person-name comparison for director tie-breaks. Matching surnames
/// count, so "F. W. Murnau" agrees with "Friedrich Wilhelm Murnau".
pub fn same_person(hint: &str, name: &str) -> bool {
    let hint = normalize_for_match(hint);
    let name = normalize_for_match(name);
    if hint.is_empty() || name.is_empty() {
        return false;
    }
    if jaro_winkler(&hint, &name) >= 0.92 {
        return true;
    }
    match (hint.split_whitespace().last(), name.split_whitespace().last()) {
        (Some(a), Some(b)) => a.len() > 2 && a == b,
        _ => false,
    }
}
