//! Key-behavior canonicalization.
//!
//! The extraction model is asked to echo the dictionary's key-behavior text
//! back, but it often adds numbering ("1. ..."), changes case, or returns a
//! fragment. Evidence rows should carry the dictionary's official text
//! whenever a match can be established.
//!
//! Tie-break rules:
//! - an exact normalized match always wins;
//! - otherwise containment in either direction qualifies, and among multiple
//!   containment candidates the longest official text wins.

/// Normalizes a key-behavior string for comparison: strips leading bullet
/// characters and numbering, trims, and case-folds.
pub fn normalize_kb(raw: &str) -> String {
    let mut s = raw.trim();

    s = s.trim_start_matches(['-', '*', '\u{2022}', '\u{2013}']).trim_start();

    // Leading numbering: "3.", "3)", "(3)", "3:"
    let unparenthesized = s.trim_start_matches('(');
    let after_digits = unparenthesized.trim_start_matches(|c: char| c.is_ascii_digit());
    if after_digits.len() < unparenthesized.len() {
        s = after_digits.trim_start_matches([')', '.', ':']).trim_start();
    }

    s.to_lowercase()
}

/// Maps a raw key-behavior string to the official dictionary text, or `None`
/// when no tolerant match exists (the caller then keeps the raw text).
pub fn canonicalize<'a>(raw: &str, official: &'a [String]) -> Option<&'a str> {
    let norm = normalize_kb(raw);
    if norm.is_empty() {
        return None;
    }

    if let Some(exact) = official.iter().find(|o| normalize_kb(o) == norm) {
        return Some(exact.as_str());
    }

    official
        .iter()
        .filter(|o| {
            let o_norm = normalize_kb(o);
            !o_norm.is_empty() && (o_norm.contains(&norm) || norm.contains(&o_norm))
        })
        .max_by_key(|o| normalize_kb(o).len())
        .map(|o| o.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn officials(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_normalize_strips_numbering_and_bullets() {
        assert_eq!(normalize_kb("1. Identifies the core issue"), "identifies the core issue");
        assert_eq!(normalize_kb("2) Gathers relevant facts"), "gathers relevant facts");
        assert_eq!(normalize_kb("(3) Weighs trade-offs"), "weighs trade-offs");
        assert_eq!(normalize_kb("- Generates alternatives"), "generates alternatives");
        assert_eq!(normalize_kb("\u{2022} Listens actively"), "listens actively");
    }

    #[test]
    fn test_normalize_preserves_inner_digits() {
        assert_eq!(normalize_kb("Handles 3 priorities at once"), "handles 3 priorities at once");
    }

    #[test]
    fn test_exact_match_is_case_insensitive() {
        let official = officials(&["Identifies the core issue"]);
        assert_eq!(
            canonicalize("identifies THE core issue", &official),
            Some("Identifies the core issue")
        );
    }

    #[test]
    fn test_containment_both_directions() {
        let official = officials(&["Gathers relevant facts before deciding"]);
        // Raw is a fragment of the official text.
        assert_eq!(
            canonicalize("gathers relevant facts", &official),
            Some("Gathers relevant facts before deciding")
        );
        // Raw contains the official text.
        let official = officials(&["Weighs trade-offs"]);
        assert_eq!(
            canonicalize("carefully weighs trade-offs between options", &official),
            Some("Weighs trade-offs")
        );
        assert_eq!(
            canonicalize("3. Weighs trade-offs", &official),
            Some("Weighs trade-offs")
        );
    }

    #[test]
    fn test_raw_containing_official_matches() {
        let official = officials(&["core issue"]);
        assert_eq!(canonicalize("Identifies the core issue", &official), Some("core issue"));
    }

    #[test]
    fn test_exact_beats_containment() {
        let official = officials(&["Weighs trade-offs between options", "Weighs trade-offs"]);
        assert_eq!(
            canonicalize("weighs trade-offs", &official),
            Some("Weighs trade-offs")
        );
    }

    #[test]
    fn test_longest_containment_wins() {
        let official = officials(&["facts", "relevant facts"]);
        assert_eq!(
            canonicalize("Gathers relevant facts", &official),
            Some("relevant facts")
        );
    }

    #[test]
    fn test_no_match_returns_none() {
        let official = officials(&["Identifies the core issue"]);
        assert_eq!(canonicalize("Delegates effectively", &official), None);
        assert_eq!(canonicalize("   ", &official), None);
    }
}
