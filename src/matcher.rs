//! Theorem name matching (informal student names → canonical names)
//!
//! Students write theorem names loosely ("radius equal", "Isosceles Base
//! Angles!"). The matcher maps them onto the engine's canonical registry with
//! a four-tier cascade, first hit wins:
//!
//! 1. exact equality of the normalized name,
//! 2. substring containment in either direction (registry order),
//! 3. keyword overlap of ≥ 2 underscore-delimited tokens, tie-broken by
//!    overlap count then alphabetically,
//! 4. Ratcliff–Obershelp similarity ≥ 0.6, picking the maximum.
//!
//! `None` means the name resolves to nothing; callers report `unknown_theorem`.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::BTreeSet;

/// Similarity acceptance threshold for the final tier.
const SIMILARITY_FLOOR: f64 = 0.6;

/// Lowercase, collapse non-alphanumeric runs to `_`, trim `_`.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Resolve a student's informal theorem name against the registry.
pub fn match_theorem<'a>(student: &str, registry: &[&'a str]) -> Option<&'a str> {
    if student.trim().is_empty() || registry.is_empty() {
        return None;
    }
    let normalized = normalize_name(student);
    if normalized.is_empty() {
        return None;
    }

    // Tier 1: exact.
    if let Some(hit) = registry.iter().find(|t| **t == normalized) {
        return Some(hit);
    }

    // Tier 2: substring either direction.
    if let Some(hit) = registry
        .iter()
        .find(|t| t.contains(&normalized) || normalized.contains(*t))
    {
        return Some(hit);
    }

    // Tier 3: keyword overlap ≥ 2.
    let student_keys: BTreeSet<&str> = normalized.split('_').filter(|k| !k.is_empty()).collect();
    let mut best_overlap: Option<(usize, &str)> = None;
    for t in registry {
        let keys: BTreeSet<&str> = t.split('_').collect();
        let overlap = student_keys.intersection(&keys).count();
        if overlap >= 2 {
            let better = match best_overlap {
                None => true,
                Some((n, name)) => overlap > n || (overlap == n && *t < name),
            };
            if better {
                best_overlap = Some((overlap, t));
            }
        }
    }
    if let Some((_, hit)) = best_overlap {
        return Some(hit);
    }

    // Tier 4: similarity.
    let mut best: Option<(f64, &str)> = None;
    for t in registry {
        let score = ratcliff_obershelp(&normalized, t);
        let better = match best {
            None => score >= SIMILARITY_FLOOR,
            Some((s, _)) => score > s,
        };
        if better {
            best = Some((score, t));
        }
    }
    best.and_then(|(s, t)| (s >= SIMILARITY_FLOOR).then_some(t))
}

/// Ratcliff–Obershelp similarity: `2·M / (|a| + |b|)` where `M` sums the
/// longest common substring and, recursively, the matches on both flanks.
pub fn ratcliff_obershelp(a: &str, b: &str) -> f64 {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matched_len(a, b) as f64 / total as f64
}

fn matched_len(a: &[u8], b: &[u8]) -> usize {
    let (i, j, len) = longest_common_substring(a, b);
    if len == 0 {
        return 0;
    }
    len + matched_len(&a[..i], &b[..j]) + matched_len(&a[i + len..], &b[j + len..])
}

fn longest_common_substring(a: &[u8], b: &[u8]) -> (usize, usize, usize) {
    if a.is_empty() || b.is_empty() {
        return (0, 0, 0);
    }
    let mut best = (0usize, 0usize, 0usize);
    // Rolling DP row: run[j] = common suffix length ending at a[i-1], b[j-1].
    let mut prev = vec![0usize; b.len() + 1];
    for i in 1..=a.len() {
        let mut row = vec![0usize; b.len() + 1];
        for j in 1..=b.len() {
            if a[i - 1] == b[j - 1] {
                let run = prev[j - 1] + 1;
                row[j] = run;
                if run > best.2 {
                    best = (i - run, j - run, run);
                }
            }
        }
        prev = row;
    }
    best
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &[&str] = &[
        "circle_property_radius_equal",
        "congruent_triangle_property_angle_equal",
        "congruent_triangle_property_line_equal",
        "diameter_of_circle_property_right_angle",
        "isosceles_triangle_judgment_two_sides_equal",
        "isosceles_triangle_property_angle_equal",
        "right_triangle_judgment_angle",
        "triangle_property_angle_sum",
    ];

    #[test]
    fn normalization_collapses_punctuation() {
        assert_eq!(normalize_name("Isosceles Base Angles!"), "isosceles_base_angles");
        assert_eq!(normalize_name("  radius -- equal  "), "radius_equal");
        assert_eq!(normalize_name("TriangleAngleSum"), "triangleanglesum");
    }

    #[test]
    fn exact_match_wins() {
        assert_eq!(
            match_theorem("triangle_property_angle_sum", REGISTRY),
            Some("triangle_property_angle_sum")
        );
    }

    #[test]
    fn substring_match_both_directions() {
        assert_eq!(
            match_theorem("radius equal", REGISTRY),
            Some("circle_property_radius_equal")
        );
        assert_eq!(
            match_theorem("two sides equal", REGISTRY),
            Some("isosceles_triangle_judgment_two_sides_equal")
        );
    }

    #[test]
    fn keyword_overlap_prefers_count_then_alphabetical() {
        // {isosceles, triangle, equal} overlaps both isosceles theorems with
        // three keywords; the judgment form sorts first.
        assert_eq!(
            match_theorem("isosceles triangle equal", REGISTRY),
            Some("isosceles_triangle_judgment_two_sides_equal")
        );
        // {angle, sum, property} overlaps the sum theorem on three keywords,
        // beating the two-keyword property theorems.
        assert_eq!(
            match_theorem("angle sum property", REGISTRY),
            Some("triangle_property_angle_sum")
        );
    }

    #[test]
    fn similarity_tier_catches_fused_spellings() {
        assert_eq!(
            match_theorem("trianglepropertyanglesum", REGISTRY),
            Some("triangle_property_angle_sum")
        );
    }

    #[test]
    fn no_match_returns_none() {
        assert_eq!(match_theorem("magic_angle_thm", REGISTRY), None);
        assert_eq!(match_theorem("", REGISTRY), None);
        assert_eq!(match_theorem("!!", REGISTRY), None);
    }

    #[test]
    fn similarity_is_symmetric_enough() {
        let s = ratcliff_obershelp("abcd", "abcd");
        assert!((s - 1.0).abs() < 1e-12);
        assert_eq!(ratcliff_obershelp("", ""), 1.0);
        assert_eq!(ratcliff_obershelp("abc", "xyz"), 0.0);
    }
}
