//! Version string comparison.
//!
//! Real-world version strings are messy: "v2.1.0", "1.85", "unknown",
//! Debian revisions, JetBrains build numbers. Strict semver is preferred
//! when both sides parse; everything else falls back to comparing the
//! embedded digit runs left to right with zero padding, so "1.10" beats
//! "1.9" and "1.0" equals "1.0.0".

use std::cmp::Ordering;

/// Extracts the numeric components of a version string. Unparseable or
/// placeholder strings normalize to `[0]` so they sort before anything
/// real.
pub fn normalize(version: &str) -> Vec<u64> {
    let trimmed = version.trim().trim_start_matches(['v', 'V']);
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("unknown")
        || trimmed.eq_ignore_ascii_case("none")
    {
        return vec![0];
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    for c in trimmed.chars() {
        if c.is_ascii_digit() {
            current.push(c);
        } else if !current.is_empty() {
            // Very long digit runs (dates, hashes) saturate rather than wrap.
            parts.push(current.parse().unwrap_or(u64::MAX));
            current.clear();
        }
    }
    if !current.is_empty() {
        parts.push(current.parse().unwrap_or(u64::MAX));
    }

    if parts.is_empty() {
        vec![0]
    } else {
        parts
    }
}

/// Compares two version strings, semver when both sides parse as semver,
/// digit-tuple comparison otherwise.
pub fn compare(a: &str, b: &str) -> Ordering {
    let a_clean = a.trim().trim_start_matches(['v', 'V']);
    let b_clean = b.trim().trim_start_matches(['v', 'V']);

    if let (Ok(a_sem), Ok(b_sem)) = (
        semver::Version::parse(a_clean),
        semver::Version::parse(b_clean),
    ) {
        return a_sem.cmp(&b_sem);
    }

    let a_parts = normalize(a);
    let b_parts = normalize(b);
    let len = a_parts.len().max(b_parts.len());
    for i in 0..len {
        let a_n = a_parts.get(i).copied().unwrap_or(0);
        let b_n = b_parts.get(i).copied().unwrap_or(0);
        match a_n.cmp(&b_n) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Whether `candidate` is strictly newer than `installed`.
pub fn is_newer(candidate: &str, installed: &str) -> bool {
    compare(candidate, installed) == Ordering::Greater
}

/// Compares JetBrains-style build identifiers ("223.8836.35", possibly
/// prefixed with a product code like "AI-"). Segments are numeric, so
/// plain digit-tuple comparison applies after stripping the prefix.
pub fn compare_builds(a: &str, b: &str) -> Ordering {
    let strip = |s: &str| -> Vec<u64> {
        let numeric = s.rsplit('-').next().unwrap_or(s);
        numeric
            .split('.')
            .map(|part| part.parse().unwrap_or(0))
            .collect()
    };

    let a_parts = strip(a);
    let b_parts = strip(b);
    let len = a_parts.len().max(b_parts.len());
    for i in 0..len {
        let a_n = a_parts.get(i).copied().unwrap_or(0);
        let b_n = b_parts.get(i).copied().unwrap_or(0);
        match a_n.cmp(&b_n) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semver_ordering_applies_when_both_parse() {
        assert_eq!(compare("1.2.3", "1.2.4"), Ordering::Less);
        assert_eq!(compare("v0.21.1", "0.20.0"), Ordering::Greater);
        // Prereleases sort before the release proper.
        assert_eq!(compare("1.0.0-rc.1", "1.0.0"), Ordering::Less);
    }

    #[test]
    fn digit_tuples_pad_with_zeros() {
        assert_eq!(compare("1.0", "1.0.0"), Ordering::Equal);
        assert_eq!(compare("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare("2.1", "2.0.9"), Ordering::Greater);
    }

    #[test]
    fn comparison_is_antisymmetric() {
        let pairs = [("1.2.3", "1.3.0"), ("5.8", "5.8.1"), ("v2.0", "1.9.9")];
        for (a, b) in pairs {
            assert_eq!(compare(a, b), compare(b, a).reverse(), "{a} vs {b}");
        }
    }

    #[test]
    fn placeholders_sort_before_real_versions() {
        assert!(is_newer("0.0.1", "unknown"));
        assert!(is_newer("1.0", ""));
        assert!(!is_newer("unknown", "1.0"));
    }

    #[test]
    fn is_newer_is_strict() {
        assert!(is_newer("2.0.0", "1.9.9"));
        assert!(!is_newer("1.0.0", "1.0.0"));
        assert!(!is_newer("1.0", "1.0.0"));
    }

    #[test]
    fn build_numbers_compare_numerically() {
        assert_eq!(
            compare_builds("223.8836.35", "223.8836.7"),
            Ordering::Greater
        );
        assert_eq!(
            compare_builds("AI-223.8836.35", "223.8836.35"),
            Ordering::Equal
        );
        assert_eq!(compare_builds("231.100.1", "223.9999.99"), Ordering::Greater);
    }

    #[test]
    fn messy_strings_still_normalize() {
        assert_eq!(normalize("v1.2.3-beta4"), vec![1, 2, 3, 4]);
        assert_eq!(normalize("unknown"), vec![0]);
        assert_eq!(normalize("Version 7.2"), vec![7, 2]);
    }
}
