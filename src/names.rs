//! Call-name resolution and the reserved-name policy.
//!
//! Display names and preferred names are re-resolved every time they are
//! rendered, so a rename applies retroactively to recalled transcript lines.

/// Names nobody but the special user may claim, by exact match or prefix.
const RESERVED_NAMES: &[&str] = &["しゆい"];

/// Fixed call name for the special user. Never overridden, not even by a
/// stored preference.
const SPECIAL_CALL_NAME: &str = "しゆい";

/// Strip one matching pair of quote/bracket wrappers and trim the interior.
pub fn normalize_preferred_name(name: &str) -> String {
    let stripped = name.trim();
    if stripped.is_empty() {
        return String::new();
    }
    const WRAPPERS: &[(&str, &str)] = &[
        ("「", "」"),
        ("『", "』"),
        ("\"", "\""),
        ("'", "'"),
        ("`", "`"),
    ];
    for (start, end) in WRAPPERS {
        if stripped.len() > start.len()
            && stripped.starts_with(start)
            && stripped.ends_with(end)
        {
            let interior = &stripped[start.len()..stripped.len() - end.len()];
            return interior.trim().to_string();
        }
    }
    stripped.to_string()
}

/// A candidate collides with the reserved set if, after normalization, it
/// equals a reserved name or starts with one (so "しゆい様" is also taken).
pub fn is_reserved_name(name: &str) -> bool {
    let normalized = normalize_preferred_name(name);
    RESERVED_NAMES
        .iter()
        .any(|reserved| normalized == *reserved || normalized.starts_with(reserved))
}

/// Resolve the label used for a user in prompts and recalled transcripts.
pub fn resolve_call_name(
    user_id: u64,
    special_user_id: u64,
    display_name: &str,
    preferred_name: Option<&str>,
) -> String {
    if user_id == special_user_id {
        return SPECIAL_CALL_NAME.to_string();
    }
    let candidate = normalize_preferred_name(preferred_name.unwrap_or(display_name));
    if candidate.is_empty() || is_reserved_name(&candidate) {
        return format!("ユーザー{user_id}");
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_matching_wrappers() {
        assert_eq!(normalize_preferred_name("「しゆい」"), "しゆい");
        assert_eq!(normalize_preferred_name("『ねこ』"), "ねこ");
        assert_eq!(normalize_preferred_name("\"neko\""), "neko");
        assert_eq!(normalize_preferred_name("  ゆるり  "), "ゆるり");
    }

    #[test]
    fn normalize_ignores_mismatched_wrappers() {
        assert_eq!(normalize_preferred_name("「ねこ"), "「ねこ");
        assert_eq!(normalize_preferred_name(""), "");
        assert_eq!(normalize_preferred_name("   "), "");
    }

    #[test]
    fn reserved_matches_exact_and_prefix() {
        assert!(is_reserved_name("しゆい"));
        assert!(is_reserved_name("しゆい様"));
        assert!(is_reserved_name("「しゆい」"));
        assert!(!is_reserved_name("ゆい"));
    }

    #[test]
    fn special_user_always_gets_fixed_name() {
        assert_eq!(resolve_call_name(2, 2, "whatever", Some("別名")), "しゆい");
    }

    #[test]
    fn reserved_candidate_falls_back_to_synthetic_label() {
        assert_eq!(resolve_call_name(1, 2, "しゆい", None), "ユーザー1");
        assert_eq!(resolve_call_name(1, 2, "ねこ", Some("しゆい様")), "ユーザー1");
    }

    #[test]
    fn preferred_name_wins_over_display_name() {
        assert_eq!(resolve_call_name(1, 2, "display", Some("「ねこ」")), "ねこ");
        assert_eq!(resolve_call_name(1, 2, "display", None), "display");
    }

    #[test]
    fn empty_candidate_falls_back() {
        assert_eq!(resolve_call_name(7, 2, "", None), "ユーザー7");
    }
}
