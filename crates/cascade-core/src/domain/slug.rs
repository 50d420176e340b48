//! Directory slug derivation.
//!
//! Directory names carry both id and slug (`E0001-user-auth`); the id is
//! authoritative and the slug is cosmetic, so the transform stays simple
//! and locale-independent.

/// Lowercase the title, map every non-alphanumeric run to a single `-`,
/// and trim leading/trailing dashes. Idempotent.
pub fn slugify(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_dash = false;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_titles() {
        assert_eq!(slugify("User Auth"), "user-auth");
        assert_eq!(slugify("Fix: crash on load!!"), "fix-crash-on-load");
        assert_eq!(slugify("  padded  "), "padded");
    }

    #[test]
    fn runs_collapse_to_one_dash() {
        assert_eq!(slugify("a --- b"), "a-b");
        assert_eq!(slugify("v2.0 release"), "v2-0-release");
    }

    #[test]
    fn non_ascii_is_dropped_not_folded() {
        assert_eq!(slugify("Überholung engine"), "berholung-engine");
    }

    #[test]
    fn idempotent() {
        let once = slugify("Wire the Codec (v2)");
        assert_eq!(slugify(&once), once);
    }

    #[test]
    fn empty_and_symbol_only_titles() {
        assert_eq!(slugify(""), "");
        assert_eq!(slugify("!!!"), "");
    }
}
