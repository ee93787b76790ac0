//! Declarative placeholder resolution for entry creation.
//!
//! Form fields may carry an `auto_generate` directive: `next_uid` (resolved
//! by the service under the per-cluster allocation lock),
//! `days_since_epoch`, or a template with `${field}` references into the
//! in-flight attribute map.

use chrono::Utc;
use ldapgate_core::error::{Error, Result};
use ldapgate_core::types::DirectoryEntry;
use std::collections::HashMap;

/// Directive name for uid allocation.
pub const NEXT_UID: &str = "next_uid";
/// Directive name for the shadow-style day counter.
pub const DAYS_SINCE_EPOCH: &str = "days_since_epoch";
/// Lowest uid number ever allocated.
pub const NEXT_UID_FLOOR: u32 = 2000;

/// Integer days since 1970-01-01 UTC.
#[must_use]
pub fn days_since_epoch() -> i64 {
    Utc::now().timestamp().div_euclid(86_400)
}

/// Returns true when `value` still needs generation: missing, empty, or the
/// literal `auto` marker.
#[must_use]
pub fn needs_generation(values: Option<&Vec<String>>) -> bool {
    match values.and_then(|v| v.first()) {
        None => true,
        Some(value) => value.is_empty() || value == "auto",
    }
}

/// Substitutes `${field}` references from the attribute map.
///
/// # Errors
///
/// Returns [`Error::BadRequest`] when a referenced field has no value.
pub fn substitute_template(
    template: &str,
    attributes: &HashMap<String, Vec<String>>,
) -> Result<String> {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(Error::BadRequest(format!(
                "unterminated placeholder in template `{template}`"
            )));
        };
        let field = &after[..end];
        let value = attributes
            .get(field)
            .and_then(|values| values.first())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                Error::BadRequest(format!("template references missing field `{field}`"))
            })?;
        result.push_str(value);
        rest = &after[end + 1..];
    }
    result.push_str(rest);
    Ok(result)
}

/// Computes the next uid from the entries of a user subtree: one past the
/// maximum observed `uidNumber`, floored at [`NEXT_UID_FLOOR`].
#[must_use]
pub fn next_uid_from(entries: &[DirectoryEntry]) -> u32 {
    let max = entries
        .iter()
        .filter_map(|entry| entry.first("uidNumber"))
        .filter_map(|value| value.parse::<u32>().ok())
        .max();
    match max {
        Some(max) => (max + 1).max(NEXT_UID_FLOOR),
        None => NEXT_UID_FLOOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with_uid(uid: &str) -> DirectoryEntry {
        let mut entry = DirectoryEntry::new(format!("uid=u{uid},dc=x"));
        entry
            .attributes
            .insert("uidNumber".to_string(), vec![uid.to_string()]);
        entry
    }

    #[test]
    fn empty_subtree_starts_at_floor() {
        assert_eq!(next_uid_from(&[]), 2000);
    }

    #[test]
    fn next_uid_is_one_past_the_maximum() {
        let entries = vec![entry_with_uid("2004"), entry_with_uid("2010"), entry_with_uid("2001")];
        assert_eq!(next_uid_from(&entries), 2011);
    }

    #[test]
    fn low_uids_are_floored() {
        let entries = vec![entry_with_uid("500"), entry_with_uid("1001")];
        assert_eq!(next_uid_from(&entries), 2000);
    }

    #[test]
    fn unparsable_uids_are_ignored() {
        let entries = vec![entry_with_uid("abc"), entry_with_uid("2005")];
        assert_eq!(next_uid_from(&entries), 2006);
    }

    #[test]
    fn template_substitution() {
        let mut attributes = HashMap::new();
        attributes.insert("uid".to_string(), vec!["jdoe".to_string()]);
        let result = substitute_template("/home/${uid}", &attributes).unwrap();
        assert_eq!(result, "/home/jdoe");

        let result =
            substitute_template("${uid}@example.com", &attributes).unwrap();
        assert_eq!(result, "jdoe@example.com");
    }

    #[test]
    fn template_missing_field_is_bad_request() {
        let attributes = HashMap::new();
        let err = substitute_template("/home/${uid}", &attributes).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn template_without_placeholders_passes_through() {
        let attributes = HashMap::new();
        assert_eq!(
            substitute_template("/bin/bash", &attributes).unwrap(),
            "/bin/bash"
        );
    }

    #[test]
    fn unterminated_placeholder_is_rejected() {
        let attributes = HashMap::new();
        assert!(substitute_template("/home/${uid", &attributes).is_err());
    }

    #[test]
    fn needs_generation_cases() {
        assert!(needs_generation(None));
        assert!(needs_generation(Some(&vec![String::new()])));
        assert!(needs_generation(Some(&vec!["auto".to_string()])));
        assert!(!needs_generation(Some(&vec!["2500".to_string()])));
    }

    #[test]
    fn days_since_epoch_is_plausible() {
        let days = days_since_epoch();
        // 2024-01-01 is day 19723; anything earlier means a broken clock.
        assert!(days > 19_723);
    }
}
