//! RFC 4515 filter escaping and composition.
//!
//! User-supplied substrings must pass through [`escape_value`] before they
//! appear inside a filter. The composition helpers take escaped values only
//! through their own calls, so raw interpolation is never exposed.

/// Escapes a value for safe inclusion in an LDAP search filter.
///
/// `*`, `(`, `)`, `\` and NUL become lowercase `\XX` hex escapes per
/// RFC 4515.
#[must_use]
pub fn escape_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\\' => escaped.push_str("\\5c"),
            '\0' => escaped.push_str("\\00"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Builds an equality match: `(attr=value)` with the value escaped.
#[must_use]
pub fn equals(attribute: &str, value: &str) -> String {
    format!("({attribute}={})", escape_value(value))
}

/// Builds a substring match: `(attr=*value*)` with the value escaped.
#[must_use]
pub fn substring(attribute: &str, value: &str) -> String {
    format!("({attribute}=*{}*)", escape_value(value))
}

/// AND-combines filters. A single filter passes through unchanged.
#[must_use]
pub fn and(filters: &[String]) -> String {
    combine('&', filters)
}

/// OR-combines filters. A single filter passes through unchanged.
#[must_use]
pub fn or(filters: &[String]) -> String {
    combine('|', filters)
}

fn combine(op: char, filters: &[String]) -> String {
    match filters {
        [] => String::new(),
        [single] => single.clone(),
        many => {
            let mut combined = String::with_capacity(3 + many.iter().map(String::len).sum::<usize>());
            combined.push('(');
            combined.push(op);
            for filter in many {
                combined.push_str(filter);
            }
            combined.push(')');
            combined
        }
    }
}

/// Builds the disjunction of substring matches used for listing queries:
/// `(|(a1=*q*)(a2=*q*)…)`.
#[must_use]
pub fn query_disjunction(attributes: &[String], query: &str) -> String {
    or(&attributes
        .iter()
        .map(|attr| substring(attr, query))
        .collect::<Vec<_>>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_covers_all_special_characters() {
        assert_eq!(escape_value("*"), "\\2a");
        assert_eq!(escape_value("("), "\\28");
        assert_eq!(escape_value(")"), "\\29");
        assert_eq!(escape_value("\\"), "\\5c");
        assert_eq!(escape_value("\0"), "\\00");
        assert_eq!(escape_value("plain"), "plain");
    }

    #[test]
    fn escaped_output_has_no_unescaped_metacharacters() {
        let hostile = "*)(uid=*))(|(uid=*\\";
        let escaped = escape_value(hostile);
        let mut chars = escaped.chars();
        while let Some(ch) = chars.next() {
            match ch {
                '\\' => {
                    // Consume the two hex digits of the escape.
                    assert!(chars.next().is_some_and(|c| c.is_ascii_hexdigit()));
                    assert!(chars.next().is_some_and(|c| c.is_ascii_hexdigit()));
                }
                '*' | '(' | ')' => panic!("unescaped metacharacter in {escaped}"),
                _ => {}
            }
        }
    }

    #[test]
    fn escaped_equality_parses_as_valid_filter() {
        for hostile in ["*)(uid=*", "a\\b", "()", "\0x", "admin"] {
            let filter = equals("uid", hostile);
            assert!(
                ldap3::parse_filter(&filter).is_ok(),
                "filter {filter} failed to parse"
            );
        }
    }

    #[test]
    fn injection_attempt_produces_expected_filter() {
        // The hostile query from a filter-injection attempt must land inside
        // a single substring assertion.
        let filter = substring("uid", "*)(uid=*");
        assert_eq!(filter, "(uid=*\\2a\\29\\28uid=\\2a*)");
        assert!(ldap3::parse_filter(&filter).is_ok());
    }

    #[test]
    fn and_or_composition() {
        let users = "(objectClass=person)".to_string();
        let query = or(&[
            substring("uid", "jo"),
            substring("cn", "jo"),
        ]);
        assert_eq!(query, "(|(uid=*jo*)(cn=*jo*))");
        let combined = and(&[users.clone(), query]);
        assert_eq!(combined, "(&(objectClass=person)(|(uid=*jo*)(cn=*jo*)))");
        assert_eq!(and(&[users.clone()]), users);
        assert_eq!(and(&[]), "");
    }

    #[test]
    fn query_disjunction_uses_all_attributes() {
        let attrs = vec!["uid".to_string(), "cn".to_string(), "mail".to_string()];
        let filter = query_disjunction(&attrs, "ann");
        assert_eq!(filter, "(|(uid=*ann*)(cn=*ann*)(mail=*ann*))");
    }
}
