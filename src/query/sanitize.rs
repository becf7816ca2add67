//! Identifier sanitization for query fragments.
//!
//! Values always travel as parameters. Names cannot: variable names, kind
//! labels, property keys and relationship types are interpolated straight into
//! the fragment text. Every such interpolation point goes through
//! [`identifier`], and every literal id placed in an `IN [...]` list goes
//! through [`id`].

use crate::models::PropertyMap;

/// Keeps ASCII letters, digits and `_`.
#[must_use]
pub fn identifier(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Keeps ASCII letters, digits, `_` and `-`.
#[must_use]
pub fn id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Sanitizes every key of a property map.
///
/// Keys that collapse to the same identifier keep the last value in key order.
#[must_use]
pub fn keys(properties: &PropertyMap) -> PropertyMap {
    properties
        .iter()
        .map(|(k, v)| (identifier(k), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("name", "name")]
    #[test_case("first_name", "first_name")]
    #[test_case("n) DETACH DELETE n //", "nDETACHDELETEn")]
    #[test_case("User`}", "User")]
    #[test_case("ZetUniverse.Kinds.Note", "ZetUniverseKindsNote")]
    #[test_case("héllo", "hllo")]
    fn test_identifier(raw: &str, expected: &str) {
        assert_eq!(identifier(raw), expected);
    }

    #[test_case("b1f0-22aa_x", "b1f0-22aa_x")]
    #[test_case("a', 'b", "ab")]
    #[test_case("Habit/Reading", "HabitReading")]
    fn test_id(raw: &str, expected: &str) {
        assert_eq!(id(raw), expected);
    }

    #[test]
    fn test_keys() {
        let mut props = PropertyMap::new();
        props.insert("na$me".into(), "Jack".into());
        let clean = keys(&props);
        assert!(clean.contains_key("name"));
        assert_eq!(clean.len(), 1);
    }
}
