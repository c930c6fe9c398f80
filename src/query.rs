//! Query mini-language over record tag sets.
//!
//! - `:all` matches every record
//! - `:untagged` matches records with no tags
//! - anything else is a space-separated list of tags, all of which must be
//!   present on the record

use std::collections::BTreeSet;
use std::fmt;

use crate::model::tags_from_string;

pub const QUERY_ALL: &str = ":all";
pub const QUERY_UNTAGGED: &str = ":untagged";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    All,
    Untagged,
    /// Record tags must be a superset of this set. Never empty.
    AllOf(BTreeSet<String>),
}

impl Predicate {
    /// Predicate matching records that carry `tag`.
    pub fn tagged(tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if tag.is_empty() {
            return Predicate::All;
        }
        Predicate::AllOf(BTreeSet::from([tag]))
    }

    pub fn matches(&self, tags: &BTreeSet<String>) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Untagged => tags.is_empty(),
            Predicate::AllOf(required) => required.is_subset(tags),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::All => f.write_str(QUERY_ALL),
            Predicate::Untagged => f.write_str(QUERY_UNTAGGED),
            Predicate::AllOf(tags) => {
                let joined: Vec<&str> = tags.iter().map(String::as_str).collect();
                f.write_str(&joined.join(" "))
            }
        }
    }
}

/// Translate a typed query into a predicate. Pure; never fails.
pub fn parse(query: &str) -> Predicate {
    match query {
        QUERY_ALL => Predicate::All,
        QUERY_UNTAGGED => Predicate::Untagged,
        _ => {
            let tags: BTreeSet<String> = tags_from_string(query).into_iter().collect();
            if tags.is_empty() {
                Predicate::All
            } else {
                Predicate::AllOf(tags)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::normalize_tags;

    #[test]
    fn test_all_matches_everything() {
        let predicate = parse(":all");
        assert!(predicate.matches(&BTreeSet::new()));
        assert!(predicate.matches(&normalize_tags(["cat", "_delete"])));
    }

    #[test]
    fn test_untagged_matches_only_empty_sets() {
        let predicate = parse(":untagged");
        assert!(predicate.matches(&BTreeSet::new()));
        assert!(!predicate.matches(&normalize_tags(["cat"])));
    }

    #[test]
    fn test_tag_list_requires_superset() {
        let predicate = parse("a b");
        assert!(predicate.matches(&normalize_tags(["a", "b"])));
        assert!(predicate.matches(&normalize_tags(["a", "b", "c"])));
        assert!(!predicate.matches(&normalize_tags(["a"])));
        assert!(!predicate.matches(&BTreeSet::new()));
    }

    #[test]
    fn test_order_and_repetition_are_irrelevant() {
        assert_eq!(parse("a b"), parse("b a"));
        assert_eq!(parse("a  b a"), parse("b a"));
    }

    #[test]
    fn test_blank_query_is_all() {
        assert_eq!(parse(""), Predicate::All);
        assert_eq!(parse("    "), Predicate::All);
    }

    #[test]
    fn test_keywords_are_exact() {
        // Only the bare keyword is special; with other tokens it is a tag.
        assert_eq!(
            parse(":all cat"),
            Predicate::AllOf(normalize_tags([":all", "cat"]))
        );
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        for query in [":all", ":untagged", "cat fun"] {
            assert_eq!(parse(&parse(query).to_string()), parse(query));
        }
    }
}
