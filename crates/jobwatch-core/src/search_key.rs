use std::fmt;

use serde::{Deserialize, Serialize};

const SENIORITY_QUALIFIERS: &[&str] = &["senior", "sr", "junior", "jr"];
const ROLE_SYNONYMS: &[&str] = &["developer", "engineer", "programmer"];
const ROLE_BUCKET: &str = "dev";
const COUNTRY_TOKENS: &[&str] = &["canada", "ca"];

/// Normalized `(role, location)` pair shared by the search cache, the refresh
/// queue and the market-sample cache.
///
/// Near-identical searches ("Senior Rust Developer" / "rust engineer") collapse
/// onto the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SearchKey {
    role: String,
    location: String,
}

impl SearchKey {
    pub fn new(role: &str, location: &str) -> Self {
        Self {
            role: normalize_role(role),
            location: normalize_location(location),
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Rebuild a key from its stored `role|location` form without renormalizing.
    pub fn from_stored(stored: &str) -> Option<Self> {
        let (role, location) = stored.split_once('|')?;
        Some(Self {
            role: role.to_string(),
            location: location.to_string(),
        })
    }
}

/// A search as the user or configuration phrased it; providers are queried
/// with these display strings, caches are indexed by [`SearchTarget::key`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchTarget {
    pub role: String,
    pub location: String,
}

impl SearchTarget {
    pub fn new(role: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            location: location.into(),
        }
    }

    pub fn key(&self) -> SearchKey {
        SearchKey::new(&self.role, &self.location)
    }

    /// Every role × location combination, in input order.
    pub fn matrix(roles: &[String], locations: &[String]) -> Vec<Self> {
        roles
            .iter()
            .flat_map(|role| locations.iter().map(move |loc| Self::new(role.clone(), loc.clone())))
            .collect()
    }
}

impl fmt::Display for SearchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.role, self.location)
    }
}

/// `|` separates role from location in the stored form, so it never survives into a token.
fn tokens(input: &str) -> impl Iterator<Item = String> + '_ {
    input
        .split(|c: char| c.is_whitespace() || c == '|')
        .map(|t| t.trim_matches(|c: char| c == ',' || c == '.' || c == ';').to_lowercase())
        .filter(|t| !t.is_empty())
}

fn normalize_role(role: &str) -> String {
    tokens(role)
        .filter(|t| !SENIORITY_QUALIFIERS.contains(&t.as_str()))
        .map(|t| {
            if ROLE_SYNONYMS.contains(&t.as_str()) {
                ROLE_BUCKET.to_string()
            } else {
                t
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalize_location(location: &str) -> String {
    tokens(location)
        .filter(|t| !COUNTRY_TOKENS.contains(&t.as_str()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seniority_and_role_synonyms_share_a_key() {
        let a = SearchKey::new("Senior Rust Developer", "Toronto");
        let b = SearchKey::new("rust engineer", "toronto");
        let c = SearchKey::new("Jr. Rust   Programmer", " TORONTO ");
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.to_string(), "rust dev|toronto");
    }

    #[test]
    fn country_suffix_is_dropped_from_location() {
        let key = SearchKey::new("Data Analyst", "Toronto, ON, Canada");
        assert_eq!(key.location(), "toronto on");
        assert_eq!(key.role(), "data analyst");
    }

    #[test]
    fn different_roles_stay_apart() {
        assert_ne!(
            SearchKey::new("Data Analyst", "Toronto"),
            SearchKey::new("Data Engineer", "Toronto")
        );
    }

    #[test]
    fn matrix_expands_roles_by_locations() {
        let roles = vec!["Rust Developer".to_string(), "Data Analyst".to_string()];
        let locations = vec!["Toronto".to_string(), "Remote".to_string()];
        let targets = SearchTarget::matrix(&roles, &locations);
        assert_eq!(targets.len(), 4);
        assert_eq!(targets[1], SearchTarget::new("Rust Developer", "Remote"));
        assert_eq!(targets[0].key(), SearchKey::new("rust engineer", "toronto"));
    }

    #[test]
    fn stored_form_round_trips() {
        let key = SearchKey::new("Backend Developer", "Vancouver, BC");
        assert_eq!(SearchKey::from_stored(&key.to_string()), Some(key));
        assert_eq!(SearchKey::from_stored("no-separator"), None);
    }

    #[test]
    fn pipes_in_roles_or_locations_do_not_break_the_stored_form() {
        let key = SearchKey::new("C|C++ Developer", "Toronto|Waterloo");
        assert_eq!(key.role(), "c c++ dev");
        assert_eq!(key.location(), "toronto waterloo");
        assert_eq!(SearchKey::from_stored(&key.to_string()), Some(key));
    }
}
