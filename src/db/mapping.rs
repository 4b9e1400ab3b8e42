//! Parsing of database mappings.
//!
//! A mapping is a `;`-separated list. The single un-named entry is the
//! default store; every other entry is `name=url` and names a logical
//! database that may live on its own physical store:
//!
//! ```text
//! sqlite://./data/meta.db;metabase=sqlite://./data/objects.db
//! ```

use crate::errors::{MetabaseError, MetabaseResult};
use std::collections::HashMap;

use super::DEFAULT_DB;

/// Split a database mapping into logical name -> connection URL.
///
/// The default store is keyed by [`DEFAULT_DB`]. Fails when the default is
/// missing or a name appears twice.
pub fn parse_db_mapping(database_url: &str) -> MetabaseResult<HashMap<String, String>> {
    let mut mapping = HashMap::new();

    for entry in database_url.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, url) = split_named_entry(entry).unwrap_or((DEFAULT_DB, entry));
        if url.is_empty() {
            return Err(MetabaseError::invalid(format!(
                "database `{}` has an empty url",
                name
            )));
        }
        if mapping.insert(name.to_string(), url.to_string()).is_some() {
            let shown = if name.is_empty() { "default" } else { name };
            return Err(MetabaseError::invalid(format!(
                "database `{}` is listed more than once",
                shown
            )));
        }
    }

    if !mapping.contains_key(DEFAULT_DB) {
        return Err(MetabaseError::invalid(
            "database mapping has no default database url",
        ));
    }

    Ok(mapping)
}

/// `name=url` where the name is a plain identifier. URLs carry `:` before
/// any `=` of their query string, so they never parse as a name.
fn split_named_entry(entry: &str) -> Option<(&str, &str)> {
    let (name, url) = entry.split_once('=')?;
    let name = name.trim();
    let is_identifier = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    is_identifier.then_some((name, url.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn single_url_is_default() {
        let mapping = parse_db_mapping("sqlite://./data/meta.db?mode=rwc").unwrap();
        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping[DEFAULT_DB], "sqlite://./data/meta.db?mode=rwc");
    }

    #[test]
    fn named_entries_are_split() {
        let mapping =
            parse_db_mapping("sqlite::memory: ; metabase=sqlite://objects.db;repairqueue=sqlite://rq.db")
                .unwrap();
        assert_eq!(mapping[DEFAULT_DB], "sqlite::memory:");
        assert_eq!(mapping["metabase"], "sqlite://objects.db");
        assert_eq!(mapping["repairqueue"], "sqlite://rq.db");
    }

    #[test]
    fn missing_default_is_rejected() {
        let err = parse_db_mapping("metabase=sqlite://objects.db").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = parse_db_mapping("sqlite::memory:;sqlite://other.db").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);

        let err = parse_db_mapping("sqlite::memory:;metabase=a.db;metabase=b.db").unwrap_err();
        assert!(err.to_string().contains("metabase"));
    }
}
