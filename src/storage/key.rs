//! Storage key validation and construction.
//!
//! Keys are opaque namespaced strings built from ordered components joined
//! by `:` (e.g. `pipeline:<id>:run:<run_id>`). Control characters that would
//! break the on-disk format or log output are rejected up front.

use super::StorageError;

/// Separator between key components.
pub const SEPARATOR: &str = ":";

/// Validate a storage key.
///
/// A key must be non-empty and must not contain NUL, CR, or LF.
pub fn validate(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("empty key".to_string()));
    }

    if key.contains(['\0', '\r', '\n']) {
        return Err(StorageError::InvalidKey(format!(
            "key contains control characters: {:?}",
            key
        )));
    }

    Ok(())
}

/// Build a key from ordered components.
///
/// Each component is validated; the result is the components joined by `:`.
pub fn join(components: &[&str]) -> Result<String, StorageError> {
    if components.is_empty() {
        return Err(StorageError::InvalidKey("no key components".to_string()));
    }

    for component in components {
        validate(component)?;
    }

    Ok(components.join(SEPARATOR))
}

/// Validate a table name.
///
/// Table names become database file names, so they are restricted to
/// alphanumerics, `_`, and `-`.
pub fn validate_table(table: &str) -> Result<(), StorageError> {
    if table.is_empty() {
        return Err(StorageError::InvalidTable("empty table name".to_string()));
    }

    if !table
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(StorageError::InvalidTable(format!(
            "table name contains disallowed characters: {:?}",
            table
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_keys() {
        assert!(validate("pipeline:abc:run:123").is_ok());
        assert!(validate("a").is_ok());
    }

    #[test]
    fn test_invalid_keys() {
        assert!(validate("").is_err());
        assert!(validate("has\0nul").is_err());
        assert!(validate("has\nnewline").is_err());
        assert!(validate("has\rreturn").is_err());
    }

    #[test]
    fn test_join() {
        let key = join(&["pipeline", "blog", "run", "42"]).unwrap();
        assert_eq!(key, "pipeline:blog:run:42");

        assert!(join(&[]).is_err());
        assert!(join(&["ok", "bad\npart"]).is_err());
    }

    #[test]
    fn test_table_names() {
        assert!(validate_table("pipeline_runs").is_ok());
        assert!(validate_table("cache").is_ok());
        assert!(validate_table("../escape").is_err());
        assert!(validate_table("").is_err());
    }
}
