//! Info objects for passing hints to communicator operations.
//!
//! [`Info`] is an ordered set of string key-value pairs. Communicator creation
//! routines read hints from it (e.g. `mpi_hw_resource_type` for hardware
//! guided splits, `mpi_assert_no_any_tag` for the hint table).
//!
//! # Example
//!
//! ```
//! use ferrocomm::Info;
//!
//! let mut info = Info::new();
//! info.set("mpi_assert_no_any_tag", "true").unwrap();
//! assert_eq!(info.get("mpi_assert_no_any_tag"), Some("true"));
//! ```

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Maximum length of an info key.
pub const INFO_KEY_MAX_LEN: usize = 255;
/// Maximum length of an info value.
pub const INFO_VALUE_MAX_LEN: usize = 1024;

/// A set of hint key-value pairs.
///
/// [`Info::null()`] represents "no hints": it reads as empty and rejects
/// writes, mirroring the null info handle of the MPI interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Info {
    entries: BTreeMap<String, String>,
    is_null: bool,
}

impl Info {
    /// Create a new empty info object.
    pub fn new() -> Self {
        Info::default()
    }

    /// An info object representing the absence of hints.
    pub fn null() -> Self {
        Info {
            entries: BTreeMap::new(),
            is_null: true,
        }
    }

    /// Whether this is the null info object.
    pub fn is_null(&self) -> bool {
        self.is_null
    }

    /// Set a key-value pair, replacing any previous value for the key.
    ///
    /// # Errors
    ///
    /// Returns an error on the null info object, for empty or over-long keys,
    /// over-long values, or keys/values containing a null byte.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if self.is_null {
            return Err(Error::InvalidHint(
                "cannot set key-value on the null info object".into(),
            ));
        }
        if key.is_empty() || key.len() > INFO_KEY_MAX_LEN {
            return Err(Error::InvalidHint(format!(
                "info key length {} out of range",
                key.len()
            )));
        }
        if value.len() > INFO_VALUE_MAX_LEN {
            return Err(Error::InvalidHint(format!(
                "info value for '{key}' longer than {INFO_VALUE_MAX_LEN}"
            )));
        }
        if key.contains('\0') || value.contains('\0') {
            return Err(Error::InvalidHint("info key or value contains null byte".into()));
        }
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Value associated with `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Remove `key`, returning its previous value.
    pub fn delete(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are set.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over key-value pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_info_set_returns_error() {
        let mut info = Info::null();
        let err = info.set("key", "value").unwrap_err();
        assert!(format!("{err}").contains("null info"), "got: {err}");
        assert_eq!(info.get("key"), None);
        assert!(info.is_null());
    }

    #[test]
    fn set_replaces_and_delete_removes() {
        let mut info = Info::new();
        info.set("a", "1").unwrap();
        info.set("a", "2").unwrap();
        info.set("b", "3").unwrap();
        assert_eq!(info.get("a"), Some("2"));
        assert_eq!(info.len(), 2);
        assert_eq!(info.delete("a"), Some("2".to_string()));
        assert_eq!(info.iter().collect::<Vec<_>>(), vec![("b", "3")]);
    }

    #[test]
    fn rejects_null_bytes_and_bad_lengths() {
        let mut info = Info::new();
        assert!(info.set("key\0bad", "v").is_err());
        assert!(info.set("key", "value\0bad").is_err());
        assert!(info.set("", "v").is_err());
        assert!(info.set(&"k".repeat(INFO_KEY_MAX_LEN + 1), "v").is_err());
        assert!(info.set("k", &"v".repeat(INFO_VALUE_MAX_LEN + 1)).is_err());
        assert!(info.is_empty());
    }
}
