use lazy_static::lazy_static;
use regex::Regex;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Tag of the document entries that pair a sender with a target address.
pub const DOMAIN_TAG: &str = "domain";

const MAX_ADDRESS_LEN: usize = 320;

lazy_static! {
    static ref ADDRESS_PATTERN: Regex = Regex::new(
        r#"^(?:[A-Za-z0-9!#$%&'*+/=?^_`{|}~-]+(?:\.[A-Za-z0-9!#$%&'*+/=?^_`{|}~-]+)*|"(?:[^"\\\x00-\x1f\x7f]|\\[^\x00-\x1f\x7f])*")@(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*|\[[^\[\]\\\s]+\])$"#
    )
    .unwrap();
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("mapping document not found: {}", .0.display())]
    Missing(PathBuf),
    #[error("failed to read mapping document {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("mapping document is not valid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("malformed mapping document: {0}")]
    Malformed(String),
    #[error("entry #{position} is incomplete: missing `{attribute}`")]
    IncompleteEntry {
        position: usize,
        attribute: &'static str,
    },
    #[error("entry #{position} has an invalid address: {address}")]
    InvalidAddress { position: usize, address: String },
}

impl MappingError {
    /// True when the document itself was usable but one of its entries was
    /// not, as opposed to the document being absent or unreadable.
    pub fn is_validation_failure(&self) -> bool {
        matches!(
            self,
            MappingError::IncompleteEntry { .. } | MappingError::InvalidAddress { .. }
        )
    }
}

/// Immutable snapshot of the sender -> target address table.
///
/// Keys are stored lower-cased and lookups lower-case their argument, so
/// matching ignores the spelling case of the sender address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressMapping {
    entries: HashMap<String, String>,
}

impl AddressMapping {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a mapping from already validated pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let entries = pairs
            .into_iter()
            .map(|(sender, target)| (normalize_sender(sender.as_ref()), target.into()))
            .collect();
        Self { entries }
    }

    pub fn target_for(&self, sender: &str) -> Option<&str> {
        self.entries
            .get(&normalize_sender(sender))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

pub fn normalize_sender(sender: &str) -> String {
    sender.trim().to_lowercase()
}

/// Syntax check for an `addr-spec` style address (`local@domain`).
pub fn is_valid_address(address: &str) -> bool {
    !address.is_empty() && address.len() <= MAX_ADDRESS_LEN && ADDRESS_PATTERN.is_match(address)
}

/// Read the mapping document at `path` and validate every entry.
pub fn load_mapping(path: &Path) -> Result<AddressMapping, MappingError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(MappingError::Missing(path.to_path_buf()))
        }
        Err(e) => {
            return Err(MappingError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    parse_mapping(&content)
}

/// Parse a mapping document.
///
/// The candidate table is only returned if every `domain` entry is complete
/// and carries a valid target address; a single bad entry rejects the whole
/// document.
pub fn parse_mapping(content: &str) -> Result<AddressMapping, MappingError> {
    let document: Value = serde_yaml::from_str(content)?;

    let entries = match document {
        Value::Sequence(entries) => entries,
        Value::Null => return Err(MappingError::Malformed("document is empty".to_string())),
        _ => {
            return Err(MappingError::Malformed(
                "top level must be a sequence of entries".to_string(),
            ))
        }
    };

    let mut candidate = HashMap::with_capacity(entries.len());

    for (index, entry) in entries.iter().enumerate() {
        let position = index + 1;
        let (tag, attributes) = split_entry(position, entry)?;

        if !tag.eq_ignore_ascii_case(DOMAIN_TAG) {
            log::debug!("Skipping entry #{position} with tag '{tag}'");
            continue;
        }

        let sender = required_attribute(attributes, "name", position)?;
        let target = required_attribute(attributes, "address", position)?;

        if !is_valid_address(target) {
            return Err(MappingError::InvalidAddress {
                position,
                address: target.to_string(),
            });
        }

        let key = normalize_sender(sender);
        log::debug!("Added entry ({key} -> {target})");
        candidate.insert(key, target.to_string());
    }

    Ok(AddressMapping { entries: candidate })
}

fn required_attribute<'a>(
    attributes: Option<&'a Mapping>,
    name: &'static str,
    position: usize,
) -> Result<&'a str, MappingError> {
    attributes
        .and_then(|attrs| attrs.get(name))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(MappingError::IncompleteEntry {
            position,
            attribute: name,
        })
}

/// Split a document element into its tag and (optional) attribute mapping.
fn split_entry(
    position: usize,
    entry: &Value,
) -> Result<(&str, Option<&Mapping>), MappingError> {
    let malformed = |reason: &str| MappingError::Malformed(format!("entry #{position} {reason}"));

    let mapping = entry
        .as_mapping()
        .ok_or_else(|| malformed("is not a tagged mapping"))?;

    if mapping.len() != 1 {
        return Err(malformed("must have exactly one tag"));
    }

    let (tag, value) = mapping
        .iter()
        .next()
        .ok_or_else(|| malformed("must have exactly one tag"))?;
    let tag = tag.as_str().ok_or_else(|| malformed("has a non-string tag"))?;

    let attributes = match value {
        Value::Mapping(attributes) => Some(attributes),
        Value::Null => None,
        _ if !tag.eq_ignore_ascii_case(DOMAIN_TAG) => None,
        _ => return Err(malformed("has attributes that are not a mapping")),
    };

    Ok((tag, attributes))
}
