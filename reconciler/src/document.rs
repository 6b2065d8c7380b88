//! In-memory model of the pooler's ini-style configuration file.
//!
//! The file is a list of `[section]` blocks holding `key = value` lines. Two
//! places carry extra structure on top of the raw text:
//! - every value in `[databases]` is a set of space separated `key=value`
//!   connection attributes, modelled as a [`DatabaseEntry`]
//! - the user list keys of `[pgbouncer]` (see [`LIST_KEYS`]) are comma
//!   separated lists with set semantics
//!
//! Parsing validates both micro-syntaxes up front so that callers never deal
//! with half-parsed values. Serializing a parsed document reproduces its text,
//! keeping the order of sections and keys as they were read.

use indexmap::{IndexMap, IndexSet};
use std::fmt;
use std::str::FromStr;

pub const DATABASES: &str = "databases";
pub const PGBOUNCER: &str = "pgbouncer";

/// Keys of the `[pgbouncer]` section holding comma separated user lists.
pub const LIST_KEYS: &[&str] = &["admin_users", "stats_users"];

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DocumentError {
    #[error("line {line}: malformed section header")]
    Header { line: usize },

    #[error("line {line}: expected `key = value`")]
    MissingEquals { line: usize },

    #[error("line {line}: empty key")]
    EmptyKey { line: usize },

    #[error("line {line}: key outside of any section")]
    OrphanKey { line: usize },

    #[error("line {line}: duplicate section [{name}]")]
    DuplicateSection { line: usize, name: String },

    #[error("line {line}: duplicate key {key}")]
    DuplicateKey { line: usize, key: String },

    #[error("line {line}: database {name}: {source}")]
    Entry {
        line: usize,
        name: String,
        source: EntryError,
    },

    #[error("section [{section}] does not hold plain settings")]
    NotSettings { section: String },

    #[error("{key:?} cannot be used as a key")]
    InvalidKey { key: String },

    #[error("value of {key} cannot be written on one line")]
    InvalidValue { key: String },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum EntryError {
    #[error("token {0:?} has no `=`")]
    MissingEquals(String),

    #[error("token {0:?} has an empty attribute name")]
    EmptyKey(String),

    #[error("attribute {0} appears more than once")]
    Duplicate(String),

    #[error("{0:?} cannot be used as an attribute name")]
    InvalidKey(String),

    #[error("attribute {key} has a value {value:?} with whitespace or control characters")]
    InvalidValue { key: String, value: String },
}

/// Connection attributes of one logical database, e.g.
/// `host=10.0.0.1 port=5432 dbname=app`.
///
/// Attribute values must not contain whitespace, the pooler has no quoting for
/// them in this position. [`DatabaseEntry::set`] refuses them, so every entry
/// serializes to text that parses back to the same entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DatabaseEntry {
    attributes: IndexMap<String, String>,
}

impl DatabaseEntry {
    pub fn new() -> Self {
        DatabaseEntry::default()
    }

    pub fn with<K, V>(mut self, key: K, value: V) -> Result<Self, EntryError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.set(key, value)?;
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn set<K, V>(&mut self, key: K, value: V) -> Result<(), EntryError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let (key, value) = (key.into(), value.into());
        if !is_valid_key(&key) {
            return Err(EntryError::InvalidKey(key));
        }
        if !is_valid_attribute(&value) {
            return Err(EntryError::InvalidValue { key, value });
        }
        self.attributes.insert(key, value);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.attributes.shift_remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

impl FromStr for DatabaseEntry {
    type Err = EntryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut attributes = IndexMap::new();

        for token in s.split_whitespace() {
            let (key, value) = token
                .split_once('=')
                .ok_or_else(|| EntryError::MissingEquals(token.to_string()))?;

            if key.is_empty() {
                return Err(EntryError::EmptyKey(token.to_string()));
            }

            if attributes
                .insert(key.to_string(), value.to_string())
                .is_some()
            {
                return Err(EntryError::Duplicate(key.to_string()));
            }
        }

        Ok(DatabaseEntry { attributes })
    }
}

impl fmt::Display for DatabaseEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.attributes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

/// A value in a plain settings section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Setting {
    Scalar(String),
    List(IndexSet<String>),
}

impl Setting {
    fn parse(section: &str, key: &str, raw: &str) -> Self {
        if section == PGBOUNCER && LIST_KEYS.contains(&key) {
            Setting::List(split_list(raw))
        } else {
            Setting::Scalar(raw.to_string())
        }
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Setting::Scalar(value) => Some(value),
            Setting::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&IndexSet<String>> {
        match self {
            Setting::List(values) => Some(values),
            Setting::Scalar(_) => None,
        }
    }

    fn render(&self) -> String {
        match self {
            Setting::Scalar(value) => value.clone(),
            Setting::List(values) => values
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// Whether `value` survives as one whitespace separated `key=value` token.
pub fn is_valid_attribute(value: &str) -> bool {
    !value.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Keys and database names sit left of the first `=` of a line, and must
/// not read as a header or a comment.
fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with(['[', ';', '#'])
        && !key
            .chars()
            .any(|c| c == '=' || c.is_whitespace() || c.is_control())
}

fn split_list(raw: &str) -> IndexSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Section {
    Databases(IndexMap<String, DatabaseEntry>),
    Settings(IndexMap<String, Setting>),
}

impl Section {
    fn empty(name: &str) -> Self {
        if name == DATABASES {
            Section::Databases(IndexMap::new())
        } else {
            Section::Settings(IndexMap::new())
        }
    }

    fn insert_parsed(
        &mut self,
        name: &str,
        key: &str,
        raw: &str,
        line: usize,
    ) -> Result<(), DocumentError> {
        let duplicate = match self {
            Section::Databases(entries) => {
                let entry: DatabaseEntry = raw.parse().map_err(|source| DocumentError::Entry {
                    line,
                    name: key.to_string(),
                    source,
                })?;
                entries.insert(key.to_string(), entry).is_some()
            }
            Section::Settings(settings) => settings
                .insert(key.to_string(), Setting::parse(name, key, raw))
                .is_some(),
        };

        if duplicate {
            return Err(DocumentError::DuplicateKey {
                line,
                key: key.to_string(),
            });
        }
        Ok(())
    }

    fn lines(&self) -> Vec<(&str, String)> {
        match self {
            Section::Databases(entries) => entries
                .iter()
                .map(|(name, entry)| (name.as_str(), entry.to_string()))
                .collect(),
            Section::Settings(settings) => settings
                .iter()
                .map(|(key, setting)| (key.as_str(), setting.render()))
                .collect(),
        }
    }
}

/// Structured view of one pooler configuration file.
///
/// Built fresh for every reconciliation pass and dropped once serialized.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigDocument {
    sections: IndexMap<String, Section>,
}

impl ConfigDocument {
    pub fn new() -> Self {
        ConfigDocument::default()
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    /// Adds an empty section unless it already exists.
    pub fn ensure_section(&mut self, name: &str) {
        if name == DATABASES {
            self.databases_mut();
        } else {
            self.sections
                .entry(name.to_string())
                .or_insert_with(|| Section::empty(name));
        }
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&Setting> {
        match self.sections.get(section)? {
            Section::Settings(settings) => settings.get(key),
            Section::Databases(_) => None,
        }
    }

    /// Scalar value of a settings key. List keys yield `None`.
    pub fn get_scalar(&self, section: &str, key: &str) -> Option<&str> {
        self.get(section, key).and_then(Setting::as_scalar)
    }

    /// Sets a key, creating the section when missing. Values of list keys are
    /// split on commas.
    pub fn set<V: Into<String>>(
        &mut self,
        section: &str,
        key: &str,
        value: V,
    ) -> Result<(), DocumentError> {
        let value = value.into();
        if !is_valid_key(key) {
            return Err(DocumentError::InvalidKey {
                key: key.to_string(),
            });
        }
        if value.chars().any(char::is_control) {
            return Err(DocumentError::InvalidValue {
                key: key.to_string(),
            });
        }
        let setting = Setting::parse(section, key, value.trim());
        self.settings_mut(section)?.insert(key.to_string(), setting);
        Ok(())
    }

    /// Removes a key, returning whether it was present.
    pub fn delete(&mut self, section: &str, key: &str) -> bool {
        match self.sections.get_mut(section) {
            Some(Section::Settings(settings)) => settings.shift_remove(key).is_some(),
            _ => false,
        }
    }

    /// Adds a user to a `[pgbouncer]` list key. Returns `false` if it was
    /// already present.
    pub fn add_to_list(&mut self, key: &str, value: &str) -> Result<bool, DocumentError> {
        if value.is_empty() || value.contains(',') || value.chars().any(char::is_control) {
            return Err(DocumentError::InvalidValue {
                key: key.to_string(),
            });
        }
        let settings = self.settings_mut(PGBOUNCER)?;
        let setting = settings
            .entry(key.to_string())
            .or_insert_with(|| Setting::List(IndexSet::new()));

        match setting {
            Setting::List(values) => Ok(values.insert(value.to_string())),
            Setting::Scalar(raw) => {
                let mut values = split_list(raw);
                let added = values.insert(value.to_string());
                *setting = Setting::List(values);
                Ok(added)
            }
        }
    }

    /// Removes a user from a `[pgbouncer]` list key. Returns `false` if it was
    /// not present.
    pub fn remove_from_list(&mut self, key: &str, value: &str) -> bool {
        match self.sections.get_mut(PGBOUNCER) {
            Some(Section::Settings(settings)) => match settings.get_mut(key) {
                Some(Setting::List(values)) => values.shift_remove(value),
                _ => false,
            },
            _ => false,
        }
    }

    pub fn database(&self, name: &str) -> Option<&DatabaseEntry> {
        match self.sections.get(DATABASES)? {
            Section::Databases(entries) => entries.get(name),
            Section::Settings(_) => None,
        }
    }

    pub fn databases(&self) -> impl Iterator<Item = (&str, &DatabaseEntry)> {
        let entries = match self.sections.get(DATABASES) {
            Some(Section::Databases(entries)) => Some(entries),
            _ => None,
        };
        entries
            .into_iter()
            .flat_map(|entries| entries.iter().map(|(k, v)| (k.as_str(), v)))
    }

    pub fn database_names(&self) -> Vec<String> {
        self.databases().map(|(name, _)| name.to_string()).collect()
    }

    /// Inserts or replaces a database entry. An existing entry keeps its
    /// position. Returns whether the document changed.
    pub fn set_database(&mut self, name: &str, entry: DatabaseEntry) -> Result<bool, DocumentError> {
        if !is_valid_key(name) {
            return Err(DocumentError::InvalidKey {
                key: name.to_string(),
            });
        }
        let entries = self.databases_mut();
        if entries.get(name) == Some(&entry) {
            return Ok(false);
        }
        entries.insert(name.to_string(), entry);
        Ok(true)
    }

    pub fn remove_database(&mut self, name: &str) -> Option<DatabaseEntry> {
        match self.sections.get_mut(DATABASES) {
            Some(Section::Databases(entries)) => entries.shift_remove(name),
            _ => None,
        }
    }

    fn databases_mut(&mut self) -> &mut IndexMap<String, DatabaseEntry> {
        if !self.sections.contains_key(DATABASES) {
            // [databases] conventionally leads the file.
            self.sections
                .shift_insert(0, DATABASES.to_string(), Section::empty(DATABASES));
        }

        match self.sections.get_mut(DATABASES) {
            Some(Section::Databases(entries)) => entries,
            _ => unreachable!("[databases] is always created as a database section"),
        }
    }

    fn settings_mut(&mut self, name: &str) -> Result<&mut IndexMap<String, Setting>, DocumentError> {
        let section = self
            .sections
            .entry(name.to_string())
            .or_insert_with(|| Section::empty(name));

        match section {
            Section::Settings(settings) => Ok(settings),
            Section::Databases(_) => Err(DocumentError::NotSettings {
                section: name.to_string(),
            }),
        }
    }
}

impl FromStr for ConfigDocument {
    type Err = DocumentError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut sections: Vec<(String, Section)> = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let trimmed = raw.trim();

            if trimmed.is_empty() || trimmed.starts_with(';') || trimmed.starts_with('#') {
                continue;
            }

            if let Some(rest) = trimmed.strip_prefix('[') {
                let name = rest
                    .strip_suffix(']')
                    .map(str::trim)
                    .filter(|name| !name.is_empty() && !name.contains(['[', ']']))
                    .ok_or(DocumentError::Header { line })?;

                if sections.iter().any(|(existing, _)| existing == name) {
                    return Err(DocumentError::DuplicateSection {
                        line,
                        name: name.to_string(),
                    });
                }

                sections.push((name.to_string(), Section::empty(name)));
                continue;
            }

            let Some((name, section)) = sections.last_mut() else {
                return Err(DocumentError::OrphanKey { line });
            };

            let (key, value) = trimmed
                .split_once('=')
                .ok_or(DocumentError::MissingEquals { line })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(DocumentError::EmptyKey { line });
            }

            section.insert_parsed(name, key, value.trim(), line)?;
        }

        Ok(ConfigDocument {
            sections: sections.into_iter().collect(),
        })
    }
}

impl fmt::Display for ConfigDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, section)) in self.sections.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "[{name}]")?;
            for (key, value) in section.lines() {
                if value.is_empty() {
                    writeln!(f, "{key} =")?;
                } else {
                    writeln!(f, "{key} = {value}")?;
                }
            }
        }
        Ok(())
    }
}
