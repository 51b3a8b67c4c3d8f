/*!
Structured store keys.

Every entry in the key-value store is addressed by a small JSON document with a
`type` tag. Session backups carry the names of the molecules, maps and
reflection files they reference, so data files can be reference-counted
without opening the backups themselves.
*/

use crate::Result;
use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Schema version written under the version key.
///
/// Bump this whenever the session document changes shape; stores holding a
/// different marker are wiped by [`crate::BackupStore::init`].
pub const SCHEMA_VERSION: &str = "v1";

/// Molecule-name prefix kept in a backup label before it is ellipsized.
const LABEL_NAME_LIMIT: usize = 10;
const LABEL_NAME_KEEP: usize = 8;

/// Kind of a session backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupKind {
    /// Taken by the modification counter
    Automatic,
    /// Requested by the user
    Manual,
}

impl BackupKind {
    fn tag(self) -> &'static str {
        match self {
            BackupKind::Automatic => "AUTO",
            BackupKind::Manual => "MANUAL",
        }
    }
}

/// Descriptor of one session backup
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupKey {
    /// Milliseconds since the Unix epoch, stored as a decimal string
    #[serde(serialize_with = "millis_to_string", deserialize_with = "millis_from_string")]
    pub date_time: i64,

    /// Names of the molecules in the session, in scene order
    #[serde(default)]
    pub mol_names: Vec<String>,

    /// Stable ids of the maps in the session, in scene order
    #[serde(default)]
    pub map_names: Vec<String>,

    /// Reflection files referenced by maps with reflection data
    #[serde(default)]
    pub mtz_names: Vec<String>,

    /// Human-readable label, filled in when the backup is written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl BackupKey {
    pub fn new(
        date_time: i64,
        mol_names: Vec<String>,
        map_names: Vec<String>,
        mtz_names: Vec<String>,
    ) -> Self {
        Self {
            date_time,
            mol_names,
            map_names,
            mtz_names,
            label: None,
        }
    }

    /// Attach the local-time label for the given kind.
    pub fn labelled(mut self, kind: BackupKind) -> Self {
        self.label = Some(self.label_in(kind, &Local));
        self
    }

    /// Timestamp of the backup, if representable.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.date_time)
    }

    /// Build the display label in the given time zone.
    ///
    /// Format: `<names> -- <weekday, month day, year h:m:s> -- AUTO|MANUAL`,
    /// where the comma-joined molecule names are cut to eight characters and
    /// an ellipsis once they exceed ten.
    pub fn label_in<Tz>(&self, kind: BackupKind, tz: &Tz) -> String
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let joined = self.mol_names.join(",");
        let names = if joined.chars().count() > LABEL_NAME_LIMIT {
            let head: String = joined.chars().take(LABEL_NAME_KEEP).collect();
            format!("{head}...")
        } else {
            joined
        };

        let date = match tz.timestamp_millis_opt(self.date_time).single() {
            Some(dt) => dt.format("%A, %B %-d, %Y %-H:%-M:%-S").to_string(),
            None => self.date_time.to_string(),
        };

        format!("{names} -- {date} -- {}", kind.tag())
    }
}

/// Key of any entry in the backup store
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StoreKey {
    /// Schema version marker
    Version,
    /// Session written by the modification counter
    Automatic(BackupKey),
    /// Session written on user request
    Manual(BackupKey),
    /// Deduplicated reflection data, named after its source file
    MtzData { name: String },
    /// Deduplicated map grid, named after the map's stable id
    MapData { name: String },
}

impl StoreKey {
    /// Wrap a backup descriptor in the variant for `kind`.
    pub fn backup(kind: BackupKind, key: BackupKey) -> Self {
        match kind {
            BackupKind::Automatic => StoreKey::Automatic(key),
            BackupKind::Manual => StoreKey::Manual(key),
        }
    }

    pub fn mtz_data<S: Into<String>>(name: S) -> Self {
        StoreKey::MtzData { name: name.into() }
    }

    pub fn map_data<S: Into<String>>(name: S) -> Self {
        StoreKey::MapData { name: name.into() }
    }

    /// Parse a raw store key.
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Canonical JSON form used as the literal store key.
    pub fn to_key_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The session descriptor and its kind, for session keys.
    pub fn as_backup(&self) -> Option<(BackupKind, &BackupKey)> {
        match self {
            StoreKey::Automatic(key) => Some((BackupKind::Automatic, key)),
            StoreKey::Manual(key) => Some((BackupKind::Manual, key)),
            _ => None,
        }
    }

    /// Name of a data-file entry.
    pub fn data_file_name(&self) -> Option<&str> {
        match self {
            StoreKey::MtzData { name } | StoreKey::MapData { name } => Some(name),
            _ => None,
        }
    }

    /// Entry kind as it appears in the `type` tag.
    pub fn kind_name(&self) -> &'static str {
        match self {
            StoreKey::Version => "version",
            StoreKey::Automatic(_) => "automatic",
            StoreKey::Manual(_) => "manual",
            StoreKey::MtzData { .. } => "mtzData",
            StoreKey::MapData { .. } => "mapData",
        }
    }
}

/// A session key paired with its kind, as listed to users.
#[derive(Debug, Clone, PartialEq)]
pub struct BackupEntry {
    pub kind: BackupKind,
    pub key: BackupKey,
}

impl BackupEntry {
    pub fn store_key(&self) -> StoreKey {
        StoreKey::backup(self.kind, self.key.clone())
    }

    /// Stored label, or one computed in local time for keys written without it.
    pub fn label(&self) -> String {
        self.key
            .label
            .clone()
            .unwrap_or_else(|| self.key.label_in(self.kind, &Local))
    }
}

fn millis_to_string<S: Serializer>(value: &i64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_string())
}

fn millis_from_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Millis {
        Text(String),
        Number(i64),
    }

    match Millis::deserialize(deserializer)? {
        Millis::Number(n) => Ok(n),
        Millis::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
