use crate::prefs::ViewerPreferences;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

const APP_DIR: &str = "camgrid";
const STORE_FILE: &str = "streams.json";
const INSTALLATION_FILE: &str = "installation.json";
const LOG_FILE: &str = "camgrid.log";

pub const MAX_FIELD_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Tcp,
    Udp,
}

/// One camera. URLs are stored with their password encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub primary_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_url: Option<String>,
    #[serde(default)]
    pub transport: TransportMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_url: Option<String>,
}

/// Named, ordered selection of streams by index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub streams: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStore {
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub preferences: ViewerPreferences,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Name,
    PrimaryUrl,
    SecondaryUrl,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Name => "name",
            Self::PrimaryUrl => "URL",
            Self::SecondaryUrl => "secondary URL",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("{0} must be 1-255 characters")]
    Invalid(Field),
    #[error("{0} is already used by another stream")]
    Exists(Field),
    #[error("secondary URL must differ from the primary URL")]
    ChannelsEqual,
}

impl FieldError {
    #[must_use]
    pub const fn field(self) -> Field {
        match self {
            Self::Invalid(field) | Self::Exists(field) => field,
            Self::ChannelsEqual => Field::SecondaryUrl,
        }
    }
}

/// Every problem found with a candidate stream, in field order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid stream: {}", join_errors(.0))]
pub struct ValidationErrors(pub Vec<FieldError>);

fn join_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupError {
    #[error("group '{0}' not found")]
    NotFound(String),
    #[error("group '{0}' already exists")]
    DuplicateName(String),
    #[error("group name must be 1-255 characters")]
    InvalidName,
    #[error("stream '{0}' not found")]
    UnknownStream(String),
    #[error(
        "group '{group}' references stream #{index} but only {known} streams exist; remove and re-create the group"
    )]
    CorruptReference {
        group: String,
        index: usize,
        known: usize,
    },
}

fn field_len_ok(value: &str) -> bool {
    !value.trim().is_empty() && value.chars().count() <= MAX_FIELD_LEN
}

impl StreamStore {
    /// Checks `candidate` against the other streams; `editing` is the index
    /// being replaced, which is excluded from uniqueness checks.
    pub fn validate(
        &self,
        candidate: &StreamConfig,
        editing: Option<usize>,
    ) -> Result<(), ValidationErrors> {
        let others = || {
            self.streams
                .iter()
                .enumerate()
                .filter(move |(idx, _)| Some(*idx) != editing)
                .map(|(_, stream)| stream)
        };
        let mut errors = Vec::new();

        if !field_len_ok(&candidate.name) {
            errors.push(FieldError::Invalid(Field::Name));
        } else if others().any(|stream| stream.name == candidate.name) {
            errors.push(FieldError::Exists(Field::Name));
        }

        if !field_len_ok(&candidate.primary_url) {
            errors.push(FieldError::Invalid(Field::PrimaryUrl));
        } else if others().any(|stream| stream.primary_url == candidate.primary_url) {
            errors.push(FieldError::Exists(Field::PrimaryUrl));
        }

        if let Some(secondary) = &candidate.secondary_url {
            if !field_len_ok(secondary) {
                errors.push(FieldError::Invalid(Field::SecondaryUrl));
            } else if *secondary == candidate.primary_url {
                errors.push(FieldError::ChannelsEqual);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(errors))
        }
    }

    pub fn add_stream(&mut self, stream: StreamConfig) -> Result<usize, ValidationErrors> {
        self.validate(&stream, None)?;
        self.streams.push(stream);
        Ok(self.streams.len() - 1)
    }

    /// Replaces the stream at `index` and returns the previous config, or
    /// `None` when there is no such stream.
    pub fn update_stream(
        &mut self,
        index: usize,
        stream: StreamConfig,
    ) -> Result<Option<StreamConfig>, ValidationErrors> {
        if index >= self.streams.len() {
            return Ok(None);
        }
        self.validate(&stream, Some(index))?;
        Ok(Some(std::mem::replace(&mut self.streams[index], stream)))
    }

    /// Removes a stream and rewrites group references so indices stay valid.
    pub fn remove_stream(&mut self, index: usize) -> Option<StreamConfig> {
        if index >= self.streams.len() {
            return None;
        }
        let removed = self.streams.remove(index);
        for group in &mut self.groups {
            group.streams.retain(|idx| *idx != index);
            for idx in &mut group.streams {
                if *idx > index {
                    *idx -= 1;
                }
            }
        }
        Some(removed)
    }

    #[must_use]
    pub fn find_stream(&self, name: &str) -> Option<(usize, &StreamConfig)> {
        self.streams
            .iter()
            .enumerate()
            .find(|(_, stream)| stream.name == name)
    }

    /// Builds a group from stream names, in the order given.
    pub fn group_from_names(
        &self,
        name: &str,
        stream_names: &[String],
    ) -> Result<GroupConfig, GroupError> {
        let streams = stream_names
            .iter()
            .map(|stream_name| {
                self.find_stream(stream_name)
                    .map(|(idx, _)| idx)
                    .ok_or_else(|| GroupError::UnknownStream(stream_name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(GroupConfig {
            name: name.to_owned(),
            streams,
        })
    }

    pub fn add_group(&mut self, group: GroupConfig) -> Result<(), GroupError> {
        if !field_len_ok(&group.name) {
            return Err(GroupError::InvalidName);
        }
        if self.groups.iter().any(|existing| existing.name == group.name) {
            return Err(GroupError::DuplicateName(group.name));
        }
        self.check_references(&group)?;
        self.groups.push(group);
        Ok(())
    }

    pub fn remove_group(&mut self, name: &str) -> bool {
        let before = self.groups.len();
        self.groups.retain(|group| group.name != name);
        self.groups.len() != before
    }

    /// Streams of a group in group order. Any dangling reference fails the
    /// whole group.
    pub fn resolve_group(&self, name: &str) -> Result<Vec<&StreamConfig>, GroupError> {
        let group = self
            .groups
            .iter()
            .find(|group| group.name == name)
            .ok_or_else(|| GroupError::NotFound(name.to_owned()))?;
        self.check_references(group)?;
        Ok(group
            .streams
            .iter()
            .filter_map(|idx| self.streams.get(*idx))
            .collect())
    }

    fn check_references(&self, group: &GroupConfig) -> Result<(), GroupError> {
        let known = self.streams.len();
        match group.streams.iter().find(|idx| **idx >= known) {
            Some(index) => Err(GroupError::CorruptReference {
                group: group.name.clone(),
                index: *index,
                known,
            }),
            None => Ok(()),
        }
    }
}

/// Identity of this installation; its secret keys the credential cipher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationRecord {
    pub id: String,
    pub installed_at_unix: u64,
}

impl InstallationRecord {
    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            installed_at_unix: now_unix(),
        }
    }

    #[must_use]
    pub fn secret(&self) -> String {
        format!("{}{}", self.id, self.installed_at_unix)
    }
}

pub fn store_path() -> Result<PathBuf> {
    scoped_path(STORE_FILE)
}

pub fn installation_path() -> Result<PathBuf> {
    scoped_path(INSTALLATION_FILE)
}

pub fn log_path() -> Result<PathBuf> {
    let path = scoped_path(LOG_FILE)?;
    ensure_parent_dir(&path)?;
    Ok(path)
}

pub fn load_store() -> Result<StreamStore> {
    load_store_from(&store_path()?)
}

pub fn save_store(store: &StreamStore) -> Result<()> {
    save_store_to(&store_path()?, store)
}

pub fn load_store_from(path: &Path) -> Result<StreamStore> {
    if !path.exists() {
        return Ok(StreamStore::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading stream store at {}", path.display()))?;
    let parsed = serde_json::from_str::<StreamStore>(&raw)
        .with_context(|| format!("failed parsing stream store at {}", path.display()))?;
    Ok(parsed)
}

pub fn save_store_to(path: &Path, store: &StreamStore) -> Result<()> {
    ensure_parent_dir(path)?;

    let payload = serde_json::to_string_pretty(store).context("failed serializing stream store")?;
    fs::write(path, payload)
        .with_context(|| format!("failed writing stream store at {}", path.display()))?;
    Ok(())
}

/// Writes only the preference block, leaving streams and groups as stored.
pub fn save_preferences(preferences: ViewerPreferences) -> Result<()> {
    let path = store_path()?;
    let mut store = load_store_from(&path)?;
    store.preferences = preferences;
    save_store_to(&path, &store)
}

pub fn load_or_create_installation_at(path: &Path) -> Result<InstallationRecord> {
    if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading installation record at {}", path.display()))?;
        return serde_json::from_str::<InstallationRecord>(&raw)
            .with_context(|| format!("failed parsing installation record at {}", path.display()));
    }

    let record = InstallationRecord::generate();
    ensure_parent_dir(path)?;
    let payload =
        serde_json::to_string_pretty(&record).context("failed serializing installation record")?;
    fs::write(path, payload)
        .with_context(|| format!("failed writing installation record at {}", path.display()))?;
    info!(path = %path.display(), "created installation record");
    Ok(record)
}

/// Secret for the credential cipher, or `None` when the installation record
/// is unavailable.
#[must_use]
pub fn installation_secret() -> Option<String> {
    match installation_path().and_then(|path| load_or_create_installation_at(&path)) {
        Ok(record) => Some(record.secret()),
        Err(err) => {
            warn!("installation record unavailable: {err:#}");
            None
        }
    }
}

#[must_use]
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating data directory {}", parent.display()))?;
    }
    Ok(())
}

fn data_root() -> Result<PathBuf> {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .context("unable to determine user data directory")
}

fn scoped_path(file: &str) -> Result<PathBuf> {
    Ok(data_root()?.join(APP_DIR).join(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::Channel;

    fn stream(name: &str, url: &str) -> StreamConfig {
        StreamConfig {
            name: name.to_owned(),
            primary_url: url.to_owned(),
            secondary_url: None,
            transport: TransportMode::Tcp,
            archive_url: None,
        }
    }

    fn store_with(names: &[&str]) -> StreamStore {
        let mut store = StreamStore::default();
        for name in names {
            store
                .add_stream(stream(name, &format!("rtsp://10.0.0.1/{name}")))
                .unwrap();
        }
        store
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("camgrid-store-{}", Uuid::new_v4()))
    }

    #[test]
    fn validation_reports_every_failing_field() {
        let store = store_with(&["porch"]);
        let mut candidate = stream("porch", "rtsp://10.0.0.1/porch");
        candidate.secondary_url = Some(candidate.primary_url.clone());
        let err = store.validate(&candidate, None).unwrap_err();
        assert_eq!(
            err.0,
            vec![
                FieldError::Exists(Field::Name),
                FieldError::Exists(Field::PrimaryUrl),
                FieldError::ChannelsEqual,
            ]
        );
        assert!(err.to_string().contains("name is already used"));

        let blank = stream("  ", &"x".repeat(MAX_FIELD_LEN + 1));
        assert_eq!(
            store.validate(&blank, None).unwrap_err().0,
            vec![
                FieldError::Invalid(Field::Name),
                FieldError::Invalid(Field::PrimaryUrl),
            ]
        );
    }

    #[test]
    fn editing_a_stream_ignores_its_own_values() {
        let mut store = store_with(&["porch", "yard"]);
        let mut edited = store.streams[0].clone();
        edited.transport = TransportMode::Udp;
        let previous = store.update_stream(0, edited).unwrap();
        assert_eq!(previous.unwrap().transport, TransportMode::Tcp);
        assert_eq!(store.streams[0].transport, TransportMode::Udp);

        let clash = stream("yard", "rtsp://10.0.0.9/other");
        assert!(store.update_stream(0, clash).is_err());
        assert_eq!(store.update_stream(5, stream("x", "y")).unwrap(), None);
    }

    #[test]
    fn removing_a_stream_shifts_group_references() {
        let mut store = store_with(&["a", "b", "c", "d"]);
        store
            .add_group(GroupConfig {
                name: "all".to_owned(),
                streams: vec![3, 1, 0, 2],
            })
            .unwrap();

        let removed = store.remove_stream(1).unwrap();
        assert_eq!(removed.name, "b");
        assert_eq!(store.groups[0].streams, vec![2, 0, 1]);
        let names: Vec<_> = store
            .resolve_group("all")
            .unwrap()
            .iter()
            .map(|stream| stream.name.as_str())
            .collect();
        assert_eq!(names, vec!["d", "a", "c"]);
    }

    #[test]
    fn corrupt_group_fails_as_a_whole() {
        let mut store = store_with(&["a", "b"]);
        store.groups.push(GroupConfig {
            name: "broken".to_owned(),
            streams: vec![0, 2],
        });
        assert_eq!(
            store.resolve_group("broken").unwrap_err(),
            GroupError::CorruptReference {
                group: "broken".to_owned(),
                index: 2,
                known: 2,
            }
        );
        assert_eq!(
            store.resolve_group("missing").unwrap_err(),
            GroupError::NotFound("missing".to_owned())
        );
        assert!(store.remove_group("broken"));
        assert!(!store.remove_group("broken"));
    }

    #[test]
    fn groups_are_built_from_names() {
        let mut store = store_with(&["a", "b"]);
        let group = store
            .group_from_names("pair", &["b".to_owned(), "a".to_owned()])
            .unwrap();
        assert_eq!(group.streams, vec![1, 0]);
        store.add_group(group.clone()).unwrap();
        assert_eq!(
            store.add_group(group).unwrap_err(),
            GroupError::DuplicateName("pair".to_owned())
        );
        assert_eq!(
            store.group_from_names("x", &["zzz".to_owned()]).unwrap_err(),
            GroupError::UnknownStream("zzz".to_owned())
        );
    }

    #[test]
    fn store_round_trips_through_disk() {
        let dir = temp_dir();
        let path = dir.join(STORE_FILE);
        assert_eq!(load_store_from(&path).unwrap(), StreamStore::default());

        let mut store = store_with(&["porch"]);
        store.streams[0].transport = TransportMode::Udp;
        store.preferences.muted = true;
        store.preferences.active_channel = Channel::Secondary;
        save_store_to(&path, &store).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"transport\": \"udp\""));
        assert!(!raw.contains("secondary_url"));
        assert_eq!(load_store_from(&path).unwrap(), store);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn installation_record_is_created_once() {
        let dir = temp_dir();
        let path = dir.join(INSTALLATION_FILE);
        let first = load_or_create_installation_at(&path).unwrap();
        let second = load_or_create_installation_at(&path).unwrap();
        assert_eq!(first, second);
        assert!(first.secret().starts_with(&first.id));
        assert!(first.secret().ends_with(&first.installed_at_unix.to_string()));
        fs::remove_dir_all(&dir).unwrap();
    }
}
