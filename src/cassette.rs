//! Persistent collection of named Records backed by a single JSON file.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::record::{Exchange, Record};
use crate::{PlayerError, Result};

/// A cassette file path plus the Records it holds.
///
/// The in-memory map needs no synchronization of its own: every operation a
/// [`crate::player::Player`] performs on a Cassette happens while its
/// `statelock` is already held, so a plain owned map is sufficient.
pub struct Cassette {
    path: PathBuf,
    records: HashMap<String, Vec<Exchange>>,
}

impl Cassette {
    /// Open a cassette at `path`. If the file exists it is parsed eagerly;
    /// if it does not, the in-memory collection starts empty and the file
    /// is created on first [`Cassette::save`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed as
    /// the cassette JSON object shape.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let records = if path.exists() {
            debug!("Loading cassette: {}", path.display());
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            HashMap::new()
        };

        Ok(Self { path, records })
    }

    /// The cassette's file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a record with this name exists in the cassette.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    /// Resolve a Record by name, if present.
    ///
    /// Each call returns an independent Record instance (cursor at 0) so
    /// that concurrent lookups of the same name never share cursor state.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Record> {
        self.records
            .get(name)
            .map(|exchanges| Record::from_exchanges(name, exchanges.clone()))
    }

    /// The names of every record currently in the cassette.
    #[must_use]
    pub fn record_names(&self) -> Vec<&str> {
        self.records.keys().map(String::as_str).collect()
    }

    /// Upsert a Record by name, then atomically rewrite the cassette file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be serialized or written.
    pub fn save(&mut self, record: &Record) -> Result<()> {
        self.records
            .insert(record.name().to_string(), record.exchanges().to_vec());
        self.persist()
    }

    /// Serialize the whole cassette to a temporary sibling file, then
    /// rename it over the target path -- atomic against crashes mid-write.
    fn persist(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.records)?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.flush()?;
        tmp.persist(&self.path)
            .map_err(|e| PlayerError::IoFailure(e.error))?;

        info!("Saved cassette: {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockRequest, MockResponse};
    use tempfile::TempDir;

    fn exchange(path: &str) -> Exchange {
        Exchange {
            request: MockRequest {
                method: "GET".to_string(),
                uri: format!("https://api.example.com{path}"),
                content: None,
                headers: None,
                cookies: None,
            },
            response: MockResponse {
                status_code: 200,
                status_description: "OK".to_string(),
                content: Some(r#"{"id":"u1"}"#.to_string()),
                headers: None,
                cookies: None,
            },
        }
    }

    #[test]
    fn opening_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let cassette = Cassette::open(dir.path().join("cassette.json")).unwrap();

        assert!(!cassette.contains("r1"));
        assert!(cassette.find("r1").is_none());
    }

    #[test]
    fn save_then_find_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cassette.json");
        let mut cassette = Cassette::open(&path).unwrap();

        let mut record = Record::new("r1");
        record.write(exchange("/users/u1"));
        cassette.save(&record).unwrap();

        let reopened = Cassette::open(&path).unwrap();
        assert!(reopened.contains("r1"));
        let found = reopened.find("r1").unwrap();
        assert_eq!(found.length(), 1);
        assert_eq!(found.exchanges()[0].request.uri, "https://api.example.com/users/u1");
    }

    #[test]
    fn find_returns_independent_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cassette.json");
        let mut cassette = Cassette::open(&path).unwrap();

        let mut record = Record::new("r1");
        record.write(exchange("/a"));
        cassette.save(&record).unwrap();

        let mut first = cassette.find("r1").unwrap();
        let second = cassette.find("r1").unwrap();

        first.read().unwrap();
        assert_eq!(first.index(), 1);
        assert_eq!(second.index(), 0);
    }

    #[test]
    fn save_is_atomic_against_partial_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cassette.json");
        let mut cassette = Cassette::open(&path).unwrap();

        let mut record = Record::new("r1");
        record.write(exchange("/a"));
        cassette.save(&record).unwrap();

        // No stray temp files left behind in the cassette's directory.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.path() != path)
            .collect();
        assert!(leftovers.is_empty());
    }
}
