use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::AppConfig;
use crate::discovery::DiscoveryMode;
use crate::errors::AppResult;

const BUFFER_STEM: &str = "telemetry-buffer";

/// Local-only usage events. Shop names are salted and hashed before they
/// reach disk.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    DiscoveryCompleted {
        mode: DiscoveryMode,
        queries: usize,
        merged: usize,
        published: usize,
    },
    DiscoveryFailed {
        mode: DiscoveryMode,
        reason: String,
    },
    StorePopulated {
        fetched: usize,
        inserted: usize,
        updated: usize,
        radius_m: u32,
    },
    StoreCleared {
        removed: usize,
    },
    ShopDismissed {
        name_hash: String,
    },
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a TelemetryEvent,
}

#[derive(Clone)]
pub struct TelemetryClient {
    enabled: Arc<AtomicBool>,
    salt: Arc<Mutex<String>>,
    pending: Arc<Mutex<Vec<(DateTime<Utc>, TelemetryEvent)>>>,
    buffer_path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
    max_file_count: usize,
}

impl TelemetryClient {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig, salt: &str) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let buffer_path = data_dir.join(format!("{BUFFER_STEM}.jsonl"));
        Ok(Self {
            enabled: Arc::new(AtomicBool::new(config.telemetry_enabled_by_default)),
            salt: Arc::new(Mutex::new(salt.to_string())),
            pending: Arc::new(Mutex::new(Vec::new())),
            buffer_path,
            batch_size: config.telemetry_batch_size.max(1),
            max_file_bytes: config.telemetry_buffer_max_bytes,
            max_file_count: config.telemetry_buffer_max_files.max(1),
        })
    }

    /// Queues the event and writes the batch once it is full. Disabled
    /// clients drop events silently.
    pub fn record(&self, event: TelemetryEvent) -> AppResult<()> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        let mut pending = self.pending.lock();
        pending.push((Utc::now(), event));
        if pending.len() >= self.batch_size {
            self.write_pending(&mut pending)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut pending = self.pending.lock();
        self.write_pending(&mut pending)
    }

    pub fn hash_name(&self, name: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.lock().as_bytes());
        hasher.update(name.trim().to_lowercase().as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize())
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.pending.lock().clear();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn buffer_path(&self) -> &Path {
        &self.buffer_path
    }

    fn write_pending(&self, pending: &mut Vec<(DateTime<Utc>, TelemetryEvent)>) -> AppResult<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let mut lines = Vec::new();
        for (timestamp, event) in pending.iter() {
            let envelope = Envelope {
                timestamp: *timestamp,
                event,
            };
            serde_json::to_writer(&mut lines, &envelope)?;
            lines.push(b'\n');
        }

        self.rotate_if_needed(lines.len() as u64)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.buffer_path)?;
        file.write_all(&lines)?;
        file.flush()?;
        debug!(target: "telemetry", events = pending.len(), "telemetry batch written");
        pending.clear();
        Ok(())
    }

    /// Shifts `buffer.jsonl` to `buffer.1.jsonl` and so on, dropping the
    /// oldest file beyond the configured count.
    fn rotate_if_needed(&self, incoming_bytes: u64) -> AppResult<()> {
        let current = fs::metadata(&self.buffer_path).map(|m| m.len()).unwrap_or(0);
        if current == 0 || current + incoming_bytes <= self.max_file_bytes {
            return Ok(());
        }
        if self.max_file_count == 1 {
            return remove_if_exists(&self.buffer_path);
        }

        let oldest = self.rotation_path(self.max_file_count - 1);
        remove_if_exists(&oldest)?;
        for index in (1..self.max_file_count - 1).rev() {
            let from = self.rotation_path(index);
            if from.exists() {
                fs::rename(&from, self.rotation_path(index + 1))?;
            }
        }
        fs::rename(&self.buffer_path, self.rotation_path(1))?;
        Ok(())
    }

    fn rotation_path(&self, index: usize) -> PathBuf {
        self.buffer_path
            .with_file_name(format!("{BUFFER_STEM}.{index}.jsonl"))
    }
}

fn remove_if_exists(path: &Path) -> AppResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn client(dir: &Path, config: &AppConfig) -> TelemetryClient {
        TelemetryClient::new(dir, config, "pepper").unwrap()
    }

    #[test]
    fn writes_tagged_events_to_disk() {
        let dir = tempdir().unwrap();
        let telemetry = client(dir.path(), &AppConfig::for_tests());
        telemetry
            .record(TelemetryEvent::DiscoveryCompleted {
                mode: DiscoveryMode::NewPlaces,
                queries: 16,
                merged: 40,
                published: 7,
            })
            .unwrap();

        let buffer = fs::read_to_string(telemetry.buffer_path()).unwrap();
        let line: serde_json::Value = serde_json::from_str(buffer.trim()).unwrap();
        assert_eq!(line["event"], "discovery_completed");
        assert_eq!(line["mode"], "new_places");
        assert_eq!(line["published"], 7);
        assert!(line["timestamp"].is_string());
    }

    #[test]
    fn batches_until_full_and_flushes_on_demand() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::for_tests();
        config.telemetry_batch_size = 3;
        let telemetry = client(dir.path(), &config);
        telemetry.record(TelemetryEvent::StoreCleared { removed: 1 }).unwrap();
        telemetry.record(TelemetryEvent::StoreCleared { removed: 2 }).unwrap();
        assert_eq!(telemetry.pending_count(), 2);
        assert!(!telemetry.buffer_path().exists());

        telemetry.flush().unwrap();
        assert_eq!(telemetry.pending_count(), 0);
        let buffer = fs::read_to_string(telemetry.buffer_path()).unwrap();
        assert_eq!(buffer.lines().count(), 2);
    }

    #[test]
    fn disabled_client_drops_events() {
        let dir = tempdir().unwrap();
        let telemetry = client(dir.path(), &AppConfig::for_tests());
        telemetry.set_enabled(false);
        telemetry.record(TelemetryEvent::StoreCleared { removed: 3 }).unwrap();
        telemetry.flush().unwrap();
        assert!(!telemetry.buffer_path().exists());
    }

    #[test]
    fn hashes_names_with_salt() {
        let dir = tempdir().unwrap();
        let config = AppConfig::for_tests();
        let telemetry = client(dir.path(), &config);
        let other = TelemetryClient::new(dir.path(), &config, "salt-two").unwrap();

        let hash = telemetry.hash_name("Sola Coffee");
        assert_eq!(hash, telemetry.hash_name("  sola coffee "));
        assert_ne!(hash, other.hash_name("Sola Coffee"));
        assert!(!hash.contains("Sola"));
    }

    #[test]
    fn rotates_and_caps_file_count() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::for_tests();
        config.telemetry_buffer_max_bytes = 64;
        config.telemetry_buffer_max_files = 3;
        let telemetry = client(dir.path(), &config);
        for removed in 0..6 {
            telemetry.record(TelemetryEvent::StoreCleared { removed }).unwrap();
        }

        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "telemetry-buffer.1.jsonl",
                "telemetry-buffer.2.jsonl",
                "telemetry-buffer.jsonl",
            ]
        );
        let newest = fs::read_to_string(telemetry.buffer_path()).unwrap();
        assert!(newest.contains("\"removed\":5"));
    }
}
