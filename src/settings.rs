use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const SETTINGS_FILE: &str = "settings.json";
const QPS_RANGE: (u32, u32) = (1, 10);
const SALT_BYTES: usize = 32;
/// Radii offered by the populate sheet, in meters.
pub const POPULATE_RADIUS_OPTIONS_M: [u32; 5] = [5_000, 10_000, 15_000, 25_000, 50_000];

/// Preferences kept in `settings.json` beside the shop store. Values read
/// from disk are normalized, so a hand-edited file cannot push the rate limit
/// or the populate radius outside what the app offers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettings {
    pub telemetry_enabled: bool,
    pub places_rate_limit_qps: u32,
    #[serde(default)]
    pub populate_radius_m: u32,
    #[serde(default)]
    pub telemetry_salt: String,
}

/// What the settings screen shows; the telemetry salt stays on disk.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsView {
    pub telemetry_enabled: bool,
    pub places_rate_limit_qps: u32,
    pub populate_radius_m: u32,
    pub populate_radius_options_m: Vec<u32>,
}

/// Partial update from the settings screen; absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub telemetry_enabled: Option<bool>,
    pub places_rate_limit_qps: Option<u32>,
    pub populate_radius_m: Option<u32>,
}

impl UserSettings {
    /// Reads the settings file, writing fresh defaults when it is missing or
    /// unreadable as JSON.
    pub fn load_or_init(path: &Path, config: &AppConfig) -> AppResult<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(target: "settings", path = %path.display(), "no settings file; writing defaults");
                return Self::init(path, config);
            }
            Err(err) => return Err(AppError::Io(err)),
        };

        let mut settings = match serde_json::from_str::<Self>(&contents) {
            Ok(settings) => settings,
            Err(err) => {
                warn!(target: "settings", error = ?err, "settings file unreadable; regenerating defaults");
                return Self::init(path, config);
            }
        };
        if settings.normalize() {
            settings.persist(path)?;
        }
        Ok(settings)
    }

    pub fn persist(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn view(&self) -> SettingsView {
        SettingsView {
            telemetry_enabled: self.telemetry_enabled,
            places_rate_limit_qps: self.places_rate_limit_qps,
            populate_radius_m: self.populate_radius_m,
            populate_radius_options_m: POPULATE_RADIUS_OPTIONS_M.to_vec(),
        }
    }

    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(enabled) = patch.telemetry_enabled {
            self.telemetry_enabled = enabled;
        }
        if let Some(qps) = patch.places_rate_limit_qps {
            self.places_rate_limit_qps = clamp_qps(qps);
        }
        if let Some(radius) = patch.populate_radius_m {
            self.populate_radius_m = snap_radius(radius);
        }
    }

    fn init(path: &Path, config: &AppConfig) -> AppResult<Self> {
        let settings = Self {
            telemetry_enabled: config.telemetry_enabled_by_default,
            places_rate_limit_qps: clamp_qps(config.places_rate_limit_qps),
            populate_radius_m: snap_radius(config.discovery_radius_m),
            telemetry_salt: generate_salt(),
        };
        settings.persist(path)?;
        Ok(settings)
    }

    /// Returns `true` when anything had to change.
    fn normalize(&mut self) -> bool {
        let before = (self.places_rate_limit_qps, self.populate_radius_m);
        self.places_rate_limit_qps = clamp_qps(self.places_rate_limit_qps);
        self.populate_radius_m = snap_radius(self.populate_radius_m);
        let salted = self.telemetry_salt.trim().is_empty();
        if salted {
            self.telemetry_salt = generate_salt();
        }
        salted || before != (self.places_rate_limit_qps, self.populate_radius_m)
    }
}

fn clamp_qps(value: u32) -> u32 {
    value.clamp(QPS_RANGE.0, QPS_RANGE.1)
}

/// Nearest offered radius; ties go to the smaller option.
fn snap_radius(value: u32) -> u32 {
    POPULATE_RADIUS_OPTIONS_M
        .iter()
        .copied()
        .min_by_key(|option| option.abs_diff(value))
        .unwrap_or(POPULATE_RADIUS_OPTIONS_M[0])
}

fn generate_salt() -> String {
    let mut bytes = [0_u8; SALT_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SETTINGS_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn first_launch_writes_defaults_from_config() {
        let dir = tempdir().unwrap();
        let path = settings_path(dir.path());
        let settings = UserSettings::load_or_init(&path, &AppConfig::for_tests()).unwrap();
        assert!(path.exists());
        assert_eq!(settings.places_rate_limit_qps, 10);
        assert_eq!(settings.populate_radius_m, 15_000);
        assert_eq!(settings.telemetry_salt.len(), 43);
        assert_eq!(settings.view().populate_radius_options_m.len(), 5);
    }

    #[test]
    fn patch_is_clamped_and_survives_reload() {
        let dir = tempdir().unwrap();
        let config = AppConfig::for_tests();
        let path = settings_path(dir.path());
        let mut settings = UserSettings::load_or_init(&path, &config).unwrap();
        settings.apply(&SettingsPatch {
            telemetry_enabled: Some(false),
            places_rate_limit_qps: Some(0),
            populate_radius_m: Some(30_000),
        });
        settings.persist(&path).unwrap();

        let reloaded = UserSettings::load_or_init(&path, &config).unwrap();
        assert!(!reloaded.telemetry_enabled);
        assert_eq!(reloaded.places_rate_limit_qps, 1);
        assert_eq!(reloaded.populate_radius_m, 25_000);
        assert_eq!(reloaded.telemetry_salt, settings.telemetry_salt);
    }

    #[test]
    fn hand_edited_values_are_normalized_on_load() {
        let dir = tempdir().unwrap();
        let path = settings_path(dir.path());
        fs::write(
            &path,
            r#"{"telemetry_enabled": false, "places_rate_limit_qps": 99, "populate_radius_m": 7000}"#,
        )
        .unwrap();

        let settings = UserSettings::load_or_init(&path, &AppConfig::for_tests()).unwrap();
        assert!(!settings.telemetry_enabled);
        assert_eq!(settings.places_rate_limit_qps, 10);
        assert_eq!(settings.populate_radius_m, 5_000);
        assert!(!settings.telemetry_salt.is_empty());

        let on_disk: UserSettings = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.telemetry_salt, settings.telemetry_salt);
        assert_eq!(on_disk.places_rate_limit_qps, 10);
    }

    #[test]
    fn unreadable_file_is_regenerated() {
        let dir = tempdir().unwrap();
        let path = settings_path(dir.path());
        fs::write(&path, "{not json").unwrap();
        let settings = UserSettings::load_or_init(&path, &AppConfig::for_tests()).unwrap();
        assert!(settings.telemetry_enabled);
        assert!(serde_json::from_str::<UserSettings>(&fs::read_to_string(&path).unwrap()).is_ok());
    }

    #[test]
    fn snaps_radius_to_offered_options() {
        assert_eq!(snap_radius(0), 5_000);
        assert_eq!(snap_radius(12_000), 10_000);
        assert_eq!(snap_radius(12_500), 10_000);
        assert_eq!(snap_radius(13_000), 15_000);
        assert_eq!(snap_radius(1_000_000), 50_000);
    }
}
