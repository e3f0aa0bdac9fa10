pub mod catalog;
pub mod commands;
pub mod config;
pub mod db;
pub mod dedup;
pub mod discovery;
pub mod errors;
pub mod feed;
pub mod model;
pub mod places;
pub mod secrets;
pub mod settings;
pub mod store;
pub mod telemetry;

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::AppConfig;
use crate::db::{bootstrap, DatabaseBootstrap};
use crate::discovery::DiscoveryOrchestrator;
use crate::errors::AppResult;
use crate::places::{ApiKeySlot, PlacesService};
use crate::secrets::{CredentialSource, SecretVault};
use crate::settings::{settings_path, UserSettings};
use crate::store::LocalStore;
use crate::telemetry::{TelemetryClient, TelemetryEvent};

pub use crate::commands::HealthReport;
pub use crate::errors::AppError;
pub use crate::model::{Coordinates, NewnessBadge, PlaceCategory, PlaceRecord};

const VAULT_SERVICE_NAME: &str = "BrewCrew";

/// Everything the UI shell talks to, wired once per process.
pub struct AppState {
    config: AppConfig,
    data_dir: PathBuf,
    vault: SecretVault,
    api_key: ApiKeySlot,
    credential_source: Mutex<CredentialSource>,
    places: PlacesService,
    discovery: DiscoveryOrchestrator,
    store: LocalStore,
    settings: Mutex<UserSettings>,
    settings_path: PathBuf,
    telemetry: TelemetryClient,
    db_seeded: bool,
    db_recovered: bool,
}

impl AppState {
    /// Reads configuration from the environment and opens the store under
    /// `data_dir`, using the OS keychain for credentials.
    pub fn initialize<P: AsRef<Path>>(data_dir: P) -> AppResult<Self> {
        init_tracing();
        let config = AppConfig::from_env();
        Self::with_config(data_dir, config, SecretVault::new(VAULT_SERVICE_NAME))
    }

    pub fn with_config<P: AsRef<Path>>(
        data_dir: P,
        config: AppConfig,
        vault: SecretVault,
    ) -> AppResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let settings_path = settings_path(&data_dir);
        let settings = UserSettings::load_or_init(&settings_path, &config)?;

        let (key, credential_source) = vault.resolve_places_api_key(&config)?;
        let api_key = ApiKeySlot::new(key);
        let places = PlacesService::new(&config, api_key.clone())?;
        places.set_rate_limit(settings.places_rate_limit_qps);

        let DatabaseBootstrap {
            context,
            seeded,
            recovered,
        } = bootstrap(
            &data_dir,
            &config.database_file_name,
            config.seed_database_path.as_deref(),
        )?;
        let store = LocalStore::new(context);
        let stored = store.fetch_all()?.len();

        let telemetry = TelemetryClient::new(&data_dir, &config, &settings.telemetry_salt)?;
        telemetry.set_enabled(settings.telemetry_enabled);
        let discovery = DiscoveryOrchestrator::from_config(places.clone(), &config);

        info!(
            target: "app_state",
            data_dir = %data_dir.display(),
            credential = credential_source.as_str(),
            stored,
            seeded,
            recovered,
            "app state initialized"
        );
        if credential_source == CredentialSource::Missing {
            warn!(
                target: "app_state",
                "no places API key configured; discovery and populate will fail until one is saved"
            );
        }

        Ok(Self {
            config,
            data_dir,
            vault,
            api_key,
            credential_source: Mutex::new(credential_source),
            places,
            discovery,
            store,
            settings: Mutex::new(settings),
            settings_path,
            telemetry,
            db_seeded: seeded,
            db_recovered: recovered,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn discovery(&self) -> &DiscoveryOrchestrator {
        &self.discovery
    }

    pub fn places(&self) -> &PlacesService {
        &self.places
    }

    pub fn telemetry(&self) -> &TelemetryClient {
        &self.telemetry
    }

    pub fn settings(&self) -> UserSettings {
        self.settings.lock().clone()
    }

    pub fn credential_source(&self) -> CredentialSource {
        *self.credential_source.lock()
    }

    /// Persists the key and makes it live for the running clients.
    pub fn save_places_api_key(&self, value: &str) -> AppResult<()> {
        let secret = self.vault.store_places_api_key(value)?;
        self.api_key.set(Some(secret));
        let mut source = self.credential_source.lock();
        if *source != CredentialSource::Environment {
            *source = CredentialSource::Vault;
        }
        Ok(())
    }

    pub(crate) fn update_settings<F>(&self, update: F) -> AppResult<UserSettings>
    where
        F: FnOnce(&mut UserSettings),
    {
        let mut settings = self.settings.lock();
        update(&mut settings);
        settings.persist(&self.settings_path)?;
        self.places.set_rate_limit(settings.places_rate_limit_qps);
        self.telemetry.set_enabled(settings.telemetry_enabled);
        Ok(settings.clone())
    }

    /// Telemetry is best effort; failures are logged and swallowed.
    pub(crate) fn record_event(&self, event: TelemetryEvent) {
        if let Err(err) = self.telemetry.record(event) {
            warn!(target: "telemetry", ?err, "failed to record telemetry event");
        }
    }

    pub(crate) fn db_flags(&self) -> (bool, bool) {
        (self.db_seeded, self.db_recovered)
    }

    pub(crate) fn has_places_key(&self) -> bool {
        self.api_key.is_set()
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,brewcrew_lib=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
