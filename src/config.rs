use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_TELEMETRY_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_TELEMETRY_BUFFER_MAX_FILES: usize = 5;
pub const MIN_PAGE_DELAY_MS: u64 = 2_000;
/// Nearby search never accumulates more than this many results.
pub const MAX_NEARBY_RESULTS: usize = 100;
pub const DEFAULT_NEARBY_ENDPOINT: &str =
    "https://maps.googleapis.com/maps/api/place/nearbysearch/json";
pub const DEFAULT_TEXT_ENDPOINT: &str =
    "https://maps.googleapis.com/maps/api/place/textsearch/json";
const DEFAULT_DISCOVERY_AREAS: &[&str] = &["Raleigh NC", "Durham NC", "Cary NC", "Chapel Hill NC"];

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub telemetry_enabled_by_default: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
    pub telemetry_buffer_max_files: usize,
    pub places_rate_limit_qps: u32,
    pub places_page_delay_ms: u64,
    pub places_max_nearby_results: usize,
    pub places_nearby_endpoint: String,
    pub places_text_endpoint: String,
    pub discovery_concurrency: usize,
    pub discovery_areas: Vec<String>,
    pub discovery_radius_m: u32,
    pub database_file_name: String,
    pub seed_database_path: Option<PathBuf>,
    pub google_places_api_key: Option<SecretString>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub telemetry_enabled_by_default: bool,
    pub telemetry_batch_size: usize,
    pub places_rate_limit_qps: u32,
    pub places_page_delay_ms: u64,
    pub places_max_nearby_results: usize,
    pub discovery_concurrency: usize,
    pub discovery_areas: Vec<String>,
    pub discovery_radius_m: u32,
    pub database_file_name: String,
    pub has_seed_database: bool,
    pub has_google_places_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            telemetry_enabled_by_default: parse_bool("TELEMETRY_ENABLED", true),
            telemetry_batch_size: parse_usize("TELEMETRY_BATCH_SIZE", 25).max(1),
            telemetry_buffer_max_bytes: parse_u64(
                "TELEMETRY_BUFFER_MAX_BYTES",
                DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            ),
            telemetry_buffer_max_files: parse_usize(
                "TELEMETRY_BUFFER_MAX_FILES",
                DEFAULT_TELEMETRY_BUFFER_MAX_FILES,
            )
            .max(1),
            places_rate_limit_qps: parse_u32("PLACES_RATE_LIMIT_QPS", 3),
            places_page_delay_ms: parse_u64("PLACES_PAGE_DELAY_MS", MIN_PAGE_DELAY_MS)
                .max(MIN_PAGE_DELAY_MS),
            places_max_nearby_results: parse_usize("PLACES_MAX_NEARBY_RESULTS", MAX_NEARBY_RESULTS)
                .clamp(1, MAX_NEARBY_RESULTS),
            places_nearby_endpoint: env::var("PLACES_NEARBY_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_NEARBY_ENDPOINT.to_string()),
            places_text_endpoint: env::var("PLACES_TEXT_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_TEXT_ENDPOINT.to_string()),
            discovery_concurrency: parse_usize("DISCOVERY_CONCURRENCY", 4).max(1),
            discovery_areas: parse_list("DISCOVERY_AREAS", DEFAULT_DISCOVERY_AREAS),
            discovery_radius_m: parse_u32("DISCOVERY_RADIUS_M", 15_000),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "brewcrew.db".to_string()),
            seed_database_path: env::var("SEED_DATABASE_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            google_places_api_key: env::var("GOOGLE_PLACES_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            telemetry_enabled_by_default: true,
            telemetry_batch_size: 1,
            telemetry_buffer_max_bytes: 1024,
            telemetry_buffer_max_files: 3,
            places_rate_limit_qps: 10,
            places_page_delay_ms: MIN_PAGE_DELAY_MS,
            places_max_nearby_results: MAX_NEARBY_RESULTS,
            places_nearby_endpoint: DEFAULT_NEARBY_ENDPOINT.to_string(),
            places_text_endpoint: DEFAULT_TEXT_ENDPOINT.to_string(),
            discovery_concurrency: 2,
            discovery_areas: vec!["Raleigh NC".into(), "Durham NC".into()],
            discovery_radius_m: 15_000,
            database_file_name: "test.db".into(),
            seed_database_path: None,
            google_places_api_key: None,
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            telemetry_enabled_by_default: self.telemetry_enabled_by_default,
            telemetry_batch_size: self.telemetry_batch_size,
            places_rate_limit_qps: self.places_rate_limit_qps,
            places_page_delay_ms: self.places_page_delay_ms,
            places_max_nearby_results: self.places_max_nearby_results,
            discovery_concurrency: self.discovery_concurrency,
            discovery_areas: self.discovery_areas.clone(),
            discovery_radius_m: self.discovery_radius_m,
            database_file_name: self.database_file_name.clone(),
            has_seed_database: self.seed_database_path.is_some(),
            has_google_places_key: self.google_places_api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_list(key: &str, default: &[&str]) -> Vec<String> {
    let parsed = env::var(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    if parsed.is_empty() {
        default.iter().map(|item| item.to_string()).collect()
    } else {
        parsed
    }
}
