//! Inbound operations for the UI shell. Every command takes plain
//! primitives and reports failures as user-facing text.

use std::path::Path;

use serde::Serialize;
use uuid::Uuid;

use crate::catalog::sample_shops;
use crate::config::PublicAppConfig;
use crate::discovery::{DiscoveryMode, DiscoverySnapshot};
use crate::errors::{AppError, AppResult};
use crate::feed::FeedQuery;
use crate::model::{Coordinates, PlaceRecord};
use crate::settings::{SettingsPatch, SettingsView};
use crate::store::{PopulateSummary, StoreStatus, UpsertSummary};
use crate::telemetry::TelemetryEvent;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub data_dir: String,
    pub store: StoreStatus,
    pub telemetry_buffer_path: String,
    pub telemetry_pending: usize,
    pub telemetry_enabled: bool,
    pub has_places_key: bool,
    pub credential_source: String,
    pub places_rate_limit_qps: u32,
    pub db_seeded: bool,
    pub db_recovered: bool,
    pub config: PublicAppConfig,
}

fn to_user_error(err: AppError) -> String {
    err.user_message()
}

fn parse_id(id: &str) -> Option<Uuid> {
    Uuid::parse_str(id.trim()).ok()
}

pub async fn discover_new(
    state: &AppState,
    latitude: f64,
    longitude: f64,
) -> Result<Vec<PlaceRecord>, String> {
    run_discovery(state, DiscoveryMode::NewPlaces, Coordinates::new(latitude, longitude)).await
}

pub async fn discover_best_reviewed(
    state: &AppState,
    latitude: f64,
    longitude: f64,
) -> Result<Vec<PlaceRecord>, String> {
    run_discovery(
        state,
        DiscoveryMode::BestReviewed,
        Coordinates::new(latitude, longitude),
    )
    .await
}

async fn run_discovery(
    state: &AppState,
    mode: DiscoveryMode,
    center: Coordinates,
) -> Result<Vec<PlaceRecord>, String> {
    let discovery = state.discovery();
    let result = match mode {
        DiscoveryMode::NewPlaces => discovery.discover_new(center).await,
        DiscoveryMode::BestReviewed => discovery.discover_best_reviewed(center).await,
    };
    match result {
        Ok(outcome) => {
            state.record_event(TelemetryEvent::DiscoveryCompleted {
                mode,
                queries: outcome.queries,
                merged: outcome.merged,
                published: outcome.published.len(),
            });
            Ok(outcome.published)
        }
        Err(err @ AppError::DiscoveryInFlight(_)) => Err(to_user_error(err)),
        Err(err) => {
            let reason = err.user_message();
            state.record_event(TelemetryEvent::DiscoveryFailed {
                mode,
                reason: reason.clone(),
            });
            Err(reason)
        }
    }
}

/// Unknown or malformed ids are a no-op and report `false`.
pub fn mark_visited(state: &AppState, id: &str) -> bool {
    parse_id(id)
        .map(|id| state.discovery().mark_visited(id))
        .unwrap_or(false)
}

pub fn dismiss(state: &AppState, id: &str) -> bool {
    let Some(record) = parse_id(id).and_then(|id| state.discovery().dismiss_by_id(id)) else {
        return false;
    };
    let name_hash = state.telemetry().hash_name(&record.name);
    state.record_event(TelemetryEvent::ShopDismissed { name_hash });
    true
}

pub fn feed(state: &AppState, mode: DiscoveryMode, query: &FeedQuery) -> Vec<PlaceRecord> {
    state.discovery().feed_view(mode, query)
}

pub fn discovery_snapshot(state: &AppState) -> DiscoverySnapshot {
    state.discovery().snapshot()
}

/// Radius defaults to the one chosen in settings.
pub async fn populate(
    state: &AppState,
    latitude: f64,
    longitude: f64,
    radius_m: Option<u32>,
) -> Result<PopulateSummary, String> {
    let radius_m = radius_m.unwrap_or_else(|| state.settings().populate_radius_m);
    let summary = state
        .store()
        .populate(state.places(), Coordinates::new(latitude, longitude), radius_m)
        .await
        .map_err(to_user_error)?;
    state.record_event(TelemetryEvent::StorePopulated {
        fetched: summary.fetched,
        inserted: summary.inserted,
        updated: summary.updated,
        radius_m,
    });
    Ok(summary)
}

pub fn clear_store(state: &AppState) -> Result<usize, String> {
    let removed = state.store().clear().map_err(to_user_error)?;
    state.record_event(TelemetryEvent::StoreCleared { removed });
    Ok(removed)
}

pub fn stored_shops(state: &AppState) -> Vec<PlaceRecord> {
    state.store().visible()
}

pub fn search(state: &AppState, query: &str) -> Result<Vec<PlaceRecord>, String> {
    state.store().search(query).map_err(to_user_error)
}

pub fn nearby(
    state: &AppState,
    latitude: f64,
    longitude: f64,
    radius_m: Option<f64>,
) -> Result<Vec<PlaceRecord>, String> {
    state
        .store()
        .nearby(Coordinates::new(latitude, longitude), radius_m)
        .map_err(to_user_error)
}

/// Copies the hand-curated catalog into the store.
pub fn import_sample_shops(state: &AppState) -> Result<UpsertSummary, String> {
    let summary = state
        .store()
        .import_records(&sample_shops())
        .map_err(to_user_error)?;
    state.store().fetch_all().map_err(to_user_error)?;
    Ok(summary)
}

pub fn export_store(state: &AppState, destination: &str) -> Result<(), String> {
    state
        .store()
        .export_to(Path::new(destination))
        .map_err(to_user_error)
}

pub fn store_status(state: &AppState) -> Result<StoreStatus, String> {
    state.store().status().map_err(to_user_error)
}

pub fn save_places_api_key(state: &AppState, value: &str) -> Result<(), String> {
    state.save_places_api_key(value).map_err(to_user_error)
}

pub fn update_settings(
    state: &AppState,
    patch: SettingsPatch,
) -> Result<SettingsView, String> {
    state
        .update_settings(|settings| settings.apply(&patch))
        .map(|settings| settings.view())
        .map_err(to_user_error)
}

pub fn health(state: &AppState) -> Result<HealthReport, String> {
    build_health(state).map_err(to_user_error)
}

fn build_health(state: &AppState) -> AppResult<HealthReport> {
    let (db_seeded, db_recovered) = state.db_flags();
    state.telemetry().flush()?;
    Ok(HealthReport {
        data_dir: state.data_dir().display().to_string(),
        store: state.store().status()?,
        telemetry_buffer_path: state.telemetry().buffer_path().display().to_string(),
        telemetry_pending: state.telemetry().pending_count(),
        telemetry_enabled: state.telemetry().is_enabled(),
        has_places_key: state.has_places_key(),
        credential_source: state.credential_source().as_str().to_string(),
        places_rate_limit_qps: state.places().rate_limit_qps(),
        db_seeded,
        db_recovered,
        config: state.config().public_profile(),
    })
}
