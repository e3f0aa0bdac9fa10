use std::collections::HashSet;

use futures_util::{stream, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::sample_shops;
use crate::config::AppConfig;
use crate::dedup::{filter_excluded, merge, rank_best_reviewed, rank_new, EXCLUDED_TERMS};
use crate::errors::{sanitize_error_copy, AppError, AppResult};
use crate::feed::FeedQuery;
use crate::model::{Coordinates, PlaceRecord};
use crate::places::{PlacesService, ProviderPlace};

const CATEGORY_TERMS: &[&str] = &[
    "coffee shops",
    "cafe",
    "espresso",
    "bakery",
    "dessert shops",
    "ice cream",
    "donuts",
    "pastry shops",
];
const BEST_REVIEWED_PREFIXES: &[&str] = &["best", "top rated", "popular"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    NewPlaces,
    BestReviewed,
}

impl DiscoveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryMode::NewPlaces => "new_places",
            DiscoveryMode::BestReviewed => "best_reviewed",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            DiscoveryMode::NewPlaces => "new places",
            DiscoveryMode::BestReviewed => "top rated places",
        }
    }
}

/// One text query per category and area, e.g. "espresso Durham NC".
pub fn new_places_queries(areas: &[String]) -> Vec<String> {
    CATEGORY_TERMS
        .iter()
        .flat_map(|category| areas.iter().map(move |area| format!("{category} {area}")))
        .collect()
}

/// Same battery as [`new_places_queries`], each prefixed with a popularity qualifier.
pub fn best_reviewed_queries(areas: &[String]) -> Vec<String> {
    new_places_queries(areas)
        .into_iter()
        .enumerate()
        .map(|(index, query)| {
            let prefix = BEST_REVIEWED_PREFIXES[index % BEST_REVIEWED_PREFIXES.len()];
            format!("{prefix} {query}")
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoverySnapshot {
    pub new_feed: Vec<PlaceRecord>,
    pub best_reviewed_feed: Vec<PlaceRecord>,
    pub is_loading: bool,
    pub last_error: Option<String>,
    pub last_center: Option<Coordinates>,
    pub known_shop_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryOutcome {
    pub mode: DiscoveryMode,
    pub queries: usize,
    pub merged: usize,
    pub published: Vec<PlaceRecord>,
}

#[derive(Default)]
struct DiscoveryState {
    known_shop_names: HashSet<String>,
    new_feed: Vec<PlaceRecord>,
    best_reviewed_feed: Vec<PlaceRecord>,
    in_flight: usize,
    last_error: Option<String>,
    last_center: Option<Coordinates>,
}

/// Holds one unit of `in_flight` until dropped, so a cancelled discovery
/// still clears the loading flag.
struct InFlight<'a> {
    state: &'a Mutex<DiscoveryState>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

pub struct DiscoveryOrchestrator {
    places: PlacesService,
    areas: Vec<String>,
    concurrency: usize,
    state: Mutex<DiscoveryState>,
    new_places_flight: AsyncMutex<()>,
    best_reviewed_flight: AsyncMutex<()>,
}

impl DiscoveryOrchestrator {
    pub fn new(
        places: PlacesService,
        areas: Vec<String>,
        concurrency: usize,
        known_shops: &[PlaceRecord],
    ) -> Self {
        let state = DiscoveryState {
            known_shop_names: known_shops.iter().map(PlaceRecord::name_key).collect(),
            ..DiscoveryState::default()
        };
        Self {
            places,
            areas,
            concurrency: concurrency.max(1),
            state: Mutex::new(state),
            new_places_flight: AsyncMutex::new(()),
            best_reviewed_flight: AsyncMutex::new(()),
        }
    }

    pub fn from_config(places: PlacesService, config: &AppConfig) -> Self {
        Self::new(
            places,
            config.discovery_areas.clone(),
            config.discovery_concurrency,
            &sample_shops(),
        )
    }

    pub fn places(&self) -> &PlacesService {
        &self.places
    }

    /// Refreshes the new-places feed with venues whose names have not been seen.
    /// A second call while one is running is rejected.
    pub async fn discover_new(&self, center: Coordinates) -> AppResult<DiscoveryOutcome> {
        let mode = DiscoveryMode::NewPlaces;
        let _flight = self
            .new_places_flight
            .try_lock()
            .map_err(|_| AppError::DiscoveryInFlight(mode))?;
        let queries = new_places_queries(&self.areas);
        let _loading = self.begin(center);

        let merged = match self.collect(&queries).await {
            Ok(merged) => merged,
            Err(err) => return Err(self.fail(mode, err)),
        };
        let merged_count = merged.len();
        let ranked = rank_new(filter_excluded(
            merged.iter().map(ProviderPlace::to_record).collect(),
            EXCLUDED_TERMS,
        ));

        let published = {
            let mut state = self.state.lock();
            let unknown: Vec<PlaceRecord> = ranked
                .into_iter()
                .filter(|record| !state.known_shop_names.contains(&record.name_key()))
                .collect();
            state
                .known_shop_names
                .extend(unknown.iter().map(PlaceRecord::name_key));
            state.new_feed = unknown.clone();
            unknown
        };

        info!(
            target: "discovery",
            mode = mode.as_str(),
            lat = center.latitude,
            lng = center.longitude,
            queries = queries.len(),
            merged = merged_count,
            published = published.len(),
            "discovery feed refreshed"
        );
        Ok(DiscoveryOutcome {
            mode,
            queries: queries.len(),
            merged: merged_count,
            published,
        })
    }

    /// Refreshes the best-reviewed feed. Known names are not filtered here.
    pub async fn discover_best_reviewed(&self, center: Coordinates) -> AppResult<DiscoveryOutcome> {
        let mode = DiscoveryMode::BestReviewed;
        let _flight = self
            .best_reviewed_flight
            .try_lock()
            .map_err(|_| AppError::DiscoveryInFlight(mode))?;
        let queries = best_reviewed_queries(&self.areas);
        let _loading = self.begin(center);

        let merged = match self.collect(&queries).await {
            Ok(merged) => merged,
            Err(err) => return Err(self.fail(mode, err)),
        };
        let merged_count = merged.len();
        let published = rank_best_reviewed(filter_excluded(
            merged.iter().map(ProviderPlace::to_record).collect(),
            EXCLUDED_TERMS,
        ));

        {
            let mut state = self.state.lock();
            state.best_reviewed_feed = published.clone();
        }

        info!(
            target: "discovery",
            mode = mode.as_str(),
            lat = center.latitude,
            lng = center.longitude,
            queries = queries.len(),
            merged = merged_count,
            published = published.len(),
            "discovery feed refreshed"
        );
        Ok(DiscoveryOutcome {
            mode,
            queries: queries.len(),
            merged: merged_count,
            published,
        })
    }

    /// Removes the record from the new-places feed. Unknown ids are ignored.
    pub fn mark_visited(&self, id: Uuid) -> bool {
        let mut state = self.state.lock();
        let before = state.new_feed.len();
        state.new_feed.retain(|record| record.id != id);
        before != state.new_feed.len()
    }

    /// Removes the record from the new-places feed and suppresses its name
    /// from later discoveries.
    pub fn dismiss(&self, record: &PlaceRecord) {
        let mut state = self.state.lock();
        state.new_feed.retain(|existing| existing.id != record.id);
        state.known_shop_names.insert(record.name_key());
    }

    /// Looks the record up in either feed; returns it when found and dismissed.
    pub fn dismiss_by_id(&self, id: Uuid) -> Option<PlaceRecord> {
        let record = {
            let state = self.state.lock();
            state
                .new_feed
                .iter()
                .chain(state.best_reviewed_feed.iter())
                .find(|record| record.id == id)
                .cloned()
        }?;
        self.dismiss(&record);
        Some(record)
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.state
            .lock()
            .known_shop_names
            .contains(&name.to_lowercase())
    }

    pub fn new_feed(&self) -> Vec<PlaceRecord> {
        self.state.lock().new_feed.clone()
    }

    pub fn best_reviewed_feed(&self) -> Vec<PlaceRecord> {
        self.state.lock().best_reviewed_feed.clone()
    }

    pub fn feed_view(&self, mode: DiscoveryMode, query: &FeedQuery) -> Vec<PlaceRecord> {
        let state = self.state.lock();
        match mode {
            DiscoveryMode::NewPlaces => query.apply(&state.new_feed, true),
            DiscoveryMode::BestReviewed => query.apply(&state.best_reviewed_feed, false),
        }
    }

    pub fn is_loading(&self) -> bool {
        self.state.lock().in_flight > 0
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    pub fn snapshot(&self) -> DiscoverySnapshot {
        let state = self.state.lock();
        DiscoverySnapshot {
            new_feed: state.new_feed.clone(),
            best_reviewed_feed: state.best_reviewed_feed.clone(),
            is_loading: state.in_flight > 0,
            last_error: state.last_error.clone(),
            last_center: state.last_center,
            known_shop_count: state.known_shop_names.len(),
        }
    }

    fn begin(&self, center: Coordinates) -> InFlight<'_> {
        let mut state = self.state.lock();
        state.in_flight += 1;
        state.last_error = None;
        state.last_center = Some(center);
        InFlight { state: &self.state }
    }

    fn fail(&self, mode: DiscoveryMode, err: AppError) -> AppError {
        let message = format!("Failed to discover coffee shops: {}", err.user_message());
        warn!(
            target: "discovery",
            mode = mode.as_str(),
            error = %sanitize_error_copy(&err.to_string()),
            "discovery failed; keeping previous feed"
        );
        self.state.lock().last_error = Some(message);
        err
    }

    /// Runs the text queries with bounded concurrency and merges the batches
    /// in submission order once all of them have completed.
    async fn collect(&self, queries: &[String]) -> AppResult<Vec<ProviderPlace>> {
        let batches: Vec<Vec<ProviderPlace>> = stream::iter(queries)
            .map(|query| self.places.search_by_text(query))
            .buffered(self.concurrency)
            .try_collect()
            .await?;
        Ok(merge(batches))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::places::{fixture, PlaceSearch};

    const CENTER: Coordinates = Coordinates {
        latitude: 35.7796,
        longitude: -78.6382,
    };

    #[derive(Default)]
    struct FakeSearch {
        responses: HashMap<String, Vec<ProviderPlace>>,
        delays_ms: HashMap<String, u64>,
        fail: AtomicBool,
        calls: AtomicUsize,
    }

    impl FakeSearch {
        fn respond(mut self, query: &str, places: Vec<ProviderPlace>) -> Self {
            self.responses.insert(query.to_string(), places);
            self
        }

        fn delay(mut self, query: &str, millis: u64) -> Self {
            self.delays_ms.insert(query.to_string(), millis);
            self
        }
    }

    #[async_trait]
    impl PlaceSearch for FakeSearch {
        async fn search_nearby(
            &self,
            _center: Coordinates,
            _radius_m: u32,
            _category_tags: &[&str],
        ) -> AppResult<Vec<ProviderPlace>> {
            Ok(Vec::new())
        }

        async fn search_by_text(&self, query: &str) -> AppResult<Vec<ProviderPlace>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(millis) = self.delays_ms.get(query) {
                tokio::time::sleep(Duration::from_millis(*millis)).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(AppError::ProviderError("OVER_QUERY_LIMIT".into()));
            }
            Ok(self.responses.get(query).cloned().unwrap_or_default())
        }
    }

    fn orchestrator(fake: Arc<FakeSearch>) -> DiscoveryOrchestrator {
        let places = PlacesService::from_search(fake, 1000);
        DiscoveryOrchestrator::new(places, vec!["Raleigh NC".into()], 3, &sample_shops())
    }

    fn names(records: &[PlaceRecord]) -> Vec<&str> {
        records.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn builds_query_batteries_per_area() {
        let areas = vec!["Raleigh NC".to_string(), "Durham NC".to_string()];
        let new = new_places_queries(&areas);
        assert_eq!(new.len(), 16);
        assert_eq!(new[0], "coffee shops Raleigh NC");
        assert_eq!(new[1], "coffee shops Durham NC");
        assert!(new.contains(&"ice cream Durham NC".to_string()));

        let best = best_reviewed_queries(&areas);
        assert_eq!(best.len(), 16);
        assert_eq!(best[0], "best coffee shops Raleigh NC");
        assert_eq!(best[1], "top rated coffee shops Durham NC");
        assert_eq!(best[2], "popular cafe Raleigh NC");
    }

    #[tokio::test]
    async fn publishes_unknown_new_places_in_rank_order() {
        let fake = Arc::new(
            FakeSearch::default()
                .respond(
                    "coffee shops Raleigh NC",
                    vec![
                        fixture("a", "Sola Coffee", Some(3), Some(4.9)),
                        fixture("b", "Old Guard Roasters", Some(900), Some(4.7)),
                        fixture("c", "Fresh Grounds", Some(12), None),
                    ],
                )
                .respond(
                    "bakery Raleigh NC",
                    vec![
                        fixture("d", "Downtown CVS Pharmacy", Some(0), None),
                        fixture("e", "Crumb & Co", Some(0), None),
                        fixture("c", "Fresh Grounds (dup)", Some(12), None),
                    ],
                ),
        );
        let discovery = orchestrator(fake.clone());

        let outcome = discovery.discover_new(CENTER).await.unwrap();
        assert_eq!(fake.calls.load(Ordering::SeqCst), 8);
        assert_eq!(outcome.merged, 5);
        assert_eq!(
            names(&outcome.published),
            vec!["Crumb & Co", "Fresh Grounds", "Old Guard Roasters"]
        );
        assert_eq!(discovery.new_feed(), outcome.published);
        assert!(discovery.is_known("FRESH GROUNDS"));
        assert!(!discovery.is_loading());
        assert!(discovery.last_error().is_none());

        let again = discovery.discover_new(CENTER).await.unwrap();
        assert!(again.published.is_empty());
        assert!(discovery.new_feed().is_empty());
    }

    #[tokio::test]
    async fn dismissed_names_never_resurface() {
        let fake = Arc::new(FakeSearch::default().respond(
            "espresso Raleigh NC",
            vec![
                fixture("x", "LUNA ESPRESSO", Some(4), None),
                fixture("y", "Night Owl", Some(4), None),
            ],
        ));
        let discovery = orchestrator(fake);
        let dismissed = fixture("other-id", "Luna Espresso", None, None).to_record();
        discovery.dismiss(&dismissed);

        let outcome = discovery.discover_new(CENTER).await.unwrap();
        assert_eq!(names(&outcome.published), vec!["Night Owl"]);
    }

    #[tokio::test]
    async fn failure_keeps_previous_feed_and_records_error() {
        let fake = Arc::new(FakeSearch::default().respond(
            "cafe Raleigh NC",
            vec![fixture("n", "Neon Cafe", Some(2), None)],
        ));
        let discovery = orchestrator(fake.clone());
        discovery.discover_new(CENTER).await.unwrap();
        assert_eq!(discovery.new_feed().len(), 1);

        fake.fail.store(true, Ordering::SeqCst);
        let err = discovery.discover_new(CENTER).await.unwrap_err();
        assert!(matches!(err, AppError::ProviderError(_)));
        assert_eq!(names(&discovery.new_feed()), vec!["Neon Cafe"]);
        assert!(!discovery.is_loading());
        let message = discovery.last_error().unwrap();
        assert!(message.contains("OVER_QUERY_LIMIT"), "{message}");
    }

    #[tokio::test]
    async fn mark_visited_only_touches_new_feed() {
        let fake = Arc::new(
            FakeSearch::default()
                .respond("donuts Raleigh NC", vec![fixture("d1", "Dough Joy", Some(1), Some(4.8))])
                .respond(
                    "best coffee shops Raleigh NC",
                    vec![fixture("d1", "Dough Joy", Some(1), Some(4.8))],
                ),
        );
        let discovery = orchestrator(fake);
        discovery.discover_new(CENTER).await.unwrap();
        discovery.discover_best_reviewed(CENTER).await.unwrap();

        let visited = discovery.new_feed()[0].clone();
        assert!(discovery.mark_visited(visited.id));
        assert!(!discovery.mark_visited(visited.id));
        assert!(discovery.new_feed().is_empty());
        assert_eq!(discovery.best_reviewed_feed().len(), 1);
        assert!(discovery.is_known("dough joy"));
    }

    #[tokio::test]
    async fn best_reviewed_ignores_known_names() {
        let fake = Arc::new(FakeSearch::default().respond(
            "top rated cafe Raleigh NC",
            vec![
                fixture("s", "Sola Coffee", Some(640), Some(4.7)),
                fixture("q", "Quiet Corner", Some(15), Some(3.1)),
                fixture("h", "Airport Hotel Cafe", Some(2_000), Some(4.9)),
            ],
        ));
        let discovery = orchestrator(fake);
        let outcome = discovery.discover_best_reviewed(CENTER).await.unwrap();
        assert_eq!(names(&outcome.published), vec!["Sola Coffee"]);
        assert!(discovery.new_feed().is_empty());
    }

    #[tokio::test]
    async fn merge_order_follows_submission_not_completion() {
        let fake = Arc::new(
            FakeSearch::default()
                .respond("coffee shops Raleigh NC", vec![fixture("same", "First Wins", Some(5), None)])
                .delay("coffee shops Raleigh NC", 150)
                .respond("cafe Raleigh NC", vec![fixture("same", "Second Loses", Some(5), None)]),
        );
        let discovery = orchestrator(fake);
        let outcome = discovery.discover_new(CENTER).await.unwrap();
        assert_eq!(names(&outcome.published), vec!["First Wins"]);
    }

    #[tokio::test]
    async fn rejects_overlapping_discovery_of_same_mode() {
        let fake = Arc::new(FakeSearch::default().delay("coffee shops Raleigh NC", 200));
        let discovery = orchestrator(fake);

        let (first, second) = tokio::join!(discovery.discover_new(CENTER), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            discovery.discover_new(CENTER).await
        });
        assert!(first.is_ok());
        assert!(matches!(
            second,
            Err(AppError::DiscoveryInFlight(DiscoveryMode::NewPlaces))
        ));
        assert!(!discovery.is_loading());
        assert!(discovery.last_error().is_none());
    }

    #[tokio::test]
    async fn cancelled_discovery_clears_loading() {
        let fake = Arc::new(
            FakeSearch::default()
                .respond("cafe Raleigh NC", vec![fixture("n", "Neon Cafe", Some(2), None)])
                .delay("coffee shops Raleigh NC", 5_000)
                .delay("best coffee shops Raleigh NC", 5_000),
        );
        let discovery = orchestrator(fake);

        let new =
            tokio::time::timeout(Duration::from_millis(100), discovery.discover_new(CENTER)).await;
        assert!(new.is_err());
        assert!(!discovery.is_loading());

        let best = tokio::time::timeout(
            Duration::from_millis(100),
            discovery.discover_best_reviewed(CENTER),
        )
        .await;
        assert!(best.is_err());
        let snapshot = discovery.snapshot();
        assert!(!snapshot.is_loading);
        assert!(snapshot.last_error.is_none());
        assert!(snapshot.new_feed.is_empty());
        assert!(discovery.new_places_flight.try_lock().is_ok());
    }

    #[test]
    fn dismiss_by_unknown_id_is_a_no_op() {
        let discovery = orchestrator(Arc::new(FakeSearch::default()));
        assert!(discovery.dismiss_by_id(Uuid::new_v4()).is_none());
        assert!(!discovery.mark_visited(Uuid::new_v4()));
        assert_eq!(discovery.snapshot().known_shop_count, 13);
    }
}
