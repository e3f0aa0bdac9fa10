use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::ACCEPT;
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::{AppConfig, MAX_NEARBY_RESULTS, MIN_PAGE_DELAY_MS};
use crate::dedup::classify_newness;
use crate::errors::{http_status_copy, AppError, AppResult};
use crate::model::{Coordinates, PlaceCategory, PlaceRecord};

const MIN_INTERVAL_MS: u64 = 50;

/// Envelope returned by both the nearby and text search endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct PlacesResponse {
    pub status: String,
    #[serde(default)]
    pub results: Vec<ProviderPlace>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderPlace {
    pub place_id: String,
    pub name: String,
    pub geometry: Geometry,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub formatted_address: Option<String>,
    #[serde(default)]
    pub vicinity: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub user_ratings_total: Option<u32>,
    #[serde(default)]
    pub price_level: Option<u8>,
    #[serde(default)]
    pub photos: Vec<Photo>,
    #[serde(default)]
    pub formatted_phone_number: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub location: LatLng,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub photo_reference: String,
}

impl ProviderPlace {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.geometry.location.lat, self.geometry.location.lng)
    }

    pub fn address(&self) -> String {
        self.formatted_address
            .clone()
            .or_else(|| self.vicinity.clone())
            .unwrap_or_default()
    }

    pub fn photo_references(&self) -> Vec<String> {
        self.photos
            .iter()
            .map(|photo| photo.photo_reference.clone())
            .collect()
    }

    pub fn to_record(&self) -> PlaceRecord {
        let category = PlaceCategory::from_types(&self.types);
        PlaceRecord {
            id: Uuid::new_v4(),
            external_id: Some(self.place_id.clone()),
            name: self.name.clone(),
            address: self.address(),
            latitude: self.geometry.location.lat,
            longitude: self.geometry.location.lng,
            category,
            category_emoji: category.emoji().to_string(),
            rating: self.rating,
            review_count: self.user_ratings_total,
            newness_badge: classify_newness(self.user_ratings_total),
        }
    }
}

#[async_trait]
pub trait PlaceSearch: Send + Sync {
    async fn search_nearby(
        &self,
        center: Coordinates,
        radius_m: u32,
        category_tags: &[&str],
    ) -> AppResult<Vec<ProviderPlace>>;

    async fn search_by_text(&self, query: &str) -> AppResult<Vec<ProviderPlace>>;
}

#[derive(Debug, Clone)]
pub struct PlacesEndpoints {
    pub nearby: String,
    pub text: String,
}

impl PlacesEndpoints {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            nearby: config.places_nearby_endpoint.clone(),
            text: config.places_text_endpoint.clone(),
        }
    }
}

/// Shared credential cell; a key saved at runtime reaches clients built earlier.
#[derive(Clone, Default)]
pub struct ApiKeySlot(Arc<RwLock<Option<SecretString>>>);

impl ApiKeySlot {
    pub fn new(key: Option<SecretString>) -> Self {
        Self(Arc::new(RwLock::new(key)))
    }

    pub fn set(&self, key: Option<SecretString>) {
        *self.0.write() = key;
    }

    pub fn get(&self) -> Option<SecretString> {
        self.0.read().clone()
    }

    pub fn is_set(&self) -> bool {
        self.0.read().is_some()
    }
}

pub struct GooglePlacesClient {
    http: Client,
    api_key: ApiKeySlot,
    endpoints: PlacesEndpoints,
    page_delay: Duration,
    max_nearby_results: usize,
}

impl GooglePlacesClient {
    pub fn new(api_key: ApiKeySlot, endpoints: PlacesEndpoints) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("brewcrew/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            api_key,
            endpoints,
            page_delay: Duration::from_millis(MIN_PAGE_DELAY_MS),
            max_nearby_results: MAX_NEARBY_RESULTS,
        })
    }

    pub fn from_config(config: &AppConfig, api_key: ApiKeySlot) -> AppResult<Self> {
        Ok(Self::new(api_key, PlacesEndpoints::from_config(config))?
            .with_page_delay(Duration::from_millis(config.places_page_delay_ms))
            .with_max_nearby_results(config.places_max_nearby_results))
    }

    /// The provider rejects page tokens used sooner than two seconds after issue.
    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay.max(Duration::from_millis(MIN_PAGE_DELAY_MS));
        self
    }

    /// Lowers the nearby cap; it cannot be raised past [`MAX_NEARBY_RESULTS`].
    pub fn with_max_nearby_results(mut self, max: usize) -> Self {
        self.max_nearby_results = max.clamp(1, MAX_NEARBY_RESULTS);
        self
    }

    fn api_key(&self) -> AppResult<SecretString> {
        self.api_key.get().ok_or(AppError::MissingCredential)
    }

    fn endpoint(&self, raw: &str) -> AppResult<Url> {
        Url::parse(raw)
            .map_err(|err| AppError::Config(format!("invalid places endpoint {raw}: {err}")))
    }

    async fn fetch_page(&self, url: Url) -> AppResult<PlacesResponse> {
        let response = self
            .http
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::InvalidResponse(http_status_copy(status.as_u16())));
        }

        let body = response.bytes().await?;
        let parsed: PlacesResponse = serde_json::from_slice(&body)
            .map_err(|err| AppError::InvalidResponse(format!("malformed body: {err}")))?;

        match parsed.status.as_str() {
            "OK" | "ZERO_RESULTS" => Ok(parsed),
            other => {
                debug!(
                    target: "places",
                    status = other,
                    message = parsed.error_message.as_deref().unwrap_or_default(),
                    "provider rejected request"
                );
                Err(AppError::ProviderError(other.to_string()))
            }
        }
    }
}

#[async_trait]
impl PlaceSearch for GooglePlacesClient {
    async fn search_nearby(
        &self,
        center: Coordinates,
        radius_m: u32,
        category_tags: &[&str],
    ) -> AppResult<Vec<ProviderPlace>> {
        let api_key = self.api_key()?;
        let type_filter = category_tags.join("|");
        let mut results = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0_u32;

        loop {
            let mut url = self.endpoint(&self.endpoints.nearby)?;
            {
                let mut query = url.query_pairs_mut();
                query
                    .append_pair("location", &center.as_query_value())
                    .append_pair("radius", &radius_m.to_string())
                    .append_pair("type", &type_filter)
                    .append_pair("key", api_key.expose_secret());
                if let Some(token) = &page_token {
                    query.append_pair("pagetoken", token);
                }
            }
            if page_token.is_some() {
                sleep(self.page_delay).await;
            }

            let page = self.fetch_page(url).await?;
            pages += 1;
            results.extend(page.results);
            trace!(target: "places", pages, total = results.len(), "nearby page received");

            page_token = page.next_page_token.filter(|token| !token.is_empty());
            if page_token.is_none() || results.len() >= self.max_nearby_results {
                break;
            }
        }

        results.truncate(self.max_nearby_results);
        debug!(
            target: "places",
            types = %type_filter,
            radius_m,
            pages,
            results = results.len(),
            "nearby search complete"
        );
        Ok(results)
    }

    async fn search_by_text(&self, query: &str) -> AppResult<Vec<ProviderPlace>> {
        let api_key = self.api_key()?;
        let mut url = self.endpoint(&self.endpoints.text)?;
        url.query_pairs_mut()
            .append_pair("query", query)
            .append_pair("key", api_key.expose_secret());

        let page = self.fetch_page(url).await?;
        trace!(target: "places", query, results = page.results.len(), "text search complete");
        Ok(page.results)
    }
}

/// Shared handle over a [`PlaceSearch`] backend; text queries are throttled.
#[derive(Clone)]
pub struct PlacesService {
    inner: Arc<dyn PlaceSearch>,
    rate_limiter: Arc<RateLimiter>,
}

impl PlacesService {
    pub fn new(config: &AppConfig, api_key: ApiKeySlot) -> AppResult<Self> {
        let client = GooglePlacesClient::from_config(config, api_key)?;
        Ok(Self::from_search(
            Arc::new(client),
            config.places_rate_limit_qps,
        ))
    }

    pub fn from_search(inner: Arc<dyn PlaceSearch>, qps: u32) -> Self {
        Self {
            inner,
            rate_limiter: Arc::new(RateLimiter::new(qps)),
        }
    }

    pub fn set_rate_limit(&self, qps: u32) {
        self.rate_limiter.set_qps(qps);
    }

    pub fn rate_limit_qps(&self) -> u32 {
        self.rate_limiter.qps()
    }

    pub async fn search_nearby(
        &self,
        center: Coordinates,
        radius_m: u32,
        category_tags: &[&str],
    ) -> AppResult<Vec<ProviderPlace>> {
        self.inner
            .search_nearby(center, radius_m, category_tags)
            .await
    }

    pub async fn search_by_text(&self, query: &str) -> AppResult<Vec<ProviderPlace>> {
        self.rate_limiter.wait().await;
        self.inner.search_by_text(query).await
    }
}

pub struct RateLimiter {
    min_interval_ms: AtomicU64,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(qps: u32) -> Self {
        Self {
            min_interval_ms: AtomicU64::new(Self::interval_ms(qps)),
            last_tick: AsyncMutex::new(None),
        }
    }

    pub fn set_qps(&self, qps: u32) {
        self.min_interval_ms
            .store(Self::interval_ms(qps), Ordering::SeqCst);
    }

    pub fn qps(&self) -> u32 {
        let interval = self.min_interval_ms.load(Ordering::SeqCst).max(1);
        let qps = (1000_f64 / interval as f64).round() as u32;
        qps.max(1)
    }

    fn interval_ms(qps: u32) -> u64 {
        let safe_qps = qps.max(1);
        let interval_ms = (1000_f64 / safe_qps as f64).ceil() as u64;
        interval_ms.max(MIN_INTERVAL_MS)
    }

    pub async fn wait(&self) {
        let interval = Duration::from_millis(self.min_interval_ms.load(Ordering::SeqCst));
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

#[cfg(test)]
pub(crate) fn fixture(place_id: &str, name: &str, reviews: Option<u32>, rating: Option<f64>) -> ProviderPlace {
    ProviderPlace {
        place_id: place_id.to_string(),
        name: name.to_string(),
        geometry: Geometry {
            location: LatLng {
                lat: 35.78,
                lng: -78.64,
            },
        },
        types: vec!["cafe".into()],
        formatted_address: Some(format!("{name}, Raleigh, NC")),
        vicinity: None,
        rating,
        user_ratings_total: reviews,
        price_level: None,
        photos: Vec::new(),
        formatted_phone_number: None,
        website: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewnessBadge;

    #[test]
    fn decodes_sparse_provider_payload() {
        let payload = serde_json::json!({
            "status": "OK",
            "results": [{
                "place_id": "abc",
                "name": "Sola Coffee",
                "geometry": { "location": { "lat": 35.7796, "lng": -78.6382 } },
                "vicinity": "119 E Hargett St",
                "photos": [{ "photo_reference": "ref-1", "width": 400 }]
            }]
        });
        let parsed: PlacesResponse = serde_json::from_value(payload).unwrap();
        assert!(parsed.next_page_token.is_none());
        let place = &parsed.results[0];
        assert!(place.types.is_empty());
        assert_eq!(place.address(), "119 E Hargett St");
        assert_eq!(place.photo_references(), vec!["ref-1".to_string()]);
        assert_eq!(place.user_ratings_total, None);
    }

    #[test]
    fn converts_to_record_with_badge_and_emoji() {
        let mut place = fixture("p1", "Crumb Bakery", Some(12), Some(4.6));
        place.types = vec!["bakery".into(), "cafe".into()];
        let record = place.to_record();
        assert_eq!(record.external_id.as_deref(), Some("p1"));
        assert_eq!(record.category_emoji, "🥐");
        assert_eq!(record.newness_badge, Some(NewnessBadge::JustOpened));

        let unknown = fixture("p2", "Quiet Spot", None, None).to_record();
        assert_eq!(unknown.newness_badge, Some(NewnessBadge::New));
        assert_ne!(record.id, unknown.id);
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let endpoints = PlacesEndpoints {
            nearby: "http://127.0.0.1:9/nearby".into(),
            text: "http://127.0.0.1:9/text".into(),
        };
        let client = GooglePlacesClient::new(ApiKeySlot::default(), endpoints).unwrap();
        let nearby = client
            .search_nearby(Coordinates::new(35.0, -78.0), 1000, &["cafe"])
            .await;
        assert!(matches!(nearby, Err(AppError::MissingCredential)));
        let text = client.search_by_text("cafe Raleigh NC").await;
        assert!(matches!(text, Err(AppError::MissingCredential)));
    }

    #[test]
    fn page_delay_never_drops_below_minimum() {
        let endpoints = PlacesEndpoints {
            nearby: "http://localhost/nearby".into(),
            text: "http://localhost/text".into(),
        };
        let client = GooglePlacesClient::new(ApiKeySlot::default(), endpoints)
            .unwrap()
            .with_page_delay(Duration::from_millis(10));
        assert_eq!(client.page_delay, Duration::from_millis(MIN_PAGE_DELAY_MS));
    }

    #[test]
    fn nearby_cap_stays_within_provider_limit() {
        let endpoints = PlacesEndpoints {
            nearby: "http://localhost/nearby".into(),
            text: "http://localhost/text".into(),
        };
        let client = GooglePlacesClient::new(ApiKeySlot::default(), endpoints).unwrap();
        assert_eq!(client.max_nearby_results, MAX_NEARBY_RESULTS);

        let raised = client.with_max_nearby_results(500);
        assert_eq!(raised.max_nearby_results, 100);
        let zeroed = raised.with_max_nearby_results(0);
        assert_eq!(zeroed.max_nearby_results, 1);

        let mut config = AppConfig::for_tests();
        config.places_max_nearby_results = 250;
        let from_config = GooglePlacesClient::from_config(&config, ApiKeySlot::default()).unwrap();
        assert_eq!(from_config.max_nearby_results, 100);
    }

    #[tokio::test]
    async fn rate_limiter_spaces_calls() {
        let limiter = RateLimiter::new(10);
        assert_eq!(limiter.qps(), 10);
        let started = Instant::now();
        for _ in 0..3 {
            limiter.wait().await;
        }
        assert!(started.elapsed() >= Duration::from_millis(200));

        limiter.set_qps(1000);
        assert_eq!(limiter.qps(), 20);
    }
}
