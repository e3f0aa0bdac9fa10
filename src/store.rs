use std::f64::consts::FRAC_PI_2;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::{self, DatabaseContext};
use crate::errors::{sanitize_error_copy, AppError, AppResult};
use crate::model::{Coordinates, PlaceCategory, PlaceRecord, PlaceType, EARTH_RADIUS_M};
use crate::places::{PlacesService, ProviderPlace};

pub const DEFAULT_NEARBY_RADIUS_M: f64 = 5_000.0;
/// One nearby search per entry; coffee first, then bakeries.
pub const POPULATE_CATEGORY_TAGS: [&[&str]; 2] = [&["cafe", "coffee_shop"], &["bakery"]];
const LAST_SYNC_KEY: &str = "last_sync";
/// Widens the SQL pre-filter so float error never cuts off a shop on the rim.
const BOX_PADDING: f64 = 1.001;
/// `BETWEEN 1 AND 0` matches nothing.
const EMPTY_RANGE: (f64, f64) = (1.0, 0.0);

const SHOP_COLUMNS: &str = "id, external_id, name, address, latitude, longitude, rating, \
    review_count, price_level, place_type, phone_number, website, photo_references, \
    created_at, updated_at";
const ORDER_BY_RATING: &str =
    "ORDER BY COALESCE(rating, 0) DESC, COALESCE(review_count, 0) DESC, name ASC";

/// Persisted shop row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShopEntity {
    pub id: Uuid,
    pub external_id: Option<String>,
    pub name: String,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    pub price_level: Option<u8>,
    pub place_type: PlaceType,
    pub phone_number: Option<String>,
    pub website: Option<String>,
    pub photo_references: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ShopEntity {
    /// Stored shops carry no newness badge; the glyph follows the place type.
    pub fn to_record(&self) -> PlaceRecord {
        let category = self.place_type.category();
        PlaceRecord {
            id: self.id,
            external_id: self.external_id.clone(),
            name: self.name.clone(),
            address: self.address.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            category,
            category_emoji: category.emoji().to_string(),
            rating: self.rating,
            review_count: self.review_count,
            newness_badge: None,
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let id: String = row.get(0)?;
        let photos: String = row.get(12)?;
        let place_type: String = row.get(9)?;
        Ok(Self {
            id: Uuid::parse_str(&id)
                .map_err(|err| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err)))?,
            external_id: row.get(1)?,
            name: row.get(2)?,
            address: row.get(3)?,
            latitude: row.get(4)?,
            longitude: row.get(5)?,
            rating: row.get(6)?,
            review_count: row.get(7)?,
            price_level: row.get(8)?,
            place_type: PlaceType::parse(&place_type),
            phone_number: row.get(10)?,
            website: row.get(11)?,
            photo_references: serde_json::from_str(&photos).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(12, Type::Text, Box::new(err))
            })?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PopulateSummary {
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub path: String,
    pub shop_count: usize,
    pub is_loading: bool,
    pub last_error: Option<String>,
    pub last_sync: Option<String>,
}

#[derive(Default)]
struct StoreActivity {
    is_loading: bool,
    last_error: Option<String>,
}

/// Column values for one write, whichever source they came from.
struct ShopWrite<'a> {
    id: Uuid,
    external_id: Option<&'a str>,
    name: &'a str,
    address: String,
    latitude: f64,
    longitude: f64,
    rating: Option<f64>,
    review_count: Option<u32>,
    price_level: Option<u8>,
    place_type: PlaceType,
    phone_number: Option<&'a str>,
    website: Option<&'a str>,
    photo_references: Vec<String>,
}

impl<'a> ShopWrite<'a> {
    fn from_provider(place: &'a ProviderPlace) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_id: Some(&place.place_id),
            name: &place.name,
            address: place.address(),
            latitude: place.geometry.location.lat,
            longitude: place.geometry.location.lng,
            rating: place.rating,
            review_count: place.user_ratings_total,
            price_level: place.price_level,
            place_type: PlaceType::from_types(&place.types),
            phone_number: place.formatted_phone_number.as_deref(),
            website: place.website.as_deref(),
            photo_references: place.photo_references(),
        }
    }

    fn from_record(record: &'a PlaceRecord) -> Self {
        let place_type = match record.category {
            PlaceCategory::Bakery => PlaceType::Bakery,
            _ => PlaceType::CoffeeShop,
        };
        Self {
            id: record.id,
            external_id: record.external_id.as_deref(),
            name: &record.name,
            address: record.address.clone(),
            latitude: record.latitude,
            longitude: record.longitude,
            rating: record.rating,
            review_count: record.review_count,
            price_level: None,
            place_type,
            phone_number: None,
            website: None,
            photo_references: Vec::new(),
        }
    }
}

/// Durable shop storage keyed by provider id, plus the visible collection the
/// UI renders from.
pub struct LocalStore {
    connection: Arc<Mutex<Connection>>,
    path: PathBuf,
    visible: Mutex<Vec<PlaceRecord>>,
    activity: Mutex<StoreActivity>,
    populate_flight: AsyncMutex<()>,
}

impl LocalStore {
    pub fn new(context: DatabaseContext) -> Self {
        Self {
            connection: Arc::new(Mutex::new(context.connection)),
            path: context.path,
            visible: Mutex::new(Vec::new()),
            activity: Mutex::new(StoreActivity::default()),
            populate_flight: AsyncMutex::new(()),
        }
    }

    pub fn open<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        let bootstrap = db::bootstrap(
            data_dir,
            &config.database_file_name,
            config.seed_database_path.as_deref(),
        )?;
        let store = Self::new(bootstrap.context);
        store.fetch_all()?;
        Ok(store)
    }

    pub fn open_in_memory() -> AppResult<Self> {
        Ok(Self::new(db::open_in_memory()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts unseen provider ids and overwrites known ones in a single
    /// transaction. Ids and creation times of existing rows never change.
    pub fn upsert(&self, places: &[ProviderPlace]) -> AppResult<UpsertSummary> {
        let mut connection = self.connection.lock();
        let tx = connection.transaction()?;
        let mut summary = UpsertSummary::default();
        for place in places {
            if write_shop(&tx, &ShopWrite::from_provider(place))? {
                summary.inserted += 1;
            } else {
                summary.updated += 1;
            }
        }
        db::write_meta(&tx, LAST_SYNC_KEY, &db::now_timestamp())?;
        tx.commit()?;
        debug!(
            target: "local_store",
            inserted = summary.inserted,
            updated = summary.updated,
            "upserted provider places"
        );
        Ok(summary)
    }

    /// Bulk import of already-shaped records, keeping their ids. Records with
    /// a provider id merge on it; the rest merge on the local id.
    pub fn import_records(&self, records: &[PlaceRecord]) -> AppResult<UpsertSummary> {
        let mut connection = self.connection.lock();
        let tx = connection.transaction()?;
        let mut summary = UpsertSummary::default();
        for record in records {
            if write_shop(&tx, &ShopWrite::from_record(record))? {
                summary.inserted += 1;
            } else {
                summary.updated += 1;
            }
        }
        tx.commit()?;
        info!(
            target: "local_store",
            inserted = summary.inserted,
            updated = summary.updated,
            "imported records"
        );
        Ok(summary)
    }

    /// Reloads every stored shop, best rated first, and publishes it as the
    /// visible collection.
    pub fn fetch_all(&self) -> AppResult<Vec<PlaceRecord>> {
        let records: Vec<PlaceRecord> = self
            .entities()?
            .iter()
            .map(ShopEntity::to_record)
            .collect();
        *self.visible.lock() = records.clone();
        Ok(records)
    }

    pub fn entities(&self) -> AppResult<Vec<ShopEntity>> {
        let connection = self.connection.lock();
        let sql = format!("SELECT {SHOP_COLUMNS} FROM coffee_shops {ORDER_BY_RATING}");
        let mut stmt = connection.prepare(&sql)?;
        let rows = stmt.query_map([], ShopEntity::from_row)?;
        let mut entities = Vec::new();
        for row in rows {
            entities.push(row?);
        }
        Ok(entities)
    }

    pub fn entity_by_external_id(&self, external_id: &str) -> AppResult<Option<ShopEntity>> {
        let connection = self.connection.lock();
        let sql = format!("SELECT {SHOP_COLUMNS} FROM coffee_shops WHERE external_id = ?1");
        let entity = connection
            .query_row(&sql, [external_id], ShopEntity::from_row)
            .optional()?;
        Ok(entity)
    }

    pub fn visible(&self) -> Vec<PlaceRecord> {
        self.visible.lock().clone()
    }

    pub fn count(&self) -> AppResult<usize> {
        let connection = self.connection.lock();
        let count: i64 =
            connection.query_row("SELECT COUNT(*) FROM coffee_shops", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Deletes every stored shop.
    pub fn clear(&self) -> AppResult<usize> {
        let removed = {
            let connection = self.connection.lock();
            connection.execute("DELETE FROM coffee_shops", [])?
        };
        self.visible.lock().clear();
        info!(target: "local_store", removed, "cleared shop store");
        Ok(removed)
    }

    /// Case-insensitive match on name or address. A blank query returns every shop.
    pub fn search(&self, query: &str) -> AppResult<Vec<PlaceRecord>> {
        let needle = query.trim().to_lowercase();
        let records = self
            .entities()?
            .iter()
            .map(ShopEntity::to_record)
            .filter(|record| {
                needle.is_empty()
                    || record.name.to_lowercase().contains(&needle)
                    || record.address.to_lowercase().contains(&needle)
            })
            .collect();
        Ok(records)
    }

    /// Shops within `radius_m` of `center`, closest first.
    pub fn nearby(&self, center: Coordinates, radius_m: Option<f64>) -> AppResult<Vec<PlaceRecord>> {
        let radius_m = radius_m
            .filter(|radius| radius.is_finite() && *radius > 0.0)
            .unwrap_or(DEFAULT_NEARBY_RADIUS_M);
        let window = SearchWindow::around(center, radius_m);

        let candidates = {
            let connection = self.connection.lock();
            let sql = format!(
                "SELECT {SHOP_COLUMNS} FROM coffee_shops
                 WHERE latitude BETWEEN ?1 AND ?2
                   AND (longitude BETWEEN ?3 AND ?4 OR longitude BETWEEN ?5 AND ?6)"
            );
            let mut stmt = connection.prepare(&sql)?;
            let [(west_a, east_a), (west_b, east_b)] = window.longitudes;
            let rows = stmt.query_map(
                params![
                    window.min_latitude,
                    window.max_latitude,
                    west_a,
                    east_a,
                    west_b,
                    east_b,
                ],
                ShopEntity::from_row,
            )?;
            let mut entities = Vec::new();
            for row in rows {
                entities.push(row?);
            }
            entities
        };

        let mut within: Vec<(f64, PlaceRecord)> = candidates
            .iter()
            .map(ShopEntity::to_record)
            .map(|record| (center.distance_to(&record.coordinates()), record))
            .filter(|(distance, _)| *distance <= radius_m)
            .collect();
        within.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(within.into_iter().map(|(_, record)| record).collect())
    }

    /// Writes a compacted copy of the store to `destination`.
    pub fn export_to(&self, destination: &Path) -> AppResult<()> {
        if destination.exists() {
            return Err(AppError::Path(format!(
                "export destination already exists: {}",
                destination.display()
            )));
        }
        let target = destination
            .to_str()
            .ok_or_else(|| AppError::Path(format!("non UTF-8 path: {}", destination.display())))?;
        let connection = self.connection.lock();
        connection.execute("VACUUM INTO ?1", [target])?;
        info!(target: "local_store", destination = %destination.display(), "exported shop store");
        Ok(())
    }

    /// Pulls nearby coffee shops and bakeries and stores them. Both searches
    /// must succeed before anything is written. Overlapping calls queue.
    pub async fn populate(
        &self,
        places: &PlacesService,
        center: Coordinates,
        radius_m: u32,
    ) -> AppResult<PopulateSummary> {
        let _flight = self.populate_flight.lock().await;
        let _loading = self.begin_loading();

        let result = self.populate_inner(places, center, radius_m).await;
        match &result {
            Ok(summary) => {
                info!(
                    target: "local_store",
                    fetched = summary.fetched,
                    inserted = summary.inserted,
                    updated = summary.updated,
                    total = summary.total,
                    "populated shop store"
                );
            }
            Err(err) => {
                let message = format!("Failed to populate database: {}", err.user_message());
                warn!(
                    target: "local_store",
                    error = %sanitize_error_copy(&err.to_string()),
                    "populate failed; store left unchanged"
                );
                self.activity.lock().last_error = Some(message);
            }
        }
        result
    }

    async fn populate_inner(
        &self,
        places: &PlacesService,
        center: Coordinates,
        radius_m: u32,
    ) -> AppResult<PopulateSummary> {
        let mut combined = Vec::new();
        for tags in POPULATE_CATEGORY_TAGS {
            combined.extend(places.search_nearby(center, radius_m, tags).await?);
        }
        let summary = self.upsert(&combined)?;
        let total = self.fetch_all()?.len();
        Ok(PopulateSummary {
            fetched: combined.len(),
            inserted: summary.inserted,
            updated: summary.updated,
            total,
        })
    }

    pub fn status(&self) -> AppResult<StoreStatus> {
        let last_sync = db::read_meta(&self.connection.lock(), LAST_SYNC_KEY)?;
        let shop_count = self.count()?;
        let activity = self.activity.lock();
        Ok(StoreStatus {
            path: self.path.display().to_string(),
            shop_count,
            is_loading: activity.is_loading,
            last_error: activity.last_error.clone(),
            last_sync,
        })
    }

    fn begin_loading(&self) -> Loading<'_> {
        let mut activity = self.activity.lock();
        activity.is_loading = true;
        activity.last_error = None;
        Loading {
            activity: &self.activity,
        }
    }
}

/// Clears `is_loading` when the populate future finishes or is dropped.
struct Loading<'a> {
    activity: &'a Mutex<StoreActivity>,
}

impl Drop for Loading<'_> {
    fn drop(&mut self) {
        self.activity.lock().is_loading = false;
    }
}

/// Degree ranges enclosing every point within a radius of a center. Longitude
/// is split in two when the circle crosses the antimeridian.
#[derive(Debug, Clone, Copy, PartialEq)]
struct SearchWindow {
    min_latitude: f64,
    max_latitude: f64,
    longitudes: [(f64, f64); 2],
}

impl SearchWindow {
    fn around(center: Coordinates, radius_m: f64) -> Self {
        let angular = radius_m / EARTH_RADIUS_M;
        let lat_delta = angular.to_degrees() * BOX_PADDING;
        let min_latitude = (center.latitude - lat_delta).max(-90.0);
        let max_latitude = (center.latitude + lat_delta).min(90.0);

        // sin(r) / cos(lat) reaches 1 once the circle covers a pole.
        let reach = angular.sin() / center.latitude.to_radians().cos();
        let covers_pole = angular >= FRAC_PI_2 || !(0.0..1.0).contains(&reach);
        let lng_delta = if covers_pole {
            180.0
        } else {
            reach.asin().to_degrees() * BOX_PADDING
        };

        let west = center.longitude - lng_delta;
        let east = center.longitude + lng_delta;
        let longitudes = if lng_delta >= 180.0 {
            [(-180.0, 180.0), EMPTY_RANGE]
        } else if west < -180.0 {
            [(west + 360.0, 180.0), (-180.0, east)]
        } else if east > 180.0 {
            [(west, 180.0), (-180.0, east - 360.0)]
        } else {
            [(west, east), EMPTY_RANGE]
        };

        Self {
            min_latitude,
            max_latitude,
            longitudes,
        }
    }
}

/// Returns `true` when a new row was inserted.
fn write_shop(connection: &Connection, shop: &ShopWrite<'_>) -> AppResult<bool> {
    let existing: Option<String> = match shop.external_id {
        Some(external_id) => connection
            .query_row(
                "SELECT id FROM coffee_shops WHERE external_id = ?1",
                [external_id],
                |row| row.get(0),
            )
            .optional()?,
        None => connection
            .query_row(
                "SELECT id FROM coffee_shops WHERE id = ?1",
                [shop.id.to_string()],
                |row| row.get(0),
            )
            .optional()?,
    };
    let now = db::now_timestamp();
    let photos = serde_json::to_string(&shop.photo_references)?;

    match existing {
        Some(id) => {
            connection.execute(
                "UPDATE coffee_shops
                SET name = ?2,
                    address = ?3,
                    latitude = ?4,
                    longitude = ?5,
                    rating = ?6,
                    review_count = ?7,
                    price_level = ?8,
                    place_type = ?9,
                    phone_number = ?10,
                    website = ?11,
                    photo_references = ?12,
                    updated_at = ?13
                WHERE id = ?1",
                params![
                    id,
                    shop.name,
                    shop.address,
                    shop.latitude,
                    shop.longitude,
                    shop.rating,
                    shop.review_count,
                    shop.price_level,
                    shop.place_type.as_tag(),
                    shop.phone_number,
                    shop.website,
                    photos,
                    now,
                ],
            )?;
            Ok(false)
        }
        None => {
            connection.execute(
                "INSERT INTO coffee_shops (
                    id, external_id, name, address, latitude, longitude, rating,
                    review_count, price_level, place_type, phone_number, website,
                    photo_references, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
                params![
                    shop.id.to_string(),
                    shop.external_id,
                    shop.name,
                    shop.address,
                    shop.latitude,
                    shop.longitude,
                    shop.rating,
                    shop.review_count,
                    shop.price_level,
                    shop.place_type.as_tag(),
                    shop.phone_number,
                    shop.website,
                    photos,
                    now,
                ],
            )?;
            Ok(true)
        }
    }
}
