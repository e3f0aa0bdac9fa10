use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance in meters (haversine).
    pub fn distance_to(&self, other: &Coordinates) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lng = (other.longitude - self.longitude).to_radians();
        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().asin()
    }

    pub fn as_query_value(&self) -> String {
        format!("{},{}", self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NewnessBadge {
    New,
    BrandNew,
    JustOpened,
    RecentlyOpened,
}

impl NewnessBadge {
    pub fn as_str(&self) -> &'static str {
        match self {
            NewnessBadge::New => "NEW",
            NewnessBadge::BrandNew => "BRAND_NEW",
            NewnessBadge::JustOpened => "JUST_OPENED",
            NewnessBadge::RecentlyOpened => "RECENTLY_OPENED",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            NewnessBadge::New => "NEW!",
            NewnessBadge::BrandNew => "BRAND NEW",
            NewnessBadge::JustOpened => "JUST OPENED",
            NewnessBadge::RecentlyOpened => "RECENTLY OPENED",
        }
    }

    /// Higher is newer.
    pub fn priority(&self) -> u8 {
        match self {
            NewnessBadge::New => 4,
            NewnessBadge::BrandNew => 3,
            NewnessBadge::JustOpened => 2,
            NewnessBadge::RecentlyOpened => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceCategory {
    Coffee,
    Bakery,
    Food,
    Shop,
    Unknown,
}

impl PlaceCategory {
    /// First provider tag with a known category wins.
    pub fn from_types<S: AsRef<str>>(types: &[S]) -> Self {
        types
            .iter()
            .find_map(|tag| Self::from_tag(tag.as_ref()))
            .unwrap_or(PlaceCategory::Unknown)
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "cafe" | "coffee_shop" => Some(PlaceCategory::Coffee),
            "bakery" => Some(PlaceCategory::Bakery),
            "meal_takeaway" | "restaurant" => Some(PlaceCategory::Food),
            "store" => Some(PlaceCategory::Shop),
            _ => None,
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            PlaceCategory::Coffee | PlaceCategory::Unknown => "☕",
            PlaceCategory::Bakery => "🥐",
            PlaceCategory::Food => "🍽️",
            PlaceCategory::Shop => "🏪",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceType {
    CoffeeShop,
    Bakery,
}

impl PlaceType {
    pub fn as_tag(&self) -> &'static str {
        match self {
            PlaceType::CoffeeShop => "coffee_shop",
            PlaceType::Bakery => "bakery",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "bakery" => PlaceType::Bakery,
            _ => PlaceType::CoffeeShop,
        }
    }

    pub fn from_types<S: AsRef<str>>(types: &[S]) -> Self {
        if types.iter().any(|tag| tag.as_ref() == "bakery") {
            PlaceType::Bakery
        } else {
            PlaceType::CoffeeShop
        }
    }

    pub fn category(&self) -> PlaceCategory {
        match self {
            PlaceType::CoffeeShop => PlaceCategory::Coffee,
            PlaceType::Bakery => PlaceCategory::Bakery,
        }
    }
}

/// A venue as shown to the user, either from a discovery feed or the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceRecord {
    pub id: Uuid,
    pub external_id: Option<String>,
    pub name: String,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    pub category: PlaceCategory,
    pub category_emoji: String,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    pub newness_badge: Option<NewnessBadge>,
}

impl PlaceRecord {
    /// Hand-seeded record without provider data.
    pub fn sample(name: &str, category: PlaceCategory, latitude: f64, longitude: f64, address: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_id: None,
            name: name.to_string(),
            address: address.to_string(),
            latitude,
            longitude,
            category,
            category_emoji: category.emoji().to_string(),
            rating: None,
            review_count: None,
            newness_badge: None,
        }
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }

    pub fn name_key(&self) -> String {
        self.name.to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_known_tag_picks_category() {
        let types = ["point_of_interest", "bakery", "cafe"];
        assert_eq!(PlaceCategory::from_types(&types), PlaceCategory::Bakery);
        assert_eq!(PlaceCategory::from_types(&["Coffee_Shop"]), PlaceCategory::Coffee);
        assert_eq!(PlaceCategory::from_types(&["meal_takeaway"]).emoji(), "🍽️");
    }

    #[test]
    fn unmatched_tags_fall_back_to_unknown() {
        let category = PlaceCategory::from_types(&["establishment", "food"]);
        assert_eq!(category, PlaceCategory::Unknown);
        assert_eq!(category.emoji(), "☕");
        assert_eq!(PlaceCategory::from_types::<&str>(&[]), PlaceCategory::Unknown);
    }

    #[test]
    fn place_type_prefers_bakery_tag() {
        assert_eq!(PlaceType::from_types(&["cafe", "bakery"]), PlaceType::Bakery);
        assert_eq!(PlaceType::from_types(&["cafe"]), PlaceType::CoffeeShop);
        assert_eq!(PlaceType::parse("bakery").as_tag(), "bakery");
        assert_eq!(PlaceType::parse("anything"), PlaceType::CoffeeShop);
    }

    #[test]
    fn measures_distance_between_downtowns() {
        let raleigh = Coordinates::new(35.7796, -78.6382);
        let durham = Coordinates::new(35.9940, -78.8986);
        let meters = raleigh.distance_to(&durham);
        assert!((33_000.0..35_000.0).contains(&meters), "got {meters}");
        assert_eq!(raleigh.distance_to(&raleigh), 0.0);
    }

    #[test]
    fn badge_serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&NewnessBadge::BrandNew).unwrap();
        assert_eq!(json, "\"BRAND_NEW\"");
        assert_eq!(NewnessBadge::RecentlyOpened.as_str(), "RECENTLY_OPENED");
    }
}
