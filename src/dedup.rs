//! Merging, exclusion and ranking of provider results for the discovery feeds.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::model::{NewnessBadge, PlaceRecord};
use crate::places::ProviderPlace;

/// Names containing any of these are not coffee or dessert venues.
pub const EXCLUDED_TERMS: &[&str] = &[
    "hotel",
    "hospital",
    "bank",
    "gas station",
    "pharmacy",
    "grocery",
    "walmart",
    "target",
    "cvs",
    "walgreens",
    "airport",
    "mall",
];

const NEW_PLACE_REVIEW_CEILING: u32 = 100;
const BEST_REVIEWED_MIN_REVIEWS: u32 = 100;
const BEST_REVIEWED_MIN_RATING: f64 = 4.0;

/// Flattens batches in submission order, keeping the first record seen per place id.
pub fn merge(batches: Vec<Vec<ProviderPlace>>) -> Vec<ProviderPlace> {
    let mut seen = HashSet::new();
    batches
        .into_iter()
        .flatten()
        .filter(|place| seen.insert(place.place_id.clone()))
        .collect()
}

pub fn classify_newness(review_count: Option<u32>) -> Option<NewnessBadge> {
    match review_count.unwrap_or(0) {
        0 => Some(NewnessBadge::New),
        1..=9 => Some(NewnessBadge::BrandNew),
        10..=49 => Some(NewnessBadge::JustOpened),
        50..=99 => Some(NewnessBadge::RecentlyOpened),
        _ => None,
    }
}

pub fn is_likely_new(review_count: Option<u32>) -> bool {
    review_count.unwrap_or(0) < NEW_PLACE_REVIEW_CEILING
}

pub fn is_excluded(name: &str, exclude_terms: &[&str]) -> bool {
    let name = name.to_lowercase();
    exclude_terms
        .iter()
        .any(|term| name.contains(&term.to_lowercase()))
}

pub fn filter_excluded(records: Vec<PlaceRecord>, exclude_terms: &[&str]) -> Vec<PlaceRecord> {
    records
        .into_iter()
        .filter(|record| !is_excluded(&record.name, exclude_terms))
        .collect()
}

/// Classified records first, then fewer reviews first. Stable for equal keys.
pub fn rank_new(mut records: Vec<PlaceRecord>) -> Vec<PlaceRecord> {
    records.sort_by_key(|record| {
        (
            record.newness_badge.is_none(),
            record.review_count.unwrap_or(0),
        )
    });
    records
}

pub fn qualifies_best_reviewed(record: &PlaceRecord) -> bool {
    record.review_count.unwrap_or(0) >= BEST_REVIEWED_MIN_REVIEWS
        || record.rating.unwrap_or(0.0) >= BEST_REVIEWED_MIN_RATING
}

/// Drops records that are neither popular nor well rated, then orders by
/// review count and rating, both descending.
pub fn rank_best_reviewed(records: Vec<PlaceRecord>) -> Vec<PlaceRecord> {
    let mut ranked: Vec<PlaceRecord> = records
        .into_iter()
        .filter(qualifies_best_reviewed)
        .collect();
    ranked.sort_by(|a, b| {
        b.review_count
            .unwrap_or(0)
            .cmp(&a.review_count.unwrap_or(0))
            .then_with(|| compare_rating_desc(a, b))
    });
    ranked
}

pub(crate) fn compare_rating_desc(a: &PlaceRecord, b: &PlaceRecord) -> Ordering {
    b.rating.unwrap_or(0.0).total_cmp(&a.rating.unwrap_or(0.0))
}
