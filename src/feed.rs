use serde::{Deserialize, Serialize};

use crate::dedup::compare_rating_desc;
use crate::model::{NewnessBadge, PlaceRecord};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewnessFilter {
    #[default]
    All,
    BrandNew,
    JustOpened,
    Recent,
    Unreviewed,
}

impl NewnessFilter {
    fn matches(&self, record: &PlaceRecord) -> bool {
        match self {
            NewnessFilter::All => true,
            NewnessFilter::BrandNew => record.newness_badge == Some(NewnessBadge::BrandNew),
            NewnessFilter::JustOpened => record.newness_badge == Some(NewnessBadge::JustOpened),
            NewnessFilter::Recent => record.newness_badge == Some(NewnessBadge::RecentlyOpened),
            NewnessFilter::Unreviewed => {
                record.newness_badge == Some(NewnessBadge::New)
                    || record.review_count.unwrap_or(0) == 0
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOption {
    #[default]
    Newest,
    Popular,
    TopRated,
    Alphabetical,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedQuery {
    #[serde(default)]
    pub newness: NewnessFilter,
    /// Matched case-insensitively against the address, e.g. "durham".
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub sort: SortOption,
}

impl FeedQuery {
    /// Filters and sorts a copy of `records` for display. The newness filter
    /// is skipped for the best-reviewed feed, which carries no badges of interest.
    pub fn apply(&self, records: &[PlaceRecord], apply_newness: bool) -> Vec<PlaceRecord> {
        let city = self
            .city
            .as_deref()
            .map(str::trim)
            .filter(|city| !city.is_empty())
            .map(str::to_lowercase);

        let mut view: Vec<PlaceRecord> = records
            .iter()
            .filter(|record| !apply_newness || self.newness.matches(record))
            .filter(|record| match &city {
                Some(city) => record.address.to_lowercase().contains(city),
                None => true,
            })
            .cloned()
            .collect();

        match self.sort {
            SortOption::Newest => view.sort_by(|a, b| {
                badge_priority(b)
                    .cmp(&badge_priority(a))
                    .then_with(|| a.review_count.unwrap_or(0).cmp(&b.review_count.unwrap_or(0)))
            }),
            SortOption::Popular => {
                view.sort_by(|a, b| b.review_count.unwrap_or(0).cmp(&a.review_count.unwrap_or(0)))
            }
            SortOption::TopRated => view.sort_by(|a, b| {
                compare_rating_desc(a, b)
                    .then_with(|| b.review_count.unwrap_or(0).cmp(&a.review_count.unwrap_or(0)))
            }),
            SortOption::Alphabetical => view.sort_by_cached_key(|record| record.name.to_lowercase()),
        }
        view
    }
}

fn badge_priority(record: &PlaceRecord) -> u8 {
    record
        .newness_badge
        .map(|badge| badge.priority())
        .unwrap_or(0)
}
