//! Enriches candidate places with ratings and reviews from an external
//! places search service.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde::Deserialize;
use shared::{
    domain::SelectedPlace,
    protocol::{PlaceDetails, PlaceReview},
};
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_SEARCH_RADIUS_M: u32 = 50;
pub const MAX_REVIEWS: usize = 5;
const SEARCH_PATH: &str = "/api/gmap/search";

#[async_trait]
pub trait PlacesLookup: Send + Sync {
    async fn lookup(&self, place: &SelectedPlace) -> Result<PlaceDetails>;
}

/// Searches by name near the place's coordinates.
#[derive(Clone)]
pub struct HttpPlacesClient {
    http: Client,
    search_url: Url,
    radius_m: u32,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    rating: Option<f64>,
    #[serde(default)]
    reviews: Vec<PlaceReview>,
}

impl HttpPlacesClient {
    pub fn new(base_url: &str, radius_m: u32) -> Result<Self> {
        let base = Url::parse(base_url)
            .with_context(|| format!("invalid places service url '{base_url}'"))?;
        let search_url = base
            .join(SEARCH_PATH)
            .with_context(|| format!("cannot build search url from '{base_url}'"))?;
        Ok(Self {
            http: Client::new(),
            search_url,
            radius_m,
        })
    }

    pub fn search_url(&self) -> &Url {
        &self.search_url
    }
}

#[async_trait]
impl PlacesLookup for HttpPlacesClient {
    async fn lookup(&self, place: &SelectedPlace) -> Result<PlaceDetails> {
        let name = place.name.as_deref().unwrap_or("Location");
        let response = self
            .http
            .get(self.search_url.clone())
            .query(&[
                ("name", name.to_string()),
                ("lat", place.lat.to_string()),
                ("lng", place.lon.to_string()),
                ("radius", self.radius_m.to_string()),
            ])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(anyhow!("no match for place '{}'", place.id));
        }

        let found: SearchResponse = response.error_for_status()?.json().await?;
        let mut details = PlaceDetails::minimal(place);
        if let Some(name) = found.name {
            details.name = name;
        }
        details.rating = found.rating;
        details.reviews = found.reviews;
        details.reviews.truncate(MAX_REVIEWS);
        Ok(details)
    }
}

/// Lookup used when no places service is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflinePlaces;

#[async_trait]
impl PlacesLookup for OfflinePlaces {
    async fn lookup(&self, place: &SelectedPlace) -> Result<PlaceDetails> {
        Ok(PlaceDetails::minimal(place))
    }
}

/// Never fails: a lookup error yields the minimal record for the place.
pub async fn enrich_or_minimal(lookup: &dyn PlacesLookup, place: &SelectedPlace) -> PlaceDetails {
    match lookup.lookup(place).await {
        Ok(mut details) => {
            details.reviews.truncate(MAX_REVIEWS);
            debug!(place_id = %place.id, reviews = details.reviews.len(), "place enriched");
            details
        }
        Err(err) => {
            warn!(place_id = %place.id, %err, "place lookup failed, using minimal record");
            PlaceDetails::minimal(place)
        }
    }
}

/// Looks up every place concurrently, preserving input order.
pub async fn enrich_all(lookup: &dyn PlacesLookup, places: &[SelectedPlace]) -> Vec<PlaceDetails> {
    join_all(places.iter().map(|place| enrich_or_minimal(lookup, place))).await
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
