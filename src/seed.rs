use crate::models::{Geometry, Image, ListingDraft, ListingSubmission, UserId};
use crate::store::{DocumentStore, StoreError};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

const SEED_LISTINGS: &str = include_str!("../data/listings.yaml");

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("seed data is malformed: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Deserialize)]
struct SeedListing {
    title: String,
    description: String,
    image: Image,
    price: f64,
    location: String,
    country: String,
    category: String,
    /// `[longitude, latitude]`
    #[serde(default)]
    coordinates: Option<[f64; 2]>,
}

impl SeedListing {
    fn into_draft(self, owner: Option<UserId>) -> ListingDraft {
        let geometry = self
            .coordinates
            .map(|[lon, lat]| Geometry::point(lon, lat))
            .unwrap_or_default();
        ListingDraft {
            submission: ListingSubmission {
                title: Some(self.title),
                description: Some(self.description),
                price: Some(self.price.to_string()),
                location: Some(self.location),
                country: Some(self.country),
                category: Some(self.category),
            },
            image: self.image,
            geometry,
            owner,
        }
    }
}

fn seed_listings() -> Result<Vec<SeedListing>, SeedError> {
    Ok(serde_yaml::from_str(SEED_LISTINGS)?)
}

/// Inserts the sample listings only when the store holds none.
pub async fn seed_if_empty(
    store: &dyn DocumentStore,
    owner: Option<UserId>,
) -> Result<usize, SeedError> {
    if store.count_listings().await? > 0 {
        return Ok(0);
    }
    insert_all(store, owner).await
}

/// Wipes every listing (and its reviews) and inserts the sample set again.
pub async fn reseed(store: &dyn DocumentStore, owner: Option<UserId>) -> Result<usize, SeedError> {
    store.clear_listings().await?;
    insert_all(store, owner).await
}

async fn insert_all(store: &dyn DocumentStore, owner: Option<UserId>) -> Result<usize, SeedError> {
    let listings = seed_listings()?;
    let count = listings.len();
    for listing in listings {
        store.insert_listing(listing.into_draft(owner)).await?;
    }
    info!(target = "wanderlust.seed", count, "sample listings inserted");
    Ok(count)
}
