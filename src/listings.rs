use crate::geocode::{GeocodeError, Geocoder};
use crate::guard::IntegrityGuard;
use crate::images::{ImageStore, ImageStoreError, Upload};
use crate::models::{
    Category, Geometry, ListingCard, ListingDocument, ListingDraft, ListingFilter, ListingId,
    ListingQuery, ListingSubmission, ListingView, PopulatedListing, PopulatedReview, User, UserId,
};
use crate::store::{DocumentStore, StoreError};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MISSING_IMAGE: &str = "missing image";

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("{0}")]
    Validation(String),
    #[error("listing not found")]
    NotFound,
    #[error(transparent)]
    Geocode(#[from] GeocodeError),
    #[error(transparent)]
    Storage(ImageStoreError),
    #[error("{0}")]
    Persistence(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingErrorKind {
    Validation,
    NotFound,
    Geocode,
    Storage,
    Persistence,
}

impl ListingError {
    pub fn kind(&self) -> ListingErrorKind {
        match self {
            ListingError::Validation(_) => ListingErrorKind::Validation,
            ListingError::NotFound => ListingErrorKind::NotFound,
            ListingError::Geocode(_) => ListingErrorKind::Geocode,
            ListingError::Storage(_) => ListingErrorKind::Storage,
            ListingError::Persistence(_) => ListingErrorKind::Persistence,
        }
    }
}

impl From<ImageStoreError> for ListingError {
    fn from(value: ImageStoreError) -> Self {
        match value {
            ImageStoreError::Validation(message) => ListingError::Validation(message),
            other => ListingError::Storage(other),
        }
    }
}

impl From<StoreError> for ListingError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(_) => ListingError::NotFound,
            StoreError::Validation(message) => ListingError::Validation(message),
            other => ListingError::Persistence(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListingIndex {
    pub listings: Vec<ListingCard>,
    pub category: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EditForm {
    pub listing: ListingView,
    pub original_image_url: String,
    pub categories: Vec<&'static str>,
}

/// Orchestrates geocoding, image storage and persistence for listings.
#[derive(Clone)]
pub struct ListingService {
    store: Arc<dyn DocumentStore>,
    geocoder: Arc<dyn Geocoder>,
    images: Arc<ImageStore>,
    guard: IntegrityGuard,
}

impl ListingService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        geocoder: Arc<dyn Geocoder>,
        images: Arc<ImageStore>,
        guard: IntegrityGuard,
    ) -> Self {
        Self {
            store,
            geocoder,
            images,
            guard,
        }
    }

    /// `category` wins over `country`; blank values count as absent.
    pub async fn list(&self, query: ListingQuery) -> Result<ListingIndex, ListingError> {
        let category = query.category.filter(|value| !value.is_empty());
        let country = query.country.filter(|value| !value.is_empty());
        let filter = match (&category, &country) {
            (Some(category), _) => ListingFilter::Category(category.clone()),
            (None, Some(country)) => ListingFilter::Search(country.clone()),
            (None, None) => ListingFilter::All,
        };
        let listings = self
            .store
            .find_listings(&filter)
            .await?
            .into_iter()
            .map(|doc| self.guard.normalize_card(doc))
            .collect();
        Ok(ListingIndex {
            listings,
            category,
            country,
        })
    }

    pub async fn show(&self, raw_id: &str) -> Result<ListingView, ListingError> {
        let id = parse_id(raw_id)?;
        let listing = self.store.find_listing(id).await?;
        let populated = self.populate(listing).await;
        Ok(self.guard.normalize(populated))
    }

    pub async fn edit_form(&self, raw_id: &str) -> Result<EditForm, ListingError> {
        let listing = self.show(raw_id).await?;
        let original_image_url = thumbnail_url(&listing.image.url);
        Ok(EditForm {
            listing,
            original_image_url,
            categories: Category::ALL.iter().map(Category::as_str).collect(),
        })
    }

    /// Owner of the listing, if it exists and has one.
    pub async fn owner_of(&self, raw_id: &str) -> Result<Option<UserId>, ListingError> {
        let id = parse_id(raw_id)?;
        Ok(self.store.find_listing(id).await?.owner)
    }

    pub async fn create(
        &self,
        actor: &User,
        submission: ListingSubmission,
        upload: Option<Upload>,
    ) -> Result<ListingDocument, ListingError> {
        let Some(upload) = upload else {
            return Err(ListingError::Validation(MISSING_IMAGE.into()));
        };
        ImageStore::check_format(&upload)?;

        let address = submission.location.clone().unwrap_or_default();
        let coordinates = self.geocoder.geocode(&address).await?;
        let image = self.images.store(&upload).await?;

        let draft = ListingDraft {
            submission,
            image: image.clone(),
            geometry: Geometry::point(coordinates.lon, coordinates.lat),
            owner: Some(actor.id),
        };
        match self.store.insert_listing(draft).await {
            Ok(listing) => {
                info!(
                    target = "wanderlust.api",
                    listing = %listing.id,
                    owner = %actor.username,
                    "listing created"
                );
                crate::metrics::inc_operation("listing_created");
                Ok(listing)
            }
            Err(err) => {
                warn!(target = "wanderlust.api", error = %err, "listing insert failed");
                self.images.discard(&image).await;
                Err(err.into())
            }
        }
    }

    /// Partial update. A new upload replaces the image in a second write, so
    /// a storage failure leaves the merged fields in place. Location changes
    /// are not re-geocoded.
    pub async fn update(
        &self,
        raw_id: &str,
        patch: ListingSubmission,
        upload: Option<Upload>,
    ) -> Result<ListingDocument, ListingError> {
        let id = parse_id(raw_id)?;
        if let Some(upload) = &upload {
            ImageStore::check_format(upload)?;
        }
        let mut listing = self.store.update_listing(id, &patch).await?;
        if let Some(upload) = upload {
            let image = self.images.store(&upload).await?;
            listing = match self.store.set_listing_image(id, image.clone()).await {
                Ok(listing) => listing,
                Err(err) => {
                    self.images.discard(&image).await;
                    return Err(err.into());
                }
            };
        }
        info!(target = "wanderlust.api", listing = %id, "listing updated");
        Ok(listing)
    }

    pub async fn delete(&self, raw_id: &str) -> Result<ListingDocument, ListingError> {
        let id = parse_id(raw_id)?;
        let deleted = self.store.delete_listing(id).await?;
        info!(
            target = "wanderlust.api",
            listing = %id,
            reviews = deleted.reviews.len(),
            "listing deleted"
        );
        crate::metrics::inc_operation("listing_deleted");
        Ok(deleted)
    }

    /// Resolves owner and reviews. Lookup failures leave the reference
    /// unresolved for the guard instead of failing the read.
    async fn populate(&self, listing: ListingDocument) -> PopulatedListing {
        let owner = match listing.owner {
            Some(owner) => self.store.find_user(owner).await.unwrap_or_else(|err| {
                warn!(target = "wanderlust.api", error = %err, "owner lookup failed");
                None
            }),
            None => None,
        };

        let reviews = match self.store.find_reviews(&listing.reviews).await {
            Ok(reviews) => {
                let mut populated = Vec::with_capacity(reviews.len());
                for review in reviews {
                    if review.listing != listing.id {
                        debug!(
                            target = "wanderlust.api",
                            listing = %listing.id,
                            review = %review.id,
                            owner = %review.listing,
                            "skipping review linked from another listing"
                        );
                        continue;
                    }
                    let author = match review.author {
                        Some(author) => self.store.find_user(author).await.ok().flatten(),
                        None => None,
                    };
                    populated.push(PopulatedReview { review, author });
                }
                Some(populated)
            }
            Err(err) => {
                warn!(target = "wanderlust.api", error = %err, "review lookup failed");
                None
            }
        };

        PopulatedListing {
            listing,
            owner,
            reviews,
        }
    }
}

/// Unparseable ids can never match a record.
fn parse_id(raw: &str) -> Result<ListingId, ListingError> {
    ListingId::parse(raw).ok_or(ListingError::NotFound)
}

/// Remote delivery URLs accept an inline width transform; local files are
/// served as they are.
fn thumbnail_url(url: &str) -> String {
    if url.starts_with('/') {
        return url.to_string();
    }
    url.replacen("/upload", "/upload/w_250", 1)
}
