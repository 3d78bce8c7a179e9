use crate::models::{ListingId, NewReview, Review, ReviewForm, ReviewId, User, UserId};
use crate::store::{DocumentStore, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("{0}")]
    Validation(String),
    #[error("listing not found")]
    ListingNotFound,
    #[error("review not found")]
    NotFound,
    #[error("{0}")]
    Persistence(String),
}

#[derive(Clone)]
pub struct ReviewService {
    store: Arc<dyn DocumentStore>,
}

impl ReviewService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn create(
        &self,
        raw_listing: &str,
        author: &User,
        form: ReviewForm,
    ) -> Result<Review, ReviewError> {
        let listing = ListingId::parse(raw_listing).ok_or(ReviewError::ListingNotFound)?;
        let review = validate(form, author)?;
        let review = self
            .store
            .insert_review(listing, review)
            .await
            .map_err(|err| match err {
                StoreError::NotFound(_) => ReviewError::ListingNotFound,
                other => ReviewError::Persistence(other.to_string()),
            })?;
        info!(
            target = "wanderlust.api",
            listing = %listing,
            review = %review.id,
            "review created"
        );
        crate::metrics::inc_operation("review_created");
        Ok(review)
    }

    pub async fn delete(&self, raw_listing: &str, raw_review: &str) -> Result<Review, ReviewError> {
        let (Some(listing), Some(review)) =
            (ListingId::parse(raw_listing), ReviewId::parse(raw_review))
        else {
            return Err(ReviewError::NotFound);
        };
        let deleted = self
            .store
            .delete_review(listing, review)
            .await
            .map_err(|err| match err {
                StoreError::NotFound(_) => ReviewError::NotFound,
                other => ReviewError::Persistence(other.to_string()),
            })?;
        info!(target = "wanderlust.api", listing = %listing, review = %review, "review deleted");
        Ok(deleted)
    }

    /// Author of a review, if the review exists.
    pub async fn author_of(&self, raw_review: &str) -> Result<Option<UserId>, ReviewError> {
        let id = ReviewId::parse(raw_review).ok_or(ReviewError::NotFound)?;
        match self.store.find_review(id).await {
            Ok(review) => Ok(review.author),
            Err(StoreError::NotFound(_)) => Err(ReviewError::NotFound),
            Err(other) => Err(ReviewError::Persistence(other.to_string())),
        }
    }
}

/// Rating is a whole number from 1 to 5; the comment must not be blank.
fn validate(form: ReviewForm, author: &User) -> Result<NewReview, ReviewError> {
    let rating = form
        .rating
        .trim()
        .parse::<u8>()
        .ok()
        .filter(|rating| (1..=5).contains(rating))
        .ok_or_else(|| ReviewError::Validation("\"rating\" must be between 1 and 5".into()))?;
    let comment = form.comment.trim();
    if comment.is_empty() {
        return Err(ReviewError::Validation(
            "\"comment\" is not allowed to be empty".into(),
        ));
    }
    Ok(NewReview {
        author: author.id,
        rating,
        comment: comment.to_string(),
    })
}
