mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::models::{
    Account, ListingDocument, ListingDraft, ListingFilter, ListingId, ListingSubmission, NewReview,
    Review, ReviewId, SchemaViolation, User, UserId,
};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Validation(String),
    #[error("{0} already exists")]
    Conflict(&'static str),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("corrupt document: {0}")]
    Serialization(String),
}

impl From<SchemaViolation> for StoreError {
    fn from(value: SchemaViolation) -> Self {
        Self::Validation(value.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

#[async_trait]
pub trait ListingRepository: Send + Sync {
    /// Applies the listing schema and stores the result under a fresh id.
    async fn insert_listing(&self, draft: ListingDraft) -> Result<ListingDocument, StoreError>;

    async fn find_listing(&self, id: ListingId) -> Result<ListingDocument, StoreError>;

    /// Listings in insertion order.
    async fn find_listings(&self, filter: &ListingFilter)
    -> Result<Vec<ListingDocument>, StoreError>;

    /// Merges the present submission fields onto the stored listing.
    async fn update_listing(
        &self,
        id: ListingId,
        patch: &ListingSubmission,
    ) -> Result<ListingDocument, StoreError>;

    async fn set_listing_image(
        &self,
        id: ListingId,
        image: crate::models::Image,
    ) -> Result<ListingDocument, StoreError>;

    /// Removes the listing together with every review that belongs to it.
    async fn delete_listing(&self, id: ListingId) -> Result<ListingDocument, StoreError>;

    async fn count_listings(&self) -> Result<usize, StoreError>;

    /// Drops all listings and their reviews.
    async fn clear_listings(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ReviewRepository: Send + Sync {
    /// Stores the review and appends its id to the listing in one step.
    async fn insert_review(
        &self,
        listing: ListingId,
        review: NewReview,
    ) -> Result<Review, StoreError>;

    async fn find_review(&self, id: ReviewId) -> Result<Review, StoreError>;

    /// Resolves ids in order, skipping ids with no stored review.
    async fn find_reviews(&self, ids: &[ReviewId]) -> Result<Vec<Review>, StoreError>;

    /// Deletes the review and unlinks it from `listing` atomically. Fails with
    /// `NotFound` if the review is absent or belongs to another listing.
    async fn delete_review(&self, listing: ListingId, id: ReviewId) -> Result<Review, StoreError>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn upsert_user(&self, user: User) -> Result<(), StoreError>;

    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError>;

    /// Stores a new user with its account. Fails with `Conflict` when the id
    /// is already taken, by a registered or a configured user.
    async fn register_user(&self, user: User, account: Account) -> Result<(), StoreError>;

    async fn find_account(&self, id: UserId) -> Result<Option<Account>, StoreError>;

    /// `key` is a digest of the session token, never the token itself.
    async fn insert_session(&self, key: &str, user: UserId, ttl: Duration)
    -> Result<(), StoreError>;

    /// Unknown and expired sessions both yield `None`.
    async fn find_session(&self, key: &str) -> Result<Option<UserId>, StoreError>;

    async fn delete_session(&self, key: &str) -> Result<(), StoreError>;
}

/// The three collections behind one backend.
pub trait DocumentStore: ListingRepository + ReviewRepository + UserRepository {
    fn backend(&self) -> &'static str;
}

fn build_document(draft: ListingDraft) -> Result<ListingDocument, StoreError> {
    let fields = draft.submission.validate()?;
    Ok(ListingDocument {
        id: ListingId::new(),
        title: fields.title,
        description: fields.description,
        image: Some(draft.image),
        price: fields.price,
        location: fields.location,
        country: fields.country,
        geometry: Some(draft.geometry),
        category: fields.category,
        owner: draft.owner,
        reviews: Vec::new(),
    })
}

fn build_review(listing: ListingId, review: NewReview) -> Review {
    Review {
        id: ReviewId::new(),
        listing,
        author: Some(review.author),
        rating: review.rating,
        comment: review.comment,
        created_at: chrono::Utc::now(),
    }
}
