use super::{
    DocumentStore, ListingRepository, ReviewRepository, StoreError, UserRepository,
    build_document, build_review,
};
use crate::models::{
    Account, Image, ListingDocument, ListingDraft, ListingFilter, ListingId, ListingSubmission,
    NewReview, Review, ReviewId, User, UserId,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

/// Process-local store used when no Redis is configured. Data is lost on
/// restart. One lock covers all collections, so every operation is atomic.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Collections>>,
}

#[derive(Default)]
struct Collections {
    listings: Vec<ListingDocument>,
    reviews: HashMap<ReviewId, Review>,
    users: HashMap<UserId, User>,
    accounts: HashMap<UserId, Account>,
    sessions: HashMap<String, (UserId, Instant)>,
}

impl Collections {
    fn listing_mut(&mut self, id: ListingId) -> Result<&mut ListingDocument, StoreError> {
        self.listings
            .iter_mut()
            .find(|doc| doc.id == id)
            .ok_or(StoreError::NotFound("listing"))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a document verbatim, bypassing the schema. Used to stage legacy
    /// and dangling records.
    #[cfg(test)]
    pub async fn insert_raw(&self, doc: ListingDocument) {
        self.inner.lock().await.listings.push(doc);
    }

    #[cfg(test)]
    pub async fn insert_raw_review(&self, review: Review) {
        self.inner.lock().await.reviews.insert(review.id, review);
    }
}

#[async_trait]
impl ListingRepository for MemoryStore {
    async fn insert_listing(&self, draft: ListingDraft) -> Result<ListingDocument, StoreError> {
        let doc = build_document(draft)?;
        self.inner.lock().await.listings.push(doc.clone());
        Ok(doc)
    }

    async fn find_listing(&self, id: ListingId) -> Result<ListingDocument, StoreError> {
        let mut guard = self.inner.lock().await;
        guard.listing_mut(id).map(|doc| doc.clone())
    }

    async fn find_listings(
        &self,
        filter: &ListingFilter,
    ) -> Result<Vec<ListingDocument>, StoreError> {
        let guard = self.inner.lock().await;
        Ok(guard
            .listings
            .iter()
            .filter(|doc| filter.matches(doc))
            .cloned()
            .collect())
    }

    async fn update_listing(
        &self,
        id: ListingId,
        patch: &ListingSubmission,
    ) -> Result<ListingDocument, StoreError> {
        let mut guard = self.inner.lock().await;
        let doc = guard.listing_mut(id)?;
        patch.merge_into(doc)?;
        Ok(doc.clone())
    }

    async fn set_listing_image(
        &self,
        id: ListingId,
        image: Image,
    ) -> Result<ListingDocument, StoreError> {
        let mut guard = self.inner.lock().await;
        let doc = guard.listing_mut(id)?;
        doc.image = Some(image);
        Ok(doc.clone())
    }

    async fn delete_listing(&self, id: ListingId) -> Result<ListingDocument, StoreError> {
        let mut guard = self.inner.lock().await;
        let position = guard
            .listings
            .iter()
            .position(|doc| doc.id == id)
            .ok_or(StoreError::NotFound("listing"))?;
        let doc = guard.listings.remove(position);
        guard.reviews.retain(|_, review| review.listing != id);
        Ok(doc)
    }

    async fn count_listings(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().await.listings.len())
    }

    async fn clear_listings(&self) -> Result<(), StoreError> {
        let mut guard = self.inner.lock().await;
        guard.listings.clear();
        guard.reviews.clear();
        Ok(())
    }
}

#[async_trait]
impl ReviewRepository for MemoryStore {
    async fn insert_review(
        &self,
        listing: ListingId,
        review: NewReview,
    ) -> Result<Review, StoreError> {
        let mut guard = self.inner.lock().await;
        let review = build_review(listing, review);
        guard.listing_mut(listing)?.reviews.push(review.id);
        guard.reviews.insert(review.id, review.clone());
        Ok(review)
    }

    async fn find_review(&self, id: ReviewId) -> Result<Review, StoreError> {
        self.inner
            .lock()
            .await
            .reviews
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound("review"))
    }

    async fn find_reviews(&self, ids: &[ReviewId]) -> Result<Vec<Review>, StoreError> {
        let guard = self.inner.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| guard.reviews.get(id).cloned())
            .collect())
    }

    async fn delete_review(&self, listing: ListingId, id: ReviewId) -> Result<Review, StoreError> {
        let mut guard = self.inner.lock().await;
        match guard.reviews.get(&id) {
            Some(review) if review.listing == listing => {}
            _ => return Err(StoreError::NotFound("review")),
        }
        // The owning listing may already be gone; the review is still removed.
        if let Ok(doc) = guard.listing_mut(listing) {
            doc.reviews.retain(|existing| *existing != id);
        }
        guard
            .reviews
            .remove(&id)
            .ok_or(StoreError::NotFound("review"))
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn upsert_user(&self, user: User) -> Result<(), StoreError> {
        self.inner.lock().await.users.insert(user.id, user);
        Ok(())
    }

    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.inner.lock().await.users.get(&id).cloned())
    }

    async fn register_user(&self, user: User, account: Account) -> Result<(), StoreError> {
        let mut guard = self.inner.lock().await;
        if guard.users.contains_key(&user.id) {
            return Err(StoreError::Conflict("user"));
        }
        guard.accounts.insert(user.id, account);
        guard.users.insert(user.id, user);
        Ok(())
    }

    async fn find_account(&self, id: UserId) -> Result<Option<Account>, StoreError> {
        Ok(self.inner.lock().await.accounts.get(&id).cloned())
    }

    async fn insert_session(
        &self,
        key: &str,
        user: UserId,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.lock().await;
        let now = Instant::now();
        guard.sessions.retain(|_, (_, expires)| *expires > now);
        guard.sessions.insert(key.to_string(), (user, now + ttl));
        Ok(())
    }

    async fn find_session(&self, key: &str) -> Result<Option<UserId>, StoreError> {
        let guard = self.inner.lock().await;
        Ok(guard
            .sessions
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(user, _)| *user))
    }

    async fn delete_session(&self, key: &str) -> Result<(), StoreError> {
        self.inner.lock().await.sessions.remove(key);
        Ok(())
    }
}

impl DocumentStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::draft;

    fn new_review(author: UserId) -> NewReview {
        NewReview {
            author,
            rating: 4,
            comment: "Lovely stay".into(),
        }
    }

    #[tokio::test]
    async fn insert_applies_schema() {
        let store = MemoryStore::new();
        let err = store
            .insert_listing(draft("Castle", "Castles", "France", None))
            .await
            .expect_err("invalid category");
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(store.count_listings().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn find_listings_keeps_insertion_order() {
        let store = MemoryStore::new();
        for title in ["One", "Two", "Three"] {
            store
                .insert_listing(draft(title, "Rooms", "India", None))
                .await
                .unwrap();
        }
        let titles: Vec<String> = store
            .find_listings(&ListingFilter::All)
            .await
            .unwrap()
            .into_iter()
            .map(|doc| doc.title)
            .collect();
        assert_eq!(titles, vec!["One", "Two", "Three"]);
    }

    #[tokio::test]
    async fn update_missing_listing_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update_listing(ListingId::new(), &ListingSubmission::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound("listing")));
    }

    #[tokio::test]
    async fn review_delete_unlinks_and_second_attempt_fails() {
        let store = MemoryStore::new();
        let listing = store
            .insert_listing(draft("Cabin", "Mountains", "Nepal", None))
            .await
            .unwrap();
        let review = store
            .insert_review(listing.id, new_review(UserId::new()))
            .await
            .unwrap();
        assert_eq!(
            store.find_listing(listing.id).await.unwrap().reviews,
            vec![review.id]
        );

        store.delete_review(listing.id, review.id).await.unwrap();
        assert!(store.find_listing(listing.id).await.unwrap().reviews.is_empty());

        let err = store.delete_review(listing.id, review.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound("review")));
    }

    #[tokio::test]
    async fn review_delete_rejects_foreign_listing() {
        let store = MemoryStore::new();
        let a = store
            .insert_listing(draft("A", "Farms", "Italy", None))
            .await
            .unwrap();
        let b = store
            .insert_listing(draft("B", "Farms", "Italy", None))
            .await
            .unwrap();
        let review = store
            .insert_review(a.id, new_review(UserId::new()))
            .await
            .unwrap();
        assert!(store.delete_review(b.id, review.id).await.is_err());
        assert_eq!(store.find_listing(a.id).await.unwrap().reviews, vec![review.id]);
    }

    #[tokio::test]
    async fn delete_listing_cascades_reviews() {
        let store = MemoryStore::new();
        let listing = store
            .insert_listing(draft("Dome", "Dome", "Iceland", None))
            .await
            .unwrap();
        let review = store
            .insert_review(listing.id, new_review(UserId::new()))
            .await
            .unwrap();
        store.delete_listing(listing.id).await.unwrap();
        assert!(matches!(
            store.find_review(review.id).await,
            Err(StoreError::NotFound("review"))
        ));
        assert!(store.delete_listing(listing.id).await.is_err());
    }

    #[tokio::test]
    async fn register_rejects_taken_ids() {
        let store = MemoryStore::new();
        let user = User {
            id: UserId::new(),
            username: "dana".into(),
        };
        let account = Account {
            email: "dana@example.com".into(),
            password: crate::models::PasswordHash {
                salt: "00".into(),
                digest: "ff".into(),
            },
        };
        store.register_user(user.clone(), account.clone()).await.unwrap();
        assert_eq!(store.find_account(user.id).await.unwrap(), Some(account.clone()));
        assert!(matches!(
            store.register_user(user, account).await,
            Err(StoreError::Conflict("user"))
        ));
    }

    #[tokio::test]
    async fn sessions_expire_and_can_be_deleted() {
        let store = MemoryStore::new();
        let user = UserId::new();
        store
            .insert_session("live", user, Duration::from_secs(60))
            .await
            .unwrap();
        store
            .insert_session("stale", user, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(store.find_session("live").await.unwrap(), Some(user));
        assert_eq!(store.find_session("stale").await.unwrap(), None);

        store.delete_session("live").await.unwrap();
        assert_eq!(store.find_session("live").await.unwrap(), None);
    }

    #[tokio::test]
    async fn find_reviews_skips_missing_ids() {
        let store = MemoryStore::new();
        let listing = store
            .insert_listing(draft("Boat", "Boats", "Greece", None))
            .await
            .unwrap();
        let review = store
            .insert_review(listing.id, new_review(UserId::new()))
            .await
            .unwrap();
        let found = store
            .find_reviews(&[ReviewId::new(), review.id])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, review.id);
    }
}
