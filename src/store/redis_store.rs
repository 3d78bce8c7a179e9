use super::{
    DocumentStore, ListingRepository, ReviewRepository, StoreError, UserRepository,
    build_document, build_review,
};
use crate::models::{
    Account, Image, ListingDocument, ListingDraft, ListingFilter, ListingId, ListingSubmission,
    NewReview, Review, ReviewId, User, UserId,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::{AsyncCommands, Script, aio::MultiplexedConnection};
use std::time::Duration;
use tracing::info;

/// HSET only when the field is still present. KEYS: listings. ARGV: id, json.
static SAVE_EXISTING: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then return 0 end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return 1
",
    )
});

/// KEYS: listings, reviews, listing review list. ARGV: listing id, review id, json.
static LINK_REVIEW: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then return 0 end
redis.call('HSET', KEYS[2], ARGV[2], ARGV[3])
redis.call('RPUSH', KEYS[3], ARGV[2])
return 1
",
    )
});

/// KEYS: listings, order, listing review list, reviews. ARGV: listing id.
/// Returns the stored document and its review ids, or nil.
static DELETE_CASCADE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local doc = redis.call('HGET', KEYS[1], ARGV[1])
if not doc then return false end
local reviews = redis.call('LRANGE', KEYS[3], 0, -1)
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('LREM', KEYS[2], 0, ARGV[1])
redis.call('DEL', KEYS[3])
for _, review in ipairs(reviews) do redis.call('HDEL', KEYS[4], review) end
return {doc, reviews}
",
    )
});

/// KEYS: users, accounts. ARGV: user id, user json, account json.
static REGISTER: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then return 0 end
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
return 1
",
    )
});

/// Listings, reviews and users as JSON documents in Redis hashes.
///
/// Layout under `prefix`:
/// - `{prefix}:listings` hash of listing id → document (without review ids)
/// - `{prefix}:listings:order` list of listing ids in insertion order
/// - `{prefix}:listing:{id}:reviews` list of review ids for one listing
/// - `{prefix}:reviews` hash of review id → review
/// - `{prefix}:users` hash of user id → user
///
/// - `{prefix}:accounts` hash of user id → sign-in record
/// - `{prefix}:session:{digest}` user id, expiring with the session
///
/// Multi-key writes go through `MULTI`/`EXEC` pipelines. Writes that depend
/// on a record still existing run as Lua scripts, so a concurrent delete can
/// never be undone by a late save.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    prefix: String,
}

impl From<redis::RedisError> for StoreError {
    fn from(value: redis::RedisError) -> Self {
        Self::Backend(value.to_string())
    }
}

impl RedisStore {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(target = "wanderlust.store", prefix, "connected to redis");
        Ok(Self {
            conn,
            prefix: prefix.trim_end_matches(':').to_string(),
        })
    }

    fn listings_key(&self) -> String {
        format!("{}:listings", self.prefix)
    }

    fn order_key(&self) -> String {
        format!("{}:listings:order", self.prefix)
    }

    fn listing_reviews_key(&self, id: ListingId) -> String {
        format!("{}:listing:{}:reviews", self.prefix, id)
    }

    fn reviews_key(&self) -> String {
        format!("{}:reviews", self.prefix)
    }

    fn users_key(&self) -> String {
        format!("{}:users", self.prefix)
    }

    fn accounts_key(&self) -> String {
        format!("{}:accounts", self.prefix)
    }

    fn session_key(&self, key: &str) -> String {
        format!("{}:session:{}", self.prefix, key)
    }

    async fn load_review_ids(&self, id: ListingId) -> Result<Vec<ReviewId>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(self.listing_reviews_key(id), 0, -1).await?;
        Ok(raw.iter().filter_map(|value| ReviewId::parse(value)).collect())
    }

    async fn load_listing(&self, id: ListingId) -> Result<ListingDocument, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(self.listings_key(), id.to_string()).await?;
        let raw = raw.ok_or(StoreError::NotFound("listing"))?;
        let mut doc: ListingDocument = serde_json::from_str(&raw)?;
        doc.reviews = self.load_review_ids(id).await?;
        Ok(doc)
    }

    /// Review ids live in their own list, so they are stripped before saving.
    /// A listing deleted since it was loaded stays deleted.
    async fn save_listing(&self, doc: &ListingDocument) -> Result<(), StoreError> {
        let mut stored = doc.clone();
        stored.reviews.clear();
        let json = serde_json::to_string(&stored)?;
        let mut conn = self.conn.clone();
        let saved: i32 = SAVE_EXISTING
            .key(self.listings_key())
            .arg(doc.id.to_string())
            .arg(json)
            .invoke_async(&mut conn)
            .await?;
        if saved == 0 {
            return Err(StoreError::NotFound("listing"));
        }
        Ok(())
    }
}

#[async_trait]
impl ListingRepository for RedisStore {
    async fn insert_listing(&self, draft: ListingDraft) -> Result<ListingDocument, StoreError> {
        let doc = build_document(draft)?;
        let json = serde_json::to_string(&doc)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset(self.listings_key(), doc.id.to_string(), json)
            .ignore()
            .rpush(self.order_key(), doc.id.to_string())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(doc)
    }

    async fn find_listing(&self, id: ListingId) -> Result<ListingDocument, StoreError> {
        self.load_listing(id).await
    }

    async fn find_listings(
        &self,
        filter: &ListingFilter,
    ) -> Result<Vec<ListingDocument>, StoreError> {
        let mut conn = self.conn.clone();
        let order: Vec<String> = conn.lrange(self.order_key(), 0, -1).await?;
        if order.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.listings_key())
            .arg(&order)
            .query_async(&mut conn)
            .await?;
        let mut docs = Vec::new();
        for json in raw.into_iter().flatten() {
            let doc: ListingDocument = serde_json::from_str(&json)?;
            if filter.matches(&doc) {
                docs.push(doc);
            }
        }
        for doc in &mut docs {
            doc.reviews = self.load_review_ids(doc.id).await?;
        }
        Ok(docs)
    }

    async fn update_listing(
        &self,
        id: ListingId,
        patch: &ListingSubmission,
    ) -> Result<ListingDocument, StoreError> {
        let mut doc = self.load_listing(id).await?;
        patch.merge_into(&mut doc)?;
        self.save_listing(&doc).await?;
        Ok(doc)
    }

    async fn set_listing_image(
        &self,
        id: ListingId,
        image: Image,
    ) -> Result<ListingDocument, StoreError> {
        let mut doc = self.load_listing(id).await?;
        doc.image = Some(image);
        self.save_listing(&doc).await?;
        Ok(doc)
    }

    async fn delete_listing(&self, id: ListingId) -> Result<ListingDocument, StoreError> {
        let mut conn = self.conn.clone();
        let removed: Option<(String, Vec<String>)> = DELETE_CASCADE
            .key(self.listings_key())
            .key(self.order_key())
            .key(self.listing_reviews_key(id))
            .key(self.reviews_key())
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await?;
        let (raw, review_ids) = removed.ok_or(StoreError::NotFound("listing"))?;
        let mut doc: ListingDocument = serde_json::from_str(&raw)?;
        doc.reviews = review_ids
            .iter()
            .filter_map(|value| ReviewId::parse(value))
            .collect();
        Ok(doc)
    }

    async fn count_listings(&self) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let count: usize = conn.hlen(self.listings_key()).await?;
        Ok(count)
    }

    async fn clear_listings(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let order: Vec<String> = conn.lrange(self.order_key(), 0, -1).await?;
        let mut keys = vec![self.listings_key(), self.order_key(), self.reviews_key()];
        keys.extend(
            order
                .iter()
                .filter_map(|raw| ListingId::parse(raw))
                .map(|id| self.listing_reviews_key(id)),
        );
        let _: () = conn.del(keys).await?;
        Ok(())
    }
}

#[async_trait]
impl ReviewRepository for RedisStore {
    async fn insert_review(
        &self,
        listing: ListingId,
        review: NewReview,
    ) -> Result<Review, StoreError> {
        let review = build_review(listing, review);
        let json = serde_json::to_string(&review)?;
        let mut conn = self.conn.clone();
        let linked: i32 = LINK_REVIEW
            .key(self.listings_key())
            .key(self.reviews_key())
            .key(self.listing_reviews_key(listing))
            .arg(listing.to_string())
            .arg(review.id.to_string())
            .arg(json)
            .invoke_async(&mut conn)
            .await?;
        if linked == 0 {
            return Err(StoreError::NotFound("listing"));
        }
        Ok(review)
    }

    async fn find_review(&self, id: ReviewId) -> Result<Review, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(self.reviews_key(), id.to_string()).await?;
        let raw = raw.ok_or(StoreError::NotFound("review"))?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn find_reviews(&self, ids: &[ReviewId]) -> Result<Vec<Review>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let fields: Vec<String> = ids.iter().map(ReviewId::to_string).collect();
        let mut conn = self.conn.clone();
        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.reviews_key())
            .arg(&fields)
            .query_async(&mut conn)
            .await?;
        raw.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .collect()
    }

    async fn delete_review(&self, listing: ListingId, id: ReviewId) -> Result<Review, StoreError> {
        let review = self.find_review(id).await?;
        if review.listing != listing {
            return Err(StoreError::NotFound("review"));
        }
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hdel(self.reviews_key(), id.to_string())
            .ignore()
            .lrem(self.listing_reviews_key(listing), 0, id.to_string())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(review)
    }
}

#[async_trait]
impl UserRepository for RedisStore {
    async fn upsert_user(&self, user: User) -> Result<(), StoreError> {
        let json = serde_json::to_string(&user)?;
        let mut conn = self.conn.clone();
        let _: () = conn.hset(self.users_key(), user.id.to_string(), json).await?;
        Ok(())
    }

    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(self.users_key(), id.to_string()).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn register_user(&self, user: User, account: Account) -> Result<(), StoreError> {
        let user_json = serde_json::to_string(&user)?;
        let account_json = serde_json::to_string(&account)?;
        let mut conn = self.conn.clone();
        let created: i32 = REGISTER
            .key(self.users_key())
            .key(self.accounts_key())
            .arg(user.id.to_string())
            .arg(user_json)
            .arg(account_json)
            .invoke_async(&mut conn)
            .await?;
        if created == 0 {
            return Err(StoreError::Conflict("user"));
        }
        Ok(())
    }

    async fn find_account(&self, id: UserId) -> Result<Option<Account>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(self.accounts_key(), id.to_string()).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn insert_session(
        &self,
        key: &str,
        user: UserId,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(self.session_key(key), user.to_string(), ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn find_session(&self, key: &str) -> Result<Option<UserId>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.session_key(key)).await?;
        Ok(raw.as_deref().and_then(UserId::parse))
    }

    async fn delete_session(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.session_key(key)).await?;
        Ok(())
    }
}

impl DocumentStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }
}
