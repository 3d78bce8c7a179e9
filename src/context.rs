use crate::accounts::AccountService;
use crate::config::AppConfig;
use crate::geocode::{Geocoder, TomTomGeocoder};
use crate::guard::IntegrityGuard;
use crate::images::ImageStore;
use crate::listings::ListingService;
use crate::reviews::ReviewService;
use crate::security::CredentialStore;
use crate::seed;
use crate::store::{DocumentStore, MemoryStore, RedisStore};
use eyre::{WrapErr, eyre};
use metrics_exporter_prometheus::PrometheusHandle;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

/// Everything a request handler needs, built once at startup and cloned into
/// axum state.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn DocumentStore>,
    pub guard: IntegrityGuard,
    pub listings: ListingService,
    pub reviews: ReviewService,
    pub accounts: AccountService,
    pub prometheus: Option<PrometheusHandle>,
}

impl AppContext {
    /// [`AppContext::connect`], then seeds an empty store.
    pub async fn init(config: AppConfig) -> eyre::Result<Self> {
        let ctx = Self::connect(config).await?;
        let inserted = seed::seed_if_empty(ctx.store.as_ref(), ctx.seed_owner())
            .await
            .wrap_err("failed to seed sample listings")?;
        if inserted > 0 {
            info!(target = "wanderlust.seed", inserted, "store was empty; seeded");
        }
        Ok(ctx)
    }

    pub async fn connect(config: AppConfig) -> eyre::Result<Self> {
        let store = connect_store(&config).await?;
        let images = Arc::new(ImageStore::new(config.storage.clone()));
        let geocoder: Arc<dyn Geocoder> = Arc::new(TomTomGeocoder::new(config.geocoder.clone()));
        let credentials = CredentialStore::from_env();

        for user in credentials.users() {
            store
                .upsert_user(user)
                .await
                .wrap_err("failed to register configured users")?;
        }

        info!(
            target = "wanderlust.api",
            store = store.backend(),
            storage = images.strategy().name(),
            geocoding = config.geocoder.api_key.is_some(),
            "application context ready"
        );

        Ok(Self::assemble(
            config,
            store,
            geocoder,
            images,
            credentials,
            crate::metrics::install(),
        ))
    }

    pub fn assemble(
        config: AppConfig,
        store: Arc<dyn DocumentStore>,
        geocoder: Arc<dyn Geocoder>,
        images: Arc<ImageStore>,
        credentials: CredentialStore,
        prometheus: Option<PrometheusHandle>,
    ) -> Self {
        let guard = IntegrityGuard::new(config.public_dir.clone());
        let listings = ListingService::new(store.clone(), geocoder, images, guard.clone());
        let reviews = ReviewService::new(store.clone());
        let accounts = AccountService::new(store.clone(), credentials);
        Self {
            config: Arc::new(config),
            store,
            guard,
            listings,
            reviews,
            accounts,
            prometheus,
        }
    }

    /// Owner for seeded listings: the configured `SEED_OWNER`, when it names a
    /// known user.
    pub fn seed_owner(&self) -> Option<crate::models::UserId> {
        let username = self.config.seed_owner.as_deref()?;
        match self.accounts.credentials().find_by_username(username) {
            Some(user) => Some(user.id),
            None => {
                warn!(
                    target = "wanderlust.seed",
                    username, "SEED_OWNER is not a configured user; seeding without owner"
                );
                None
            }
        }
    }

    pub async fn shutdown(self) {
        match self.store.count_listings().await {
            Ok(listings) => info!(
                target = "wanderlust.api",
                store = self.store.backend(),
                listings,
                "shutdown complete"
            ),
            Err(err) => warn!(
                target = "wanderlust.api",
                error = %err,
                "shutdown complete; store unavailable"
            ),
        }
    }
}

async fn connect_store(config: &AppConfig) -> eyre::Result<Arc<dyn DocumentStore>> {
    let Some(url) = config.redis_url.as_deref() else {
        info!(target = "wanderlust.store", "REDIS_URL not set; using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    };

    let attempt = tokio::time::timeout(
        Duration::from_secs(5),
        RedisStore::connect(url, &config.redis_prefix),
    )
    .await
    .map_err(|_| eyre!("timed out connecting to redis"))
    .and_then(|result| result.map_err(eyre::Report::new));

    match attempt {
        Ok(store) => Ok(Arc::new(store)),
        Err(err) if config.env.is_production() => {
            Err(err.wrap_err("REDIS_URL is configured but unreachable"))
        }
        Err(err) => {
            warn!(
                target = "wanderlust.store",
                error = %err,
                "redis unreachable; falling back to in-memory store"
            );
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
