use crate::guard::IntegrityGuard;
use crate::images::UPLOADS_PREFIX;
use crate::models::ListingFilter;
use crate::store::{DocumentStore, StoreError};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Listings whose image points into local upload storage.
    pub scanned: usize,
    pub updated: usize,
}

/// Persists the guard's placeholder substitution for every listing whose
/// local upload file is missing.
pub async fn fix_missing_uploads(
    store: &dyn DocumentStore,
    guard: &IntegrityGuard,
) -> Result<ReconcileReport, StoreError> {
    let mut report = ReconcileReport::default();
    for listing in store.find_listings(&ListingFilter::All).await? {
        let Some(mut image) = listing.image else {
            continue;
        };
        if !image.url.starts_with(UPLOADS_PREFIX) {
            continue;
        }
        report.scanned += 1;
        let original = image.url.clone();
        if guard.reconcile_image(&mut image) {
            store.set_listing_image(listing.id, image).await?;
            report.updated += 1;
            info!(
                target = "wanderlust.maintenance",
                listing = %listing.id,
                url = %original,
                "missing upload replaced with placeholder"
            );
        }
    }
    info!(
        target = "wanderlust.maintenance",
        scanned = report.scanned,
        updated = report.updated,
        "upload reconciliation finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::PLACEHOLDER_IMAGE;
    use crate::models::Image;
    use crate::store::{ListingRepository, MemoryStore, testing::draft};
    use tempfile::TempDir;

    #[tokio::test]
    async fn replaces_only_missing_local_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
        std::fs::write(dir.path().join("uploads/kept.png"), b"png").unwrap();
        let store = MemoryStore::new();

        let mut ids = Vec::new();
        for url in [
            "/uploads/kept.png",
            "/uploads/gone.png",
            "https://res.cloudinary.com/x.png",
        ] {
            let mut draft = draft("Hut", "Camping", "Norway", None);
            draft.image = Image {
                url: url.into(),
                filename: "f".into(),
            };
            ids.push(store.insert_listing(draft).await.unwrap().id);
        }

        let guard = IntegrityGuard::new(dir.path().to_path_buf());
        let report = fix_missing_uploads(&store, &guard).await.unwrap();
        assert_eq!(report, ReconcileReport { scanned: 2, updated: 1 });

        let kept = store.find_listing(ids[0]).await.unwrap().image.unwrap();
        let gone = store.find_listing(ids[1]).await.unwrap().image.unwrap();
        let remote = store.find_listing(ids[2]).await.unwrap().image.unwrap();
        assert_eq!(kept.url, "/uploads/kept.png");
        assert_eq!(gone.url, PLACEHOLDER_IMAGE);
        assert_eq!(gone.filename, "");
        assert_eq!(remote.url, "https://res.cloudinary.com/x.png");

        let again = fix_missing_uploads(&store, &guard).await.unwrap();
        assert_eq!(again, ReconcileReport { scanned: 1, updated: 0 });
    }
}
