//! Read-time normalization of listing records.
//!
//! The store may hand back partial or legacy documents: no image, no
//! geometry, a dangling owner, an unresolvable review list, a null price, or a
//! local upload whose file vanished with an ephemeral filesystem. Everything
//! that renders or serializes a listing goes through [`IntegrityGuard`] first,
//! and nothing downstream re-derives these defaults.
//!
//! The guard only touches the in-memory value. Persisting a correction is the
//! job of the maintenance reconciliation.

use crate::images::{UPLOADS_PREFIX, local_path};
use crate::models::{
    Geometry, Image, ListingCard, ListingDocument, ListingView, PopulatedListing, PopulatedReview,
    ReviewView, User, UserRef,
};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Served in place of a local upload that no longer exists.
pub const PLACEHOLDER_IMAGE: &str = "/images/placeholder.svg";

pub const UNKNOWN_USERNAME: &str = "Unknown";

#[derive(Debug, Clone)]
pub struct IntegrityGuard {
    public_dir: PathBuf,
}

impl IntegrityGuard {
    pub fn new(public_dir: PathBuf) -> Self {
        Self { public_dir }
    }

    pub fn normalize(&self, populated: PopulatedListing) -> ListingView {
        let PopulatedListing {
            listing,
            owner,
            reviews,
        } = populated;
        let id = listing.id;

        let mut image = listing.image.unwrap_or_else(|| {
            debug!(target = "wanderlust.guard", listing = %id, "image missing; defaulted");
            Image::default()
        });
        let geometry = listing.geometry.unwrap_or_else(|| {
            debug!(target = "wanderlust.guard", listing = %id, "geometry missing; defaulted");
            Geometry::default()
        });
        let owner = owner.map(user_ref).unwrap_or_else(unknown_user);
        let reviews = reviews
            .unwrap_or_default()
            .into_iter()
            .map(review_view)
            .collect();
        let price = listing.price.unwrap_or(0.0);
        self.reconcile_image(&mut image);

        ListingView {
            id,
            title: listing.title,
            description: listing.description,
            image,
            price,
            location: listing.location,
            country: listing.country,
            geometry,
            category: listing.category,
            owner,
            reviews,
        }
    }

    /// The subset of the rules that applies to index cards, which carry no
    /// owner or reviews.
    pub fn normalize_card(&self, listing: ListingDocument) -> ListingCard {
        let mut image = listing.image.unwrap_or_default();
        self.reconcile_image(&mut image);
        ListingCard {
            id: listing.id,
            title: listing.title,
            image,
            price: listing.price.unwrap_or(0.0),
            location: listing.location,
            country: listing.country,
            geometry: listing.geometry.unwrap_or_default(),
            category: listing.category,
        }
    }

    /// Swaps a local upload whose file is gone for the placeholder. Returns
    /// true when the image was changed. Remote URLs and the placeholder itself
    /// are left alone, so applying this twice is the same as applying it once.
    pub fn reconcile_image(&self, image: &mut Image) -> bool {
        if !image.url.starts_with(UPLOADS_PREFIX) || self.local_file_exists(&image.url) {
            return false;
        }
        debug!(
            target = "wanderlust.guard",
            url = %image.url,
            "local upload missing; using placeholder"
        );
        image.url = PLACEHOLDER_IMAGE.to_string();
        image.filename.clear();
        true
    }

    /// Any probe failure counts as "missing".
    fn local_file_exists(&self, url: &str) -> bool {
        let Some(path) = local_path(&self.public_dir, url) else {
            return false;
        };
        match path.try_exists() {
            Ok(exists) => exists && path.is_file(),
            Err(err) => {
                warn!(
                    target = "wanderlust.guard",
                    path = %path.display(),
                    error = %err,
                    "upload probe failed"
                );
                false
            }
        }
    }
}

fn user_ref(user: User) -> UserRef {
    UserRef {
        id: Some(user.id),
        username: user.username,
    }
}

fn unknown_user() -> UserRef {
    UserRef {
        id: None,
        username: UNKNOWN_USERNAME.to_string(),
    }
}

fn review_view(populated: PopulatedReview) -> ReviewView {
    let PopulatedReview { review, author } = populated;
    ReviewView {
        id: review.id,
        rating: review.rating,
        comment: review.comment,
        author: author.map(user_ref).unwrap_or_else(unknown_user),
        created_at: review.created_at,
    }
}
