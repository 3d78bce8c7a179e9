use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{DefaultOnNull, serde_as, skip_serializing_none};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! document_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parses a path segment; anything that is not a UUID yields `None`.
            #[allow(dead_code)]
            pub fn parse(raw: &str) -> Option<Self> {
                Uuid::parse_str(raw.trim()).ok().map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

document_id!(ListingId);
document_id!(ReviewId);
document_id!(UserId);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Category {
    Trending,
    Rooms,
    #[serde(rename = "Iconic Cities")]
    IconicCities,
    Mountains,
    #[serde(rename = "Amazing Pools")]
    AmazingPools,
    Beach,
    Camping,
    Farms,
    Arctic,
    Dome,
    Boats,
}

impl Category {
    pub const ALL: [Category; 11] = [
        Category::Trending,
        Category::Rooms,
        Category::IconicCities,
        Category::Mountains,
        Category::AmazingPools,
        Category::Beach,
        Category::Camping,
        Category::Farms,
        Category::Arctic,
        Category::Dome,
        Category::Boats,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Trending => "Trending",
            Category::Rooms => "Rooms",
            Category::IconicCities => "Iconic Cities",
            Category::Mountains => "Mountains",
            Category::AmazingPools => "Amazing Pools",
            Category::Beach => "Beach",
            Category::Camping => "Camping",
            Category::Farms => "Farms",
            Category::Arctic => "Arctic",
            Category::Dome => "Dome",
            Category::Boats => "Boats",
        }
    }
}

impl FromStr for Category {
    type Err = ();

    /// Exact, case-sensitive match against the display names.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|category| category.as_str() == input)
            .ok_or(())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    #[serde(rename = "type")]
    pub kind: String,
    /// `[longitude, latitude]`
    pub coordinates: [f64; 2],
}

impl Geometry {
    pub fn point(lon: f64, lat: f64) -> Self {
        Self {
            kind: "Point".to_string(),
            coordinates: [lon, lat],
        }
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::point(0.0, 0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
}

/// Sign-in record for a user who registered through `/signup`. Users loaded
/// from `WANDERLUST_USERS` have none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub email: String,
    pub password: PasswordHash,
}

/// Hex-encoded salt and SHA-256 of `salt || password`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PasswordHash {
    pub salt: String,
    pub digest: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SignupForm {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

/// A listing as persisted. Optional fields cover legacy records written
/// before the field existed; reads go through the integrity guard.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDocument {
    pub id: ListingId,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image: Option<Image>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub location: String,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub geometry: Option<Geometry>,
    pub category: Category,
    #[serde(default)]
    pub owner: Option<UserId>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub reviews: Vec<ReviewId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: ReviewId,
    pub listing: ListingId,
    #[serde(default)]
    pub author: Option<UserId>,
    pub rating: u8,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

/// Raw listing fields as submitted by a form. Nothing here is checked
/// until the store applies the schema at persist time.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ListingSubmission {
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<String>,
    pub location: Option<String>,
    pub country: Option<String>,
    pub category: Option<String>,
}

impl ListingSubmission {
    /// Assigns a form field by name, accepting both `listing[title]` and `title`.
    /// Returns false for names that are not listing fields.
    pub fn assign(&mut self, name: &str, value: String) -> bool {
        let key = name
            .strip_prefix("listing[")
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(name);
        let slot = match key {
            "title" => &mut self.title,
            "description" => &mut self.description,
            "price" => &mut self.price,
            "location" => &mut self.location,
            "country" => &mut self.country,
            "category" => &mut self.category,
            _ => return false,
        };
        *slot = Some(value);
        true
    }
}

/// Schema-checked listing fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingFields {
    pub title: String,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub location: String,
    pub country: String,
    pub category: Category,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation(pub String);

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listing validation failed: {}", self.0)
    }
}

impl ListingSubmission {
    pub fn validate(&self) -> Result<ListingFields, SchemaViolation> {
        let title = match self.title.as_deref().map(str::trim) {
            Some(title) if !title.is_empty() => title.to_string(),
            _ => return Err(SchemaViolation("title: path `title` is required".into())),
        };
        let category = match self.category.as_deref() {
            Some(raw) => parse_category(raw)?,
            None => {
                return Err(SchemaViolation(
                    "category: path `category` is required".into(),
                ));
            }
        };
        Ok(ListingFields {
            title,
            description: self.description.clone(),
            price: self.price.as_deref().map(parse_price).transpose()?.flatten(),
            location: self.location.clone().unwrap_or_default(),
            country: self.country.clone().unwrap_or_default(),
            category,
        })
    }

    /// Applies the fields present in the submission onto `doc`; absent fields
    /// are left untouched. The document is only modified if every present
    /// field passes the schema.
    pub fn merge_into(&self, doc: &mut ListingDocument) -> Result<(), SchemaViolation> {
        let title = match self.title.as_deref().map(str::trim) {
            Some("") => return Err(SchemaViolation("title: path `title` is required".into())),
            other => other.map(str::to_string),
        };
        let category = self.category.as_deref().map(parse_category).transpose()?;
        let price = self.price.as_deref().map(parse_price).transpose()?;

        if let Some(title) = title {
            doc.title = title;
        }
        if let Some(category) = category {
            doc.category = category;
        }
        if let Some(price) = price {
            doc.price = price;
        }
        if let Some(description) = &self.description {
            doc.description = Some(description.clone());
        }
        if let Some(location) = &self.location {
            doc.location = location.clone();
        }
        if let Some(country) = &self.country {
            doc.country = country.clone();
        }
        Ok(())
    }
}

fn parse_category(raw: &str) -> Result<Category, SchemaViolation> {
    raw.parse().map_err(|_| {
        SchemaViolation(format!(
            "category: `{raw}` is not a valid enum value for path `category`"
        ))
    })
}

/// Blank means "no price"; anything else must be a non-negative number.
fn parse_price(raw: &str) -> Result<Option<f64>, SchemaViolation> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Ok(Some(value)),
        Ok(_) => Err(SchemaViolation(format!(
            "price: `{trimmed}` must be a non-negative number"
        ))),
        Err(_) => Err(SchemaViolation(format!(
            "price: cast to Number failed for value `{trimmed}`"
        ))),
    }
}

/// Everything the store needs to create a listing.
#[derive(Debug, Clone)]
pub struct ListingDraft {
    pub submission: ListingSubmission,
    pub image: Image,
    pub geometry: Geometry,
    pub owner: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListingFilter {
    All,
    Category(String),
    /// Case-insensitive substring over country, title and location.
    Search(String),
}

impl ListingFilter {
    pub fn matches(&self, doc: &ListingDocument) -> bool {
        match self {
            ListingFilter::All => true,
            ListingFilter::Category(category) => doc.category.as_str() == category,
            ListingFilter::Search(needle) => {
                let needle = needle.to_lowercase();
                [&doc.country, &doc.title, &doc.location]
                    .iter()
                    .any(|field| field.to_lowercase().contains(&needle))
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListingQuery {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReviewForm {
    #[serde(alias = "review[rating]")]
    pub rating: String,
    #[serde(alias = "review[comment]")]
    pub comment: String,
}

#[derive(Debug, Clone)]
pub struct NewReview {
    pub author: UserId,
    pub rating: u8,
    pub comment: String,
}

/// Listing joined with its owner and reviews, straight from the store.
/// `None` means the reference could not be resolved.
#[derive(Debug, Clone)]
pub struct PopulatedListing {
    pub listing: ListingDocument,
    pub owner: Option<User>,
    pub reviews: Option<Vec<PopulatedReview>>,
}

#[derive(Debug, Clone)]
pub struct PopulatedReview {
    pub review: Review,
    pub author: Option<User>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserRef {
    pub id: Option<UserId>,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewView {
    pub id: ReviewId,
    pub rating: u8,
    pub comment: String,
    pub author: UserRef,
    pub created_at: DateTime<Utc>,
}

/// A listing after the integrity guard: every field a consumer reads is set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListingView {
    pub id: ListingId,
    pub title: String,
    pub description: Option<String>,
    pub image: Image,
    pub price: f64,
    pub location: String,
    pub country: String,
    pub geometry: Geometry,
    pub category: Category,
    pub owner: UserRef,
    pub reviews: Vec<ReviewView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListingCard {
    pub id: ListingId,
    pub title: String,
    pub image: Image,
    pub price: f64,
    pub location: String,
    pub country: String,
    pub geometry: Geometry,
    pub category: Category,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
