use crate::http::build_client;
use crate::models::Image;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{info, warn};

/// URL prefix under which locally stored uploads are served.
pub const UPLOADS_PREFIX: &str = "/uploads/";

#[derive(Debug, Error)]
pub enum ImageStoreError {
    #[error("could not write upload: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote upload failed: {0}")]
    Upload(String),
    #[error("{0}")]
    Validation(String),
}

/// Extensions accepted for uploads, locally and remotely.
pub const ALLOWED_FORMATS: [&str; 3] = ["png", "jpg", "jpeg"];

/// An image received in a multipart request, not yet stored anywhere.
#[derive(Debug, Clone)]
pub struct Upload {
    pub original_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CloudinaryConfig {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
    pub folder: String,
    pub api_base: String,
}

/// Where uploads live, fixed once at process start.
#[derive(Debug, Clone)]
pub enum StorageStrategy {
    LocalDisk { public_dir: PathBuf },
    RemoteObjectStore(CloudinaryConfig),
}

impl StorageStrategy {
    /// Remote storage only when all three Cloudinary credentials are present.
    pub fn from_env(public_dir: PathBuf) -> Self {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        match (var("CLOUD_NAME"), var("CLOUD_API_KEY"), var("CLOUD_API_SECRET")) {
            (Some(cloud_name), Some(api_key), Some(api_secret)) => {
                StorageStrategy::RemoteObjectStore(CloudinaryConfig {
                    cloud_name,
                    api_key,
                    api_secret,
                    folder: var("CLOUD_FOLDER").unwrap_or_else(|| "wanderlust_DEV".into()),
                    api_base: var("CLOUDINARY_API_BASE")
                        .unwrap_or_else(|| "https://api.cloudinary.com".into()),
                })
            }
            _ => StorageStrategy::LocalDisk { public_dir },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StorageStrategy::LocalDisk { .. } => "local-disk",
            StorageStrategy::RemoteObjectStore(_) => "remote-object-store",
        }
    }
}

pub struct ImageStore {
    strategy: StorageStrategy,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct CloudinaryUploadResponse {
    secure_url: String,
    public_id: String,
}

impl ImageStore {
    pub fn new(strategy: StorageStrategy) -> Self {
        Self {
            strategy,
            http: build_client(Duration::from_secs(30)),
        }
    }

    pub fn strategy(&self) -> &StorageStrategy {
        &self.strategy
    }

    /// Rejects uploads whose file name does not end in an allowed extension.
    pub fn check_format(upload: &Upload) -> Result<(), ImageStoreError> {
        let accepted = upload_extension(&upload.original_name)
            .is_some_and(|ext| ALLOWED_FORMATS.contains(&ext.as_str()));
        if accepted {
            Ok(())
        } else {
            Err(ImageStoreError::Validation(format!(
                "Only {} images are allowed",
                ALLOWED_FORMATS.join(", ")
            )))
        }
    }

    /// Stores the upload and returns the `(url, filename)` pair a listing records.
    pub async fn store(&self, upload: &Upload) -> Result<Image, ImageStoreError> {
        Self::check_format(upload)?;
        match &self.strategy {
            StorageStrategy::LocalDisk { public_dir } => store_local(public_dir, upload).await,
            StorageStrategy::RemoteObjectStore(config) => self.store_remote(config, upload).await,
        }
    }

    /// Best-effort removal of an image stored by [`ImageStore::store`] whose
    /// listing was never persisted. Failures are logged, not returned.
    pub async fn discard(&self, image: &Image) {
        let result = match &self.strategy {
            StorageStrategy::LocalDisk { public_dir } => {
                match local_path(public_dir, &image.url) {
                    Some(path) => tokio::fs::remove_file(path)
                        .await
                        .map_err(|err| err.to_string()),
                    None => Ok(()),
                }
            }
            StorageStrategy::RemoteObjectStore(config) => {
                self.destroy_remote(config, &image.filename).await
            }
        };
        match result {
            Ok(()) => info!(target = "wanderlust.images", url = %image.url, "discarded orphaned upload"),
            Err(err) => warn!(
                target = "wanderlust.images",
                url = %image.url,
                error = %err,
                "could not discard orphaned upload"
            ),
        }
    }

    async fn store_remote(
        &self,
        config: &CloudinaryConfig,
        upload: &Upload,
    ) -> Result<Image, ImageStoreError> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let allowed_formats = ALLOWED_FORMATS.join(",");
        let signature = sign(
            &[
                ("allowed_formats", allowed_formats.as_str()),
                ("folder", config.folder.as_str()),
                ("timestamp", timestamp.as_str()),
            ],
            &config.api_secret,
        );
        let content_type = upload
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".into());
        let file = format!(
            "data:{content_type};base64,{}",
            BASE64.encode(&upload.bytes)
        );
        let url = format!(
            "{}/v1_1/{}/image/upload",
            config.api_base, config.cloud_name
        );
        let response = self
            .http
            .post(url)
            .form(&[
                ("file", file.as_str()),
                ("api_key", config.api_key.as_str()),
                ("timestamp", timestamp.as_str()),
                ("folder", config.folder.as_str()),
                ("allowed_formats", allowed_formats.as_str()),
                ("signature", signature.as_str()),
                ("signature_algorithm", "sha256"),
            ])
            .send()
            .await
            .map_err(|err| ImageStoreError::Upload(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ImageStoreError::Upload(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let payload: CloudinaryUploadResponse = response
            .json()
            .await
            .map_err(|err| ImageStoreError::Upload(err.to_string()))?;
        Ok(Image {
            url: payload.secure_url,
            filename: payload.public_id,
        })
    }

    async fn destroy_remote(&self, config: &CloudinaryConfig, public_id: &str) -> Result<(), String> {
        if public_id.is_empty() {
            return Ok(());
        }
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = sign(
            &[("public_id", public_id), ("timestamp", timestamp.as_str())],
            &config.api_secret,
        );
        let url = format!(
            "{}/v1_1/{}/image/destroy",
            config.api_base, config.cloud_name
        );
        let response = self
            .http
            .post(url)
            .form(&[
                ("public_id", public_id),
                ("api_key", config.api_key.as_str()),
                ("timestamp", timestamp.as_str()),
                ("signature", signature.as_str()),
                ("signature_algorithm", "sha256"),
            ])
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {}", response.status()))
        }
    }
}

async fn store_local(public_dir: &Path, upload: &Upload) -> Result<Image, ImageStoreError> {
    let filename = generated_filename(&upload.original_name);
    let dir = public_dir.join(UPLOADS_PREFIX.trim_matches('/'));
    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::write(dir.join(&filename), &upload.bytes).await?;
    Ok(Image {
        url: format!("{UPLOADS_PREFIX}{filename}"),
        filename,
    })
}

/// `<millis>-<random>.<ext>`, keeping the original extension.
fn generated_filename(original: &str) -> String {
    let unique = format!(
        "{}-{}",
        chrono::Utc::now().timestamp_millis(),
        rand::rng().random_range(0..1_000_000_000u32)
    );
    match upload_extension(original) {
        Some(ext) => format!("{unique}.{ext}"),
        None => unique,
    }
}

/// Lowercased extension of a file name, when it is a plain alphanumeric suffix.
fn upload_extension(original: &str) -> Option<String> {
    original
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8)
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
}

/// Maps a `/uploads/...` URL to its file under `public_dir`. Returns `None`
/// for URLs outside local upload storage or ones that try to escape it.
pub fn local_path(public_dir: &Path, url: &str) -> Option<PathBuf> {
    let relative = url.strip_prefix(UPLOADS_PREFIX)?;
    if relative.is_empty()
        || relative
            .split(['/', '\\'])
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return None;
    }
    Some(
        public_dir
            .join(UPLOADS_PREFIX.trim_matches('/'))
            .join(relative),
    )
}

/// Cloudinary request signature: sorted `key=value` pairs joined by `&`,
/// followed by the API secret, hashed with SHA-256.
fn sign(params: &[(&str, &str)], secret: &str) -> String {
    let mut sorted = params.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let joined = sorted
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");
    let digest = Sha256::digest(format!("{joined}{secret}").as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}
