use crate::flash::cookie_value;
use crate::models::{Account, LoginForm, PasswordHash, SignupForm, User};
use crate::security::{CredentialStore, SESSION_COOKIE, extract_token, user_id_for};
use crate::store::{DocumentStore, StoreError};
use axum::http::HeaderMap;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

/// Sessions last a week, like the session cookie that carries them.
pub const SESSION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("{0}")]
    Validation(String),
    #[error("A user with the given username is already registered")]
    UsernameTaken,
    #[error("Password or username is incorrect")]
    InvalidCredentials,
    #[error("{0}")]
    Persistence(String),
}

impl From<StoreError> for AccountError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(_) => AccountError::UsernameTaken,
            other => AccountError::Persistence(other.to_string()),
        }
    }
}

/// A freshly opened session. `token` goes into the session cookie; the store
/// only keeps its digest.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user: User,
}

/// Sign-up, sign-in and session lookup. Tokens from `WANDERLUST_USERS` are
/// checked first and never expire.
#[derive(Clone)]
pub struct AccountService {
    store: Arc<dyn DocumentStore>,
    credentials: CredentialStore,
}

impl AccountService {
    pub fn new(store: Arc<dyn DocumentStore>, credentials: CredentialStore) -> Self {
        Self { store, credentials }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub async fn signup(&self, form: SignupForm) -> Result<Session, AccountError> {
        let username = form.username.trim();
        validate_username(username)?;
        let email = form.email.trim();
        if !email.contains('@') {
            return Err(AccountError::Validation("Please enter a valid email".into()));
        }
        if form.password.is_empty() {
            return Err(AccountError::Validation("Password cannot be empty".into()));
        }

        let user = User {
            id: user_id_for(username),
            username: username.to_string(),
        };
        let account = Account {
            email: email.to_string(),
            password: PasswordHash::new(&form.password),
        };
        self.store.register_user(user.clone(), account).await?;
        info!(target = "wanderlust.auth", username = %user.username, "user registered");
        crate::metrics::inc_operation("user_registered");
        self.open_session(user).await
    }

    pub async fn login(&self, form: LoginForm) -> Result<Session, AccountError> {
        let id = user_id_for(form.username.trim());
        let account = self
            .store
            .find_account(id)
            .await?
            .ok_or(AccountError::InvalidCredentials)?;
        if !account.password.verify(&form.password) {
            warn!(target = "wanderlust.auth", user = %id, "password mismatch");
            return Err(AccountError::InvalidCredentials);
        }
        let user = self
            .store
            .find_user(id)
            .await?
            .ok_or(AccountError::InvalidCredentials)?;
        self.open_session(user).await
    }

    /// Ends the session named by the session cookie, if there is one.
    pub async fn logout(&self, headers: &HeaderMap) -> Result<(), AccountError> {
        if let Some(token) = cookie_value(headers, SESSION_COOKIE) {
            self.store.delete_session(&session_key(&token)).await?;
        }
        Ok(())
    }

    /// The requesting user. Store failures count as anonymous.
    pub async fn resolve(&self, headers: &HeaderMap) -> Option<User> {
        if let Some(user) = self.credentials.resolve(headers) {
            return Some(user);
        }
        let token = extract_token(headers)?;
        let found = match self.store.find_session(&session_key(&token)).await {
            Ok(Some(id)) => self.store.find_user(id).await,
            Ok(None) => return None,
            Err(err) => Err(err),
        };
        found.unwrap_or_else(|err| {
            warn!(target = "wanderlust.auth", error = %err, "session lookup failed");
            None
        })
    }

    async fn open_session(&self, user: User) -> Result<Session, AccountError> {
        let token = random_hex::<32>();
        self.store
            .insert_session(&session_key(&token), user.id, SESSION_TTL)
            .await?;
        Ok(Session { token, user })
    }
}

impl PasswordHash {
    pub fn new(password: &str) -> Self {
        let salt = random_hex::<16>();
        let digest = salted_digest(&salt, password);
        Self { salt, digest }
    }

    pub fn verify(&self, password: &str) -> bool {
        salted_digest(&self.salt, password) == self.digest
    }
}

fn validate_username(username: &str) -> Result<(), AccountError> {
    if username.is_empty() {
        return Err(AccountError::Validation("Username cannot be empty".into()));
    }
    if username.len() > 32
        || !username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(AccountError::Validation(
            "Username may only use letters, digits, '.', '_' and '-' (32 at most)".into(),
        ));
    }
    Ok(())
}

fn salted_digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex(&hasher.finalize())
}

fn session_key(token: &str) -> String {
    hex(&Sha256::digest(token.as_bytes()))
}

fn random_hex<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    rand::rng().fill(&mut bytes);
    hex(&bytes)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
