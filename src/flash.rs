//! One-shot notices carried across a redirect in a cookie.

use axum::{
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{COOKIE, LOCATION, SET_COOKIE},
    },
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

pub const FLASH_COOKIE: &str = "wanderlust_flash";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Error,
            message: message.into(),
        }
    }

    fn encode(&self) -> String {
        let kind = match self.kind {
            NoticeKind::Success => "success",
            NoticeKind::Error => "error",
        };
        urlencoding::encode(&format!("{kind}:{}", self.message)).into_owned()
    }

    fn decode(raw: &str) -> Option<Self> {
        let decoded = urlencoding::decode(raw).ok()?;
        let (kind, message) = decoded.split_once(':')?;
        let kind = match kind {
            "success" => NoticeKind::Success,
            "error" => NoticeKind::Error,
            _ => return None,
        };
        Some(Self {
            kind,
            message: message.to_string(),
        })
    }
}

/// `303 See Other` to `location`, with the notice set for the next render.
#[derive(Debug, Clone)]
pub struct FlashRedirect {
    pub location: String,
    pub notice: Option<Notice>,
    /// Extra `Set-Cookie` values sent along with the notice.
    pub cookies: Vec<String>,
}

impl FlashRedirect {
    pub fn to(location: impl Into<String>, notice: Notice) -> Self {
        Self {
            location: location.into(),
            notice: Some(notice),
            cookies: Vec::new(),
        }
    }

    pub fn plain(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            notice: None,
            cookies: Vec::new(),
        }
    }

    pub fn with_cookie(mut self, cookie: String) -> Self {
        self.cookies.push(cookie);
        self
    }
}

impl IntoResponse for FlashRedirect {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        match HeaderValue::from_str(&self.location) {
            Ok(value) => {
                headers.insert(LOCATION, value);
            }
            Err(_) => {
                headers.insert(LOCATION, HeaderValue::from_static("/listings"));
            }
        }
        if let Some(notice) = &self.notice {
            let cookie = format!(
                "{FLASH_COOKIE}={}; Path=/; Max-Age=60; HttpOnly; SameSite=Lax",
                notice.encode()
            );
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                headers.append(SET_COOKIE, value);
            }
        }
        for cookie in &self.cookies {
            if let Ok(value) = HeaderValue::from_str(cookie) {
                headers.append(SET_COOKIE, value);
            }
        }
        (StatusCode::SEE_OTHER, headers).into_response()
    }
}

/// Reads the pending notice, if any. The returned header value expires the
/// cookie and must be attached to the response that displays the notice.
pub fn take(headers: &HeaderMap) -> (Option<Notice>, Option<HeaderValue>) {
    let notice = cookie_value(headers, FLASH_COOKIE).and_then(|raw| Notice::decode(&raw));
    let clear = notice.as_ref().map(|_| {
        HeaderValue::from_static("wanderlust_flash=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax")
    });
    (notice, clear)
}

pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
