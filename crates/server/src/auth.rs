//! Bearer authentication against an OIDC userinfo endpoint.

use std::time::Duration;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::{ACCEPT, AUTHORIZATION};
use axum::http::request::Parts;
use log::debug;
use reqwest::Client;
use thiserror::Error;

use crate::api::AppState;
use crate::error::ApiError;

/// Header the form upload token is forwarded in
pub const UPLOAD_TOKEN_HEADER: &str = "X-Upload-Token";

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("userinfo request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("userinfo responded with status {0}")]
    Status(u16),

    #[error("userinfo did not return a user id")]
    MissingSubject,
}

/// What a request presented to prove who it is
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Raw `Authorization` header, usually `Bearer <token>`
    pub authorization: Option<String>,
    /// `upload_token` query parameter used by plain HTML form uploads
    pub upload_token: Option<String>,
}

impl Credentials {
    pub fn from_parts(parts: &Parts) -> Self {
        let authorization = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let upload_token = parts.uri.query().and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "upload_token")
                .map(|(_, value)| value.into_owned())
        });

        Self {
            authorization,
            upload_token,
        }
    }
}

/// Resolves request credentials to a user id
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Result<String, AuthError>;
}

/// [`Authenticator`] that asks a userinfo endpoint for the `sub` claim
pub struct UserInfoAuthenticator {
    http: Client,
    auth_url: String,
}

impl UserInfoAuthenticator {
    pub fn new(auth_url: impl Into<String>) -> Result<Self, AuthError> {
        let http = Client::builder().timeout(AUTH_TIMEOUT).build()?;
        Ok(Self {
            http,
            auth_url: auth_url.into(),
        })
    }
}

#[async_trait]
impl Authenticator for UserInfoAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Result<String, AuthError> {
        let mut request = self.http.get(&self.auth_url).header(ACCEPT, "application/json");
        if let Some(authorization) = &credentials.authorization {
            request = request.header(AUTHORIZATION, authorization);
        }
        if let Some(token) = &credentials.upload_token {
            request = request.header(UPLOAD_TOKEN_HEADER, token);
        }

        let response = request.send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(AuthError::Status(response.status().as_u16()));
        }

        let userinfo: serde_json::Value = response.json().await?;
        let user = userinfo
            .get("sub")
            .and_then(|sub| sub.as_str())
            .ok_or(AuthError::MissingSubject)?;

        debug!("Authenticated as {}", user);
        Ok(user.to_string())
    }
}

/// Authenticated user id, extracted before the handler touches the body
#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let credentials = Credentials::from_parts(parts);
        state
            .auth
            .authenticate(&credentials)
            .await
            .map(AuthUser)
            .map_err(|e| ApiError::Unauthorized(e.to_string()))
    }
}
