//! src/services/download_token.rs
//!
//! Time-limited bearer credentials for the download endpoint. Tokens are HS512
//! JWTs signed with the object store's root secret and carry the caller's
//! access key; the deal network receives them embedded in a download URL.

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Download tokens stay valid for a week so slow deal pipelines can still fetch.
pub const TOKEN_VALIDITY_HOURS: i64 = 24 * 7;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token signing secret is empty")]
    MissingSecret,
    #[error("download token expired")]
    Expired,
    #[error("invalid download token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("invalid base url `{0}`")]
    BaseUrl(String),
}

pub type TokenResult<T> = Result<T, TokenError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadClaims {
    #[serde(rename = "accessKey")]
    pub access_key: String,
    pub exp: i64,
}

/// Mints and verifies download tokens, and builds the URLs that carry them.
#[derive(Clone)]
pub struct DownloadTokens {
    access_key: String,
    secret: String,
    host_name: String,
}

impl std::fmt::Debug for DownloadTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTokens")
            .field("access_key", &self.access_key)
            .field("host_name", &self.host_name)
            .finish_non_exhaustive()
    }
}

impl DownloadTokens {
    pub fn new(
        access_key: impl Into<String>,
        secret: impl Into<String>,
        host_name: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret: secret.into(),
            host_name: host_name.into(),
        }
    }

    pub fn mint(&self) -> TokenResult<String> {
        self.mint_with_validity(Duration::hours(TOKEN_VALIDITY_HOURS))
    }

    pub fn mint_with_validity(&self, validity: Duration) -> TokenResult<String> {
        if self.secret.is_empty() {
            return Err(TokenError::MissingSecret);
        }
        let claims = DownloadClaims {
            access_key: self.access_key.clone(),
            exp: (Utc::now() + validity).timestamp(),
        };
        Ok(encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?)
    }

    pub fn verify(&self, token: &str) -> TokenResult<DownloadClaims> {
        if self.secret.is_empty() {
            return Err(TokenError::MissingSecret);
        }
        let mut validation = Validation::new(Algorithm::HS512);
        validation.leeway = 0;
        decode::<DownloadClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|err| match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
            _ => TokenError::Invalid(err),
        })
    }

    /// `{host}/download/{bucket}[/{object}]?token=..[&format=zip]` with a fresh token.
    pub fn download_url(&self, bucket: &str, object: &str, is_dir: bool) -> TokenResult<String> {
        let token = self.mint()?;
        let mut url = Url::parse(&self.host_name)
            .map_err(|_| TokenError::BaseUrl(self.host_name.clone()))?;
        url.path_segments_mut()
            .map_err(|_| TokenError::BaseUrl(self.host_name.clone()))?
            .pop_if_empty()
            .push("download")
            .push(bucket)
            .extend(object.split('/').filter(|s| !s.is_empty()));
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("token", &token);
            if is_dir {
                query.append_pair("format", "zip");
            }
        }
        Ok(url.into())
    }
}
