//! API-key authentication
//!
//! Callers send `Authorization: Bearer <key>`. Keys are only ever held as
//! SHA-256 digests; a request is mapped to the project that owns the digest.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

use super::handlers::{ApiError, AppState};
use crate::storage::ProjectId;

/// Resolves a raw API key to the project it belongs to
pub trait ApiKeyResolver: Send + Sync {
    fn resolve(&self, raw_key: &str) -> Option<ProjectId>;
}

/// Lowercase hex SHA-256 of a raw key
pub fn hash_key(raw_key: &str) -> String {
    hex::encode(Sha256::digest(raw_key.as_bytes()))
}

/// A configured key, already hashed
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKeyEntry {
    pub project: ProjectId,
    pub key_hash: String,
}

impl ApiKeyEntry {
    pub fn new(project: ProjectId, raw_key: &str) -> Self {
        Self {
            project,
            key_hash: hash_key(raw_key),
        }
    }

    /// Parse `project_id:key` pairs separated by commas
    pub fn parse_list(spec: &str) -> Result<Vec<Self>, InvalidKeySpec> {
        spec.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|pair| {
                let (project, key) = pair
                    .split_once(':')
                    .ok_or_else(|| InvalidKeySpec(redact(pair)))?;
                let project: i64 = project
                    .trim()
                    .parse()
                    .map_err(|_| InvalidKeySpec(redact(pair)))?;
                let key = key.trim();
                if key.is_empty() {
                    return Err(InvalidKeySpec(redact(pair)));
                }
                Ok(Self::new(ProjectId(project), key))
            })
            .collect()
    }
}

impl fmt::Debug for ApiKeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyEntry")
            .field("project", &self.project)
            .field("key_hash", &&self.key_hash[..8.min(self.key_hash.len())])
            .finish()
    }
}

// never echo key material back in errors
fn redact(pair: &str) -> String {
    match pair.split_once(':') {
        Some((project, _)) => format!("{}:***", project.trim()),
        None => "***".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid API key entry {0:?}, expected project_id:key")]
pub struct InvalidKeySpec(pub String);

/// In-memory key table keyed by digest
#[derive(Default)]
pub struct StaticApiKeys {
    keys: DashMap<String, ProjectId>,
}

impl StaticApiKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[ApiKeyEntry]) -> Self {
        let keys = Self::new();
        for entry in entries {
            keys.keys.insert(entry.key_hash.clone(), entry.project);
        }
        keys
    }

    pub fn insert(&self, project: ProjectId, raw_key: &str) {
        self.keys.insert(hash_key(raw_key), project);
    }

    /// Revoke a key; returns whether it existed
    pub fn revoke(&self, raw_key: &str) -> bool {
        self.keys.remove(&hash_key(raw_key)).is_some()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl ApiKeyResolver for StaticApiKeys {
    fn resolve(&self, raw_key: &str) -> Option<ProjectId> {
        self.keys.get(&hash_key(raw_key)).map(|p| *p)
    }
}

/// Extractor for the project owning the request's API key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectAuth(pub ProjectId);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for ProjectAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("Missing API key".to_string()))?;

        let key = bearer_token(header)
            .ok_or_else(|| ApiError::Unauthorized("Invalid authorization header".to_string()))?;

        state
            .keys
            .resolve(key)
            .map(ProjectAuth)
            .ok_or_else(|| ApiError::Unauthorized("Invalid API key".to_string()))
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
