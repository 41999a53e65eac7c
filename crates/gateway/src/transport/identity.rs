// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User identification. The core consumes a resolved `user_id` string; the
//! Keycloak introspection client is the external identity collaborator.

use axum::http::HeaderMap;
use serde::Deserialize;

use crate::config::{GateConfig, SecurityMethod};
use crate::error::GateError;

/// Resolves the effective user for a request.
pub enum IdentityEnforcer {
    /// No identity provider. With override enabled the client-supplied id is
    /// trusted; otherwise every request maps to the literal `default` user.
    Disabled { allow_override: bool },
    Keycloak(KeycloakVerifier),
}

impl IdentityEnforcer {
    pub fn from_config(config: &GateConfig) -> anyhow::Result<Self> {
        match config.security {
            SecurityMethod::None => {
                Ok(Self::Disabled { allow_override: config.allow_user_override })
            }
            SecurityMethod::Keycloak => {
                let (Some(url), Some(realm), Some(client_id), Some(client_secret)) = (
                    config.keycloak_url.as_deref(),
                    config.keycloak_realm.as_deref(),
                    config.keycloak_client_id.clone(),
                    config.keycloak_client_secret.clone(),
                ) else {
                    anyhow::bail!("keycloak security enabled but endpoint options are missing");
                };
                Ok(Self::Keycloak(KeycloakVerifier::new(url, realm, client_id, client_secret)))
            }
        }
    }

    /// Resolve the user for one request.
    ///
    /// `requested` is the client-supplied id (body over header over query).
    pub async fn resolve(
        &self,
        requested: Option<&str>,
        headers: &HeaderMap,
    ) -> Result<String, GateError> {
        match self {
            Self::Disabled { allow_override } => match requested {
                Some(user) if *allow_override => Ok(user.to_owned()),
                _ => Ok("default".to_owned()),
            },
            Self::Keycloak(verifier) => {
                let token = bearer_token(headers)
                    .ok_or_else(|| GateError::auth("Missing bearer token"))?;
                let subject = verifier.verify(token).await?;
                if let Some(requested) = requested {
                    if requested != subject {
                        return Err(GateError::forbidden(format!(
                            "user_id does not match authenticated identity: {requested}"
                        )));
                    }
                }
                Ok(subject)
            }
        }
    }
}

/// The `user_id` a client asked for, in priority order: body field,
/// `X-User-Id` header, query parameter.
pub fn requested_user_id(
    body: Option<&str>,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Option<String> {
    if let Some(user) = body {
        if !user.is_empty() {
            return Some(user.to_owned());
        }
    }
    if let Some(user) = headers.get("x-user-id").and_then(|v| v.to_str().ok()) {
        if !user.is_empty() {
            return Some(user.to_owned());
        }
    }
    query.filter(|u| !u.is_empty()).map(ToOwned::to_owned)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers.get("authorization").and_then(|v| v.to_str().ok())?.strip_prefix("Bearer ")
}

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    #[serde(default)]
    active: bool,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
}

/// Token introspection client for one Keycloak realm.
pub struct KeycloakVerifier {
    client: reqwest::Client,
    introspect_url: String,
    client_id: String,
    client_secret: String,
}

impl KeycloakVerifier {
    pub fn new(base_url: &str, realm: &str, client_id: String, client_secret: String) -> Self {
        // reqwest is built against rustls with no default provider.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let base = base_url.trim_end_matches('/');
        let introspect_url =
            format!("{base}/realms/{realm}/protocol/openid-connect/token/introspect");
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, introspect_url, client_id, client_secret }
    }

    #[cfg(test)]
    pub(crate) fn introspect_url(&self) -> &str {
        &self.introspect_url
    }

    /// Introspect a bearer token and return the authenticated user id.
    pub async fn verify(&self, token: &str) -> Result<String, GateError> {
        let form = [
            ("token", token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let resp = self
            .client
            .post(&self.introspect_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| GateError::internal(format!("identity provider unreachable: {e}")))?;

        let body: IntrospectionResponse = resp
            .error_for_status()
            .map_err(|e| GateError::internal(format!("identity provider error: {e}")))?
            .json()
            .await
            .map_err(|e| GateError::internal(format!("identity provider response: {e}")))?;

        if !body.active {
            return Err(GateError::auth("Token is not active"));
        }
        body.preferred_username
            .or(body.sub)
            .ok_or_else(|| GateError::auth("Token has no subject"))
    }
}

#[cfg(test)]
#[path = "identity_tests.rs"]
mod tests;
