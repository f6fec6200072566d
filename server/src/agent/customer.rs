//! Customer Directory Seam
//!
//! Resolves a customer record and recent consultation history by phone
//! number when a customer-role peer joins. The lookup protocol stays behind
//! the trait; results are opaque JSON pushed to counselor clients and folded
//! into node prompts.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors from the directory collaborator.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Transport-level failure.
    #[error("directory transport error: {0}")]
    Transport(String),

    /// Endpoint returned a non-success status or malformed body.
    #[error("directory endpoint error: {0}")]
    Endpoint(String),
}

/// Snapshot of customer fields plus recent consultations.
#[derive(Debug, Clone)]
pub struct CustomerContext {
    /// Customer profile fields.
    pub profile: serde_json::Value,
    /// Recent consultation records, newest first.
    pub history: serde_json::Value,
}

/// Customer lookup collaborator.
#[async_trait]
pub trait CustomerDirectory: Send + Sync + 'static {
    /// Resolve a customer and their last `history_limit` consultations.
    async fn lookup_by_phone(
        &self,
        phone_number: &str,
        history_limit: usize,
    ) -> Result<Option<CustomerContext>, DirectoryError>;
}

#[derive(Debug, serde::Deserialize)]
struct LookupResponse {
    customer: Option<serde_json::Value>,
    #[serde(default)]
    consultations: serde_json::Value,
}

/// HTTP directory adapter (`GET {endpoint}/customers`).
pub struct HttpCustomerDirectory {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCustomerDirectory {
    /// Build an adapter for a lookup endpoint.
    pub fn new(endpoint: String) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| DirectoryError::Transport(e.to_string()))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl CustomerDirectory for HttpCustomerDirectory {
    async fn lookup_by_phone(
        &self,
        phone_number: &str,
        history_limit: usize,
    ) -> Result<Option<CustomerContext>, DirectoryError> {
        let response = self
            .client
            .get(format!("{}/customers", self.endpoint))
            .query(&[
                ("phone", phone_number),
                ("history_limit", &history_limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| DirectoryError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DirectoryError::Endpoint(format!(
                "status {}",
                response.status()
            )));
        }

        let parsed: LookupResponse = response
            .json()
            .await
            .map_err(|e| DirectoryError::Endpoint(e.to_string()))?;

        Ok(parsed.customer.map(|profile| CustomerContext {
            profile,
            history: parsed.consultations,
        }))
    }
}

/// Stand-in when no endpoint is configured: every lookup misses.
pub struct UnconfiguredCustomerDirectory;

#[async_trait]
impl CustomerDirectory for UnconfiguredCustomerDirectory {
    async fn lookup_by_phone(
        &self,
        _phone_number: &str,
        _history_limit: usize,
    ) -> Result<Option<CustomerContext>, DirectoryError> {
        Ok(None)
    }
}
