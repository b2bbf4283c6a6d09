use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::json;
use tracing::debug;

use crate::core::{
    domain::ContinuationToken,
    error::{Error as CoreError, Result as CoreResult},
    marker,
    ports::ExpenseGateway,
};

/// Calls a remote expense service over HTTP and decodes its marker replies.
#[derive(Debug, Clone)]
pub struct HttpExpenseGateway {
    client: Client,
    base_url: String,
}

impl HttpExpenseGateway {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client for expense gateway")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// Connection failures and 5xx replies are transient; everything else is
/// decided by the body's marker.
async fn read_marker(response: reqwest::Result<Response>) -> CoreResult<()> {
    let response = response.map_err(|e| CoreError::Transient(e.to_string()))?;
    let status = response.status();
    if status.is_server_error() {
        return Err(CoreError::Transient(format!("expense service returned {status}")));
    }
    let body = response
        .text()
        .await
        .map_err(|e| CoreError::Transient(e.to_string()))?;
    debug!(%status, body = body.trim(), "Expense service replied");
    marker::parse(&body)
}

#[async_trait]
impl ExpenseGateway for HttpExpenseGateway {
    async fn create_expense(&self, id: &str) -> CoreResult<()> {
        let response = self
            .client
            .post(self.url("/v1/expenses"))
            .json(&json!({ "id": id }))
            .send()
            .await;
        read_marker(response).await
    }

    async fn register_callback(&self, id: &str, token: &ContinuationToken) -> CoreResult<()> {
        let response = self
            .client
            .post(self.url(&format!("/v1/workflow/registerCallback/{id}")))
            .form(&[("task_token", token.to_string())])
            .send()
            .await;
        read_marker(response).await
    }

    async fn request_payment(&self, id: &str) -> CoreResult<()> {
        let response = self
            .client
            .get(self.url(&format!("/v1/expenses/{id}/payment")))
            .send()
            .await;
        read_marker(response).await
    }
}
