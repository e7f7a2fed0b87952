//! External approvals over a small HTTP API.
//!
//! `POST {base}/approvals` creates an approval and answers
//! `{"instanceCode": "..."}`, `GET {base}/approvals/{code}` answers
//! `{"status": "pending" | "approved" | "rejected"}`, and
//! `POST {base}/approvals/{code}/cancel` withdraws it.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use strata_core::approval::{ApprovalRequest, CancelReason, ExternalApprovalStatus};
use strata_core::ports::ExternalApprovalProvider;
use strata_core::{Error, Result};
use tracing::debug;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedApproval {
    instance_code: String,
}

#[derive(Debug, Deserialize)]
struct ApprovalState {
    status: ExternalApprovalStatus,
}

pub struct HttpApprovalProvider {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpApprovalProvider {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| Error::ApprovalProvider(format!("invalid base url {base_url}: {e}")))?;
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::ApprovalProvider(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::ApprovalProvider(format!("invalid path {path}: {e}")))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ApprovalProvider(format!(
                "approval service returned {status}: {body}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl ExternalApprovalProvider for HttpApprovalProvider {
    async fn create_approval(&self, request: &ApprovalRequest) -> Result<String> {
        let response = self
            .send(self.client.post(self.url("approvals")?).json(request))
            .await?;
        let created: CreatedApproval = response
            .json()
            .await
            .map_err(|e| Error::ApprovalProvider(format!("malformed create response: {e}")))?;
        debug!(instance_code = %created.instance_code, issue = %request.issue_name, "Approval created");
        Ok(created.instance_code)
    }

    async fn get_approval_status(&self, instance_code: &str) -> Result<ExternalApprovalStatus> {
        let response = self
            .send(self.client.get(self.url(&format!("approvals/{instance_code}"))?))
            .await?;
        let state: ApprovalState = response
            .json()
            .await
            .map_err(|e| Error::ApprovalProvider(format!("malformed status response: {e}")))?;
        Ok(state.status)
    }

    async fn cancel_approval(&self, instance_code: &str, reason: CancelReason) -> Result<()> {
        let body = serde_json::json!({
            "reason": reason.as_str(),
            "message": reason.message(),
        });
        self.send(
            self.client
                .post(self.url(&format!("approvals/{instance_code}/cancel"))?)
                .json(&body),
        )
        .await?;
        debug!(instance_code, reason = reason.as_str(), "Approval canceled");
        Ok(())
    }
}
