//! Source adapter boundary for the snapshot archive.
//!
//! This crate owns the adapter abstraction and the production REST
//! implementation. It does **not** write to the DB; the compute service is
//! expected to push the resulting snapshot into the archive's accept
//! endpoint itself, and the orchestrator only records the outcome.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use arx_schemas::invoice_number;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Errors a [`SourceAdapter`] may return. The orchestrator maps these onto
/// per-account outcome kinds; only `RosterUnavailable` aborts a whole run.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The roster service could not be reached or answered with an error.
    /// Fatal to a run: without a roster there is nothing to iterate.
    #[error("roster unavailable: {0}")]
    RosterUnavailable(String),

    /// The period was already archived. Benign; recorded distinctly.
    #[error("period already archived: {invoice_number}")]
    Duplicate { invoice_number: String },

    /// The compute service answered, but billing computation failed for this
    /// account. Isolated to the account.
    #[error("billing compute failed: {0}")]
    ComputeFailed(String),

    /// The compute service was unreachable for this account. Isolated to the
    /// account (a single attempt per run; the next scheduled run retries).
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Returned by a successful compute-and-accept call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptReceipt {
    pub invoice_number: String,
}

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

/// External collaborator supplying the account roster and per-account
/// billing computation.
///
/// Implementations must be object-safe (`Arc<dyn SourceAdapter>`) and
/// `Send + Sync` so the orchestrator can fan work out across tasks.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Human-readable name identifying this adapter (e.g. `"rest"`).
    fn name(&self) -> &'static str;

    /// Fetch the roster of billable account identifiers, in the order the
    /// upstream returns them. That order is the processing order of a run.
    async fn list_billable_accounts(&self) -> Result<Vec<String>, SourceError>;

    /// Compute the billing snapshot for one account/period and accept it
    /// into the archive. One attempt per call; the adapter performs the
    /// repository write on success.
    async fn compute_and_accept(
        &self,
        account: &str,
        year: i32,
        month: i32,
    ) -> Result<AcceptReceipt, SourceError>;
}

// ---------------------------------------------------------------------------
// REST implementation
// ---------------------------------------------------------------------------

pub const ENV_ROSTER_URL: &str = "ARX_ROSTER_URL";
pub const ENV_COMPUTE_URL: &str = "ARX_COMPUTE_URL";

/// Production adapter talking to the company-directory service (roster) and
/// the billing-compute service over HTTP.
#[derive(Debug, Clone)]
pub struct RestSourceAdapter {
    http: reqwest::Client,
    roster_base: String,
    compute_base: String,
}

impl RestSourceAdapter {
    pub fn new(roster_base: String, compute_base: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            roster_base,
            compute_base,
        }
    }

    /// Build from ARX_ROSTER_URL / ARX_COMPUTE_URL.
    pub fn from_env() -> anyhow::Result<Self> {
        let roster = std::env::var(ENV_ROSTER_URL)
            .map_err(|_| anyhow::anyhow!("missing env var {ENV_ROSTER_URL}"))?;
        let compute = std::env::var(ENV_COMPUTE_URL)
            .map_err(|_| anyhow::anyhow!("missing env var {ENV_COMPUTE_URL}"))?;
        Ok(Self::new(roster, compute))
    }

    fn roster_url(&self) -> String {
        format!("{}/api/companies", self.roster_base.trim_end_matches('/'))
    }

    fn accept_url(&self) -> String {
        format!(
            "{}/api/bill/accept",
            self.compute_base.trim_end_matches('/')
        )
    }
}

#[derive(Debug, Deserialize)]
struct CompanyRow {
    account_number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AcceptResponse {
    invoice_number: Option<String>,
}

#[async_trait]
impl SourceAdapter for RestSourceAdapter {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn list_billable_accounts(&self) -> Result<Vec<String>, SourceError> {
        let resp = self
            .http
            .get(self.roster_url())
            .send()
            .await
            .map_err(|e| SourceError::RosterUnavailable(format!("roster request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SourceError::RosterUnavailable(format!(
                "roster service returned status {}",
                status.as_u16()
            )));
        }

        let companies: Vec<CompanyRow> = resp.json().await.map_err(|e| {
            SourceError::RosterUnavailable(format!("roster response decode failed: {e}"))
        })?;

        // Rows without an account number are skipped; order is preserved.
        Ok(companies
            .into_iter()
            .filter_map(|c| c.account_number)
            .collect())
    }

    async fn compute_and_accept(
        &self,
        account: &str,
        year: i32,
        month: i32,
    ) -> Result<AcceptReceipt, SourceError> {
        let payload = serde_json::json!({
            "account_number": account,
            "year": year,
            "month": month,
        });

        let resp = self
            .http
            .post(self.accept_url())
            .json(&payload)
            .send()
            .await
            .map_err(|e| SourceError::Transport(format!("compute request failed: {e}")))?;

        let status = resp.status();

        if status.as_u16() == 409 {
            return Err(SourceError::Duplicate {
                invoice_number: invoice_number(account, year, month),
            });
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SourceError::ComputeFailed(format!(
                "status {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }

        let body: AcceptResponse = resp.json().await.map_err(|e| {
            SourceError::ComputeFailed(format!("accept response decode failed: {e}"))
        })?;

        Ok(AcceptReceipt {
            invoice_number: body
                .invoice_number
                .unwrap_or_else(|| invoice_number(account, year, month)),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests (no network — httpmock)
// ---------------------------------------------------------------------------
