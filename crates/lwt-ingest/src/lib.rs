//! Ingestion pipeline shared by the webhook and backfill channels, the
//! HeyReach campaign-list client, and the backfill scanner.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lwt_adapters::{
    delivery_from_campaign_lead, is_connection_accepted, leads_from_page, parse_webhook,
    resolve_identity, total_pages, Delivery, ValidationError,
};
use lwt_core::ProspectStatus;
use lwt_storage::{
    append_event, apply_status, upsert_prospect, ReobservationPolicy, Store, StoreError,
    UpsertOutcome,
};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lwt-ingest";

/// Leads requested per campaign-list page.
pub const PAGE_LIMIT: u32 = 100;

/// Which channel a delivery arrived on. The channels share the pipeline but
/// differ in how a connected prospect's re-observation is handled: the live
/// webhook keeps appending to the audit trail, the backfill poll skips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestSource {
    Webhook,
    Backfill,
}

impl IngestSource {
    fn reobservation_policy(self) -> ReobservationPolicy {
        match self {
            IngestSource::Webhook => ReobservationPolicy::Record,
            IngestSource::Backfill => ReobservationPolicy::Skip,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What one pipeline run did, for caller-side counting.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessOutcome {
    pub prospect_id: Option<i64>,
    pub created: bool,
    pub merged: bool,
    pub event_recorded: bool,
    pub status_changed: bool,
    pub already_satisfied: bool,
}

/// Run one delivery through the full pipeline: parse, resolve identity,
/// then merge + append + reconcile inside a single transaction.
pub async fn process(
    store: &Store,
    raw_payload: &str,
    source: IngestSource,
) -> Result<ProcessOutcome, PipelineError> {
    let delivery = match source {
        IngestSource::Webhook => parse_webhook(raw_payload)?,
        IngestSource::Backfill => {
            let value: JsonValue = serde_json::from_str(raw_payload).map_err(ValidationError::from)?;
            let mut delivery = delivery_from_campaign_lead(&value);
            // Keep the caller's bytes verbatim rather than the re-serialized value.
            delivery.raw_payload = raw_payload.to_string();
            delivery
        }
    };
    process_delivery(store, &delivery, source).await
}

pub async fn process_delivery(
    store: &Store,
    delivery: &Delivery,
    source: IngestSource,
) -> Result<ProcessOutcome, PipelineError> {
    let identity = resolve_identity(&delivery.lead)?;

    let mut tx = store.begin().await?;
    let (mut prospect, outcome) = upsert_prospect(
        &mut tx,
        &identity,
        &delivery.lead.fields,
        &delivery.event_type,
        source.reobservation_policy(),
    )
    .await?;

    if outcome == UpsertOutcome::AlreadySatisfied {
        tx.commit().await.map_err(StoreError::from)?;
        return Ok(ProcessOutcome {
            prospect_id: Some(prospect.id),
            already_satisfied: true,
            ..ProcessOutcome::default()
        });
    }

    append_event(
        &mut tx,
        Some(prospect.id),
        &delivery.event_type,
        delivery.lead.upstream_id.as_deref(),
        &delivery.raw_payload,
    )
    .await?;
    let status_changed = apply_status(&mut tx, &mut prospect, &delivery.event_type).await?;
    tx.commit().await.map_err(StoreError::from)?;

    debug!(
        event_type = %delivery.event_type,
        prospect_id = prospect.id,
        status_changed,
        "processed delivery"
    );
    Ok(ProcessOutcome {
        prospect_id: Some(prospect.id),
        created: outcome == UpsertOutcome::Created,
        merged: outcome == UpsertOutcome::Updated,
        event_recorded: true,
        status_changed,
        already_satisfied: false,
    })
}

/// Dry-run variant: parse and resolve identity, then a read-only status
/// lookup so reruns can still be classified. Writes nothing.
#[derive(Debug, Clone)]
pub struct DryRunOutcome {
    pub identity: String,
    pub already_connected: bool,
}

pub async fn dry_run_delivery(
    store: &Store,
    delivery: &Delivery,
) -> Result<DryRunOutcome, PipelineError> {
    let identity = resolve_identity(&delivery.lead)?;
    let existing = store.prospect_status_by_url(&identity).await?;
    let already_connected = matches!(existing, Some((_, ProspectStatus::Connected)));
    Ok(DryRunOutcome {
        identity,
        already_connected,
    })
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to HeyReach failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("HeyReach returned HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Source of campaign-list pages. The HTTP client implements this; tests
/// substitute canned pages.
#[async_trait]
pub trait CampaignLeadSource: Send + Sync {
    async fn fetch_page(
        &self,
        campaign_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<JsonValue, TransportError>;
}

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    pub api_key: String,
    pub base_url: String,
    pub campaign_id: Option<String>,
    pub http_timeout_secs: u64,
}

impl BackfillConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("HEYREACH_API_KEY").unwrap_or_default(),
            base_url: std::env::var("HEYREACH_API_BASE_URL")
                .unwrap_or_else(|_| "https://api.heyreach.io/api/public".to_string()),
            campaign_id: std::env::var("HEYREACH_CAMPAIGN_ID").ok().filter(|v| !v.is_empty()),
            http_timeout_secs: std::env::var("HEYREACH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HeyReachClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HeyReachClient {
    pub fn new(config: &BackfillConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl CampaignLeadSource for HeyReachClient {
    async fn fetch_page(
        &self,
        campaign_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<JsonValue, TransportError> {
        let url = format!("{}/campaign/GetLeadsForCampaign", self.base_url);
        debug!(campaign_id, page, "fetching campaign leads page");
        let response = self
            .http
            .get(&url)
            .header("X-API-KEY", &self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(&[
                ("campaignId", campaign_id),
                ("page", &page.to_string()),
                ("limit", &limit.to_string()),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response.json().await?)
    }
}

/// Page through the campaign list until an empty page, the total-page
/// marker is exhausted, or a short page arrives, whichever first. Upstream
/// pagination metadata is not reliable enough to trust any single signal.
pub async fn fetch_all_campaign_leads(
    source: &dyn CampaignLeadSource,
    campaign_id: &str,
) -> Result<Vec<JsonValue>, TransportError> {
    let mut all = Vec::new();
    let mut page = 1u32;
    loop {
        let result = source.fetch_page(campaign_id, page, PAGE_LIMIT).await?;
        let leads = leads_from_page(&result);
        if leads.is_empty() {
            break;
        }
        let fetched = leads.len();
        all.extend(leads);
        info!(page, fetched, total = all.len(), "fetched campaign leads page");

        if let Some(total) = total_pages(&result) {
            if u64::from(page) >= total {
                break;
            }
        }
        if fetched < PAGE_LIMIT as usize {
            break;
        }
        page += 1;
    }
    Ok(all)
}

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct BackfillSummary {
    pub run_id: Uuid,
    pub campaign_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_leads: usize,
    pub accepted: usize,
    pub backfilled: usize,
    pub already_existed: usize,
    pub dry_run: bool,
}

/// Replay accepted connections from one campaign into the ledger. The full
/// lead set is accumulated before any store transaction opens, so a
/// transport failure mid-fetch aborts the run with nothing written.
pub async fn run_backfill(
    store: &Store,
    source: &dyn CampaignLeadSource,
    campaign_id: &str,
    dry_run: bool,
) -> Result<BackfillSummary, BackfillError> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!(%run_id, campaign_id, dry_run, "starting backfill run");

    let leads = fetch_all_campaign_leads(source, campaign_id).await?;
    let accepted: Vec<&JsonValue> = leads.iter().filter(|lead| is_connection_accepted(lead)).collect();
    info!(
        total = leads.len(),
        accepted = accepted.len(),
        "scanned campaign leads"
    );

    let mut backfilled = 0usize;
    let mut already_existed = 0usize;
    for lead in &accepted {
        let delivery = delivery_from_campaign_lead(lead);
        if dry_run {
            match dry_run_delivery(store, &delivery).await {
                Ok(outcome) if outcome.already_connected => already_existed += 1,
                Ok(outcome) => {
                    info!(identity = %outcome.identity, "dry run: would backfill lead");
                    backfilled += 1;
                }
                Err(PipelineError::Validation(err)) => {
                    warn!(%err, "skipping malformed campaign lead");
                }
                Err(PipelineError::Store(err)) => return Err(err.into()),
            }
            continue;
        }
        match process_delivery(store, &delivery, IngestSource::Backfill).await {
            Ok(outcome) if outcome.already_satisfied => already_existed += 1,
            Ok(outcome) => {
                info!(prospect_id = ?outcome.prospect_id, "backfilled lead");
                backfilled += 1;
            }
            Err(PipelineError::Validation(err)) => {
                warn!(%err, "skipping malformed campaign lead");
            }
            Err(PipelineError::Store(err)) => return Err(err.into()),
        }
    }

    Ok(BackfillSummary {
        run_id,
        campaign_id: campaign_id.to_string(),
        started_at,
        finished_at: Utc::now(),
        total_leads: leads.len(),
        accepted: accepted.len(),
        backfilled,
        already_existed,
        dry_run,
    })
}
