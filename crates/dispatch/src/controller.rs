use crate::bus::{Bus, ProgressEvent};
use crate::error::{Error, Result};
use crate::ledger::Ledger;
use crate::mailer::Mailer;
use crate::manifest::{Manifest, check_manifest, hash_manifest};
use crate::pricing::{PricingSettings, estimate_cost};
use crate::storage::ObjectStore;
use crate::store::{Db, NewJob, UserRow, current_month};
use crate::types::{CustomOptions, GpuClass, JobStatus, Preset};
use crate::webhook::LemonSettings;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimateRequest {
    pub manifest: Manifest,
    pub preset: String,
    pub bundle_key: String,
    #[serde(default)]
    pub custom_options: Option<CustomOptions>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimateResponse {
    pub cost_usd: f64,
    pub eta_seconds: i64,
    pub gpu_class: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTicketRequest {
    pub bundle_sha256: String,
    pub bundle_size_bytes: i64,
    pub project_hash: String,
    pub manifest_hash: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTicketResponse {
    pub upload_url: String,
    pub bundle_key: String,
    pub headers: HashMap<String, String>,
}

fn default_allow_cache() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub bundle_key: String,
    pub bundle_sha256: String,
    pub bundle_size_bytes: i64,
    pub manifest_hash: String,
    pub manifest: Manifest,
    pub preset: String,
    #[serde(default = "default_allow_cache")]
    pub allow_cache: bool,
    pub output_name: String,
    #[serde(default)]
    pub notification_email: Option<String>,
    #[serde(default)]
    pub custom_options: Option<CustomOptions>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub status: String,
    pub cost_usd: f64,
    pub eta_seconds: i64,
    pub ws_url: String,
    pub dashboard_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: String,
    pub progress_percent: f64,
    pub eta_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResultResponse {
    pub download_url: String,
    pub filename: String,
    pub size_bytes: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHistoryEntry {
    pub job_id: Uuid,
    pub status: String,
    pub preset: String,
    pub created_at: String,
    pub cost_usd: f64,
    pub output_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntryView {
    pub entry_type: String,
    pub status: String,
    pub amount_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditsResponse {
    pub posted_balance_usd: f64,
    pub reserved_usd: f64,
    pub available_usd: f64,
    pub ledger: Vec<LedgerEntryView>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditAdjustRequest {
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    pub amount_usd: f64,
    pub reason: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn default_rotate() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyIssueRequest {
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default = "default_rotate")]
    pub rotate: bool,
    #[serde(default)]
    pub create_if_missing: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyIssueResponse {
    pub user_id: Uuid,
    pub email: String,
    pub api_key: String,
    pub api_key_hint: String,
}

#[derive(Debug, Clone)]
pub struct PublicUrls {
    pub api_base_url: String,
    pub dashboard_url: String,
}

/// The submission-side brain: estimates, tickets, submissions, status,
/// results, cancellation, history, credits, and the admin operations.
/// Transport is a thin shell over these methods.
pub struct Controller {
    db: Db,
    ledger: Ledger,
    bus: Bus,
    store: Arc<dyn ObjectStore>,
    mailer: Arc<dyn Mailer>,
    pricing: PricingSettings,
    lemon: LemonSettings,
    urls: PublicUrls,
    max_attempts: i32,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Db,
        ledger: Ledger,
        bus: Bus,
        store: Arc<dyn ObjectStore>,
        mailer: Arc<dyn Mailer>,
        pricing: PricingSettings,
        lemon: LemonSettings,
        urls: PublicUrls,
        max_attempts: i32,
    ) -> Self {
        Self {
            db,
            ledger,
            bus,
            store,
            mailer,
            pricing,
            lemon,
            urls,
            max_attempts,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn mailer(&self) -> &Arc<dyn Mailer> {
        &self.mailer
    }

    pub fn lemon(&self) -> &LemonSettings {
        &self.lemon
    }

    /// Validated estimate against the uploaded bundle's real size.
    pub async fn estimate(
        &self,
        _user: &UserRow,
        req: &EstimateRequest,
    ) -> Result<EstimateResponse> {
        let bundle_size = self
            .store
            .head_object_size(&req.bundle_key)
            .await
            .map_err(|_| Error::validation("Bundle not found in storage"))?;

        let preset = Preset::parse(&req.preset)?;
        let mut est = estimate_cost(
            &self.pricing,
            &req.manifest,
            preset,
            bundle_size,
            req.custom_options.as_ref(),
        )?;
        let (compat_warnings, compat_errors) = check_manifest(&req.manifest);
        if !compat_errors.is_empty() {
            return Err(Error::validation(compat_errors.join("; ")));
        }
        est.warnings.extend(compat_warnings);

        Ok(EstimateResponse {
            cost_usd: est.cost_usd,
            eta_seconds: est.eta_seconds,
            gpu_class: est.gpu_class.as_str().to_string(),
            warnings: est.warnings,
        })
    }

    /// Deterministic bundle key plus a presigned PUT for it.
    pub async fn upload_ticket(
        &self,
        user: &UserRow,
        req: &UploadTicketRequest,
    ) -> Result<UploadTicketResponse> {
        let bundle_key = format!("bundles/{}/{}.zip", user.id, req.manifest_hash);
        let (upload_url, headers) = self.store.presign_put(&bundle_key).await?;
        Ok(UploadTicketResponse {
            upload_url,
            bundle_key,
            headers,
        })
    }

    /// Full submission path: integrity check, estimate, caps, cache
    /// short-circuit, then persist → reserve → enqueue in that order.
    pub async fn create(&self, user: &UserRow, req: &CreateJobRequest) -> Result<CreateJobResponse> {
        let manifest_hash =
            hash_manifest(&req.manifest).context("fingerprint submitted manifest")?;
        if manifest_hash != req.manifest_hash {
            return Err(Error::validation("Manifest hash mismatch."));
        }

        let preset = Preset::parse(&req.preset)?;
        let est = estimate_cost(
            &self.pricing,
            &req.manifest,
            preset,
            req.bundle_size_bytes,
            req.custom_options.as_ref(),
        )?;
        let (_, compat_errors) = check_manifest(&req.manifest);
        if !compat_errors.is_empty() {
            return Err(Error::validation(compat_errors.join("; ")));
        }

        self.ensure_usage_caps(user, est.cost_usd).await?;

        let new_job = NewJob {
            id: Uuid::new_v4(),
            user_id: user.id,
            preset: preset.as_str().to_string(),
            gpu_class: est.gpu_class.as_str().to_string(),
            manifest: serde_json::to_value(&req.manifest).context("encode manifest")?,
            custom_options: req
                .custom_options
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .context("encode custom options")?,
            manifest_hash: manifest_hash.clone(),
            project_hash: req.manifest.project.hash.clone(),
            bundle_key: req.bundle_key.clone(),
            bundle_sha256: req.bundle_sha256.clone(),
            bundle_size_bytes: req.bundle_size_bytes,
            output_name: req.output_name.clone(),
            notification_email: req.notification_email.clone(),
            cost_estimate_usd: est.cost_usd,
            eta_seconds: est.eta_seconds,
            max_attempts: self.max_attempts,
        };

        if req.allow_cache {
            if let Some(cache) = self
                .db
                .cache_lookup(&manifest_hash, preset.as_str())
                .await?
            {
                return self.create_from_cache(user, new_job, est.cost_usd, &cache).await;
            }
        }

        self.db.insert_queued_job(&new_job).await?;
        if let Err(err) = self.ledger.reserve(user.id, new_job.id, est.cost_usd).await {
            if matches!(err, Error::Policy(_)) {
                self.db
                    .finish_job(
                        new_job.id,
                        JobStatus::Failed,
                        0.0,
                        Some("Insufficient credits"),
                    )
                    .await?;
            }
            return Err(err);
        }

        self.db
            .append_job_event(new_job.id, "QUEUED", "Job queued", None)
            .await?;
        self.bus
            .publish_progress(ProgressEvent::new(new_job.id, JobStatus::Queued, 0.0))
            .await?;
        self.bus.enqueue(new_job.id, est.gpu_class).await?;

        Ok(CreateJobResponse {
            job_id: new_job.id,
            status: JobStatus::Queued.as_db_str().to_string(),
            cost_usd: est.cost_usd,
            eta_seconds: est.eta_seconds,
            ws_url: self.ws_url(new_job.id),
            dashboard_url: self.dashboard_url(new_job.id),
        })
    }

    async fn create_from_cache(
        &self,
        user: &UserRow,
        new_job: NewJob,
        cost_usd: f64,
        cache: &crate::store::CacheRow,
    ) -> Result<CreateJobResponse> {
        self.db
            .insert_cached_job(&new_job, &cache.result_key, &cache.output_name)
            .await?;
        self.ledger.reserve(user.id, new_job.id, cost_usd).await?;
        self.ledger.settle(new_job.id, cost_usd).await?;
        self.bus
            .publish_progress(ProgressEvent::new(
                new_job.id,
                JobStatus::Completed,
                100.0,
            ))
            .await?;
        Ok(CreateJobResponse {
            job_id: new_job.id,
            status: JobStatus::Completed.as_db_str().to_string(),
            cost_usd,
            eta_seconds: 0,
            ws_url: self.ws_url(new_job.id),
            dashboard_url: self.dashboard_url(new_job.id),
        })
    }

    async fn ensure_usage_caps(&self, user: &UserRow, cost_usd: f64) -> Result<()> {
        if cost_usd > user.per_job_max_usd {
            return Err(Error::policy("Job exceeds per-job max spend."));
        }
        let month_cost = self.db.month_cost_usd(user.id, &current_month()).await?;
        if month_cost + cost_usd > user.monthly_limit_usd {
            return Err(Error::policy("Monthly usage limit exceeded."));
        }
        Ok(())
    }

    pub async fn status(&self, user: &UserRow, job_id: Uuid) -> Result<JobStatusResponse> {
        let job = self
            .db
            .job_owned(job_id, user.id)
            .await?
            .ok_or_else(|| Error::not_found("Job not found"))?;
        Ok(JobStatusResponse {
            job_id: job.id,
            status: job.status.clone(),
            progress_percent: job.progress_percent,
            eta_seconds: job.eta_seconds,
            error_message: job.error_message,
        })
    }

    pub async fn result(&self, user: &UserRow, job_id: Uuid) -> Result<JobResultResponse> {
        let job = self
            .db
            .job_owned(job_id, user.id)
            .await?
            .ok_or_else(|| Error::not_found("Job not found"))?;
        let result_key = match (job.status.as_str(), &job.result_key) {
            ("COMPLETED", Some(key)) => key.clone(),
            _ => return Err(Error::state("Job not complete")),
        };
        let download_url = self.store.presign_get(&result_key).await?;
        let size_bytes = self.store.head_object_size(&result_key).await?;
        Ok(JobResultResponse {
            download_url,
            filename: job.output_name,
            size_bytes,
        })
    }

    /// Cooperative cancellation. Jobs still in the queue are cancelled here;
    /// anything later is flagged for the worker's next checkpoint.
    pub async fn cancel(&self, user: &UserRow, job_id: Uuid) -> Result<()> {
        let job = self
            .db
            .job_owned(job_id, user.id)
            .await?
            .ok_or_else(|| Error::not_found("Job not found"))?;
        self.db.set_cancel_requested(job_id).await?;

        if job.status == JobStatus::Queued.as_db_str()
            && self.db.cancel_job_if_queued(job_id).await?
        {
            let gpu_class = GpuClass::parse(&job.gpu_class)?;
            self.bus.remove(job_id, gpu_class).await?;
            self.ledger.void(job_id, "cancelled").await?;
            self.bus
                .publish_progress(ProgressEvent::new(job_id, JobStatus::Cancelled, 0.0))
                .await?;
        }
        Ok(())
    }

    pub async fn history(&self, user: &UserRow) -> Result<Vec<JobHistoryEntry>> {
        let jobs = self.db.recent_jobs(user.id, 50).await?;
        Ok(jobs
            .into_iter()
            .map(|job| JobHistoryEntry {
                job_id: job.id,
                status: job.status,
                preset: job.preset,
                created_at: job.created_at.to_rfc3339(),
                cost_usd: job.cost_estimate_usd,
                output_name: job.output_name,
            })
            .collect())
    }

    pub async fn credits(&self, user: &UserRow) -> Result<CreditsResponse> {
        let balances = self.ledger.balances(user.id).await?;
        let entries = self.ledger.recent_entries(user.id, 100).await?;
        Ok(CreditsResponse {
            posted_balance_usd: balances.posted_usd,
            reserved_usd: balances.reserved_usd,
            available_usd: balances.available_usd,
            ledger: entries
                .into_iter()
                .map(|entry| LedgerEntryView {
                    entry_type: entry.entry_type,
                    status: entry.status,
                    amount_usd: entry.amount_usd,
                    job_id: entry.job_id,
                    external_id: entry.external_id,
                    created_at: entry.created_at.to_rfc3339(),
                })
                .collect(),
        })
    }

    async fn admin_target(
        &self,
        email: Option<&str>,
        user_id: Option<Uuid>,
    ) -> Result<Option<UserRow>> {
        match (email, user_id) {
            (Some(email), _) => self.db.user_by_email(email).await.map_err(Into::into),
            (None, Some(id)) => self.db.user_by_id(id).await.map_err(Into::into),
            (None, None) => Err(Error::validation("userEmail or userId required")),
        }
    }

    pub async fn admin_adjust_credits(
        &self,
        admin: &UserRow,
        req: &CreditAdjustRequest,
    ) -> Result<()> {
        if !admin.is_admin {
            return Err(Error::forbidden("Admin access required"));
        }
        let target = self
            .admin_target(req.user_email.as_deref(), req.user_id)
            .await?
            .ok_or_else(|| Error::not_found("User not found"))?;
        self.ledger
            .adjust(
                target.id,
                req.amount_usd,
                &req.reason,
                req.idempotency_key.as_deref(),
            )
            .await
    }

    pub async fn admin_issue_api_key(
        &self,
        admin: &UserRow,
        req: &ApiKeyIssueRequest,
    ) -> Result<ApiKeyIssueResponse> {
        if !admin.is_admin {
            return Err(Error::forbidden("Admin access required"));
        }
        let target = self
            .admin_target(req.user_email.as_deref(), req.user_id)
            .await?;

        let Some(target) = target else {
            if !req.create_if_missing {
                return Err(Error::not_found("User not found"));
            }
            let email = req
                .user_email
                .as_deref()
                .ok_or_else(|| Error::validation("userEmail required to create a user"))?;
            let api_key = crate::auth::generate_api_key();
            let hash = crate::auth::hash_api_key(&api_key)?;
            let user = self
                .db
                .insert_user(email, &hash, &crate::auth::api_key_hint(&api_key), false)
                .await?;
            return Ok(ApiKeyIssueResponse {
                user_id: user.id,
                email: user.email,
                api_key,
                api_key_hint: user.api_key_hint,
            });
        };

        if !req.rotate {
            return Err(Error::validation(
                "API key already exists; set rotate=true to rotate",
            ));
        }
        let api_key = crate::auth::generate_api_key();
        let hash = crate::auth::hash_api_key(&api_key)?;
        let hint = crate::auth::api_key_hint(&api_key);
        self.db.rotate_user_api_key(target.id, &hash, &hint).await?;
        Ok(ApiKeyIssueResponse {
            user_id: target.id,
            email: target.email,
            api_key,
            api_key_hint: hint,
        })
    }

    fn ws_url(&self, job_id: Uuid) -> String {
        format!(
            "{}/ws/jobs/{job_id}",
            self.urls.api_base_url.replacen("http", "ws", 1)
        )
    }

    fn dashboard_url(&self, job_id: Uuid) -> String {
        format!("{}?jobId={job_id}", self.urls.dashboard_url)
    }
}
