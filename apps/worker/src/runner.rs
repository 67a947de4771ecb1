use crate::bundle;
use crate::config::WorkerConfig;
use crate::render::{self, RenderError};
use crate::telemetry::WorkerTelemetry;
use crate::transcode;
use anyhow::{Context, Result};
use dispatch::bus::{Bus, ProgressEvent};
use dispatch::ledger::Ledger;
use dispatch::mailer::{Mailer, NullMailer, SmtpMailer};
use dispatch::pricing::compute_actual_cost;
use dispatch::storage::{ObjectStore, S3Store};
use dispatch::store::{Db, JobRow, current_month};
use dispatch::types::{JobStatus, Preset};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How a job attempt ended, when it did not complete. Transient failures are
/// re-enqueued until attempts run out; everything else is terminal.
enum JobFailure {
    Cancelled,
    Timeout,
    Transient(anyhow::Error),
    Fatal(anyhow::Error),
}

fn transient(err: anyhow::Error) -> JobFailure {
    JobFailure::Transient(err)
}

pub struct Worker {
    cfg: WorkerConfig,
    db: Db,
    ledger: Ledger,
    bus: Bus,
    store: Arc<dyn ObjectStore>,
    mailer: Arc<dyn Mailer>,
    telemetry: WorkerTelemetry,
}

impl Worker {
    pub async fn new(cfg: WorkerConfig, telemetry: WorkerTelemetry) -> Result<Self> {
        let db = Db::connect(&cfg.db_url, 5).await?;
        db.migrate().await?;
        let ledger = Ledger::new(db.pool().clone());
        let bus = Bus::connect(&cfg.redis_url).await?;
        let store: Arc<dyn ObjectStore> = Arc::new(S3Store::connect(&cfg.s3).await?);
        let mailer: Arc<dyn Mailer> = match &cfg.smtp {
            Some(smtp) => Arc::new(SmtpMailer::new(smtp)?),
            None => Arc::new(NullMailer),
        };
        Ok(Self {
            cfg,
            db,
            ledger,
            bus,
            store,
            mailer,
            telemetry,
        })
    }

    /// Forever loop: blocking-pop the class queue, run one job at a time.
    /// The pop timeout doubles as the shutdown check interval.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(gpu_class = self.cfg.gpu_class.as_str(), "worker ready");
        loop {
            if shutdown.is_cancelled() {
                tracing::info!("shutdown");
                return Ok(());
            }
            let popped = tokio::select! {
                _ = shutdown.cancelled() => continue,
                res = self.bus.dequeue(self.cfg.gpu_class, self.cfg.dequeue_timeout_secs) => res,
            };
            let job_id = match popped {
                Ok(Some(job_id)) => job_id,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(err = %err, "dequeue failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            let started = Instant::now();
            match self.process(job_id).await {
                Ok(()) => self.telemetry.job_ok(
                    self.cfg.gpu_class.as_str(),
                    started.elapsed().as_millis() as u64,
                ),
                Err(err) => {
                    self.telemetry.job_err(
                        self.cfg.gpu_class.as_str(),
                        started.elapsed().as_millis() as u64,
                    );
                    tracing::warn!(err = %err, %job_id, "job processing failed");
                }
            }
        }
    }

    async fn process(&self, job_id: Uuid) -> Result<()> {
        let Some(job) = self.db.job(job_id).await? else {
            tracing::debug!(%job_id, "dequeued unknown job; skipping");
            return Ok(());
        };
        if job.status != JobStatus::Queued.as_db_str() {
            tracing::debug!(%job_id, status = %job.status, "job not queued; skipping");
            return Ok(());
        }

        let scratch = self.cfg.scratch_root.join(format!("render-{job_id}"));
        if scratch.exists() {
            let _ = tokio::fs::remove_dir_all(&scratch).await;
        }
        tokio::fs::create_dir_all(&scratch)
            .await
            .context("create scratch directory")?;

        let outcome = self.handle(&job, &scratch).await;
        let res = self.conclude(&job, outcome).await;

        let _ = tokio::fs::remove_dir_all(&scratch).await;
        res
    }

    /// The happy-path pipeline; any early return feeds `conclude`.
    async fn handle(&self, job: &JobRow, scratch: &Path) -> std::result::Result<(), JobFailure> {
        self.transition(job.id, JobStatus::Downloading, "Downloading bundle", 10.0)
            .await
            .map_err(JobFailure::Fatal)?;

        let bundle_path = scratch.join("bundle.zip");
        self.store
            .get_file(&job.bundle_key, &bundle_path)
            .await
            .context("download bundle")
            .map_err(transient)?;

        if !dispatch::types::is_sentinel_sha256(&job.bundle_sha256) {
            let digest = bundle::sha256_file(&bundle_path).await.map_err(transient)?;
            if digest != job.bundle_sha256 {
                return Err(transient(anyhow::anyhow!("Bundle checksum mismatch")));
            }
        }

        self.transition(job.id, JobStatus::Validating, "Validating bundle", 20.0)
            .await
            .map_err(JobFailure::Fatal)?;
        bundle::extract_zip(&bundle_path, scratch)
            .await
            .map_err(transient)?;
        let (bundle_manifest, project_path) =
            bundle::validate_bundle(scratch).map_err(transient)?;

        let output_dir = scratch.join("output");
        tokio::fs::create_dir_all(&output_dir)
            .await
            .context("create output directory")
            .map_err(JobFailure::Fatal)?;
        let intermediate_path = output_dir.join("render.mov");

        self.transition(job.id, JobStatus::Rendering, "Rendering", 30.0)
            .await
            .map_err(JobFailure::Fatal)?;
        let render_started = Instant::now();
        let cmd = render::render_command(
            &self.cfg.aerender_path,
            &project_path,
            &bundle_manifest.composition.name,
            &intermediate_path,
        );
        match render::run_render(&self.db, &self.bus, job.id, cmd, self.cfg.render_timeout).await {
            Ok(()) => {}
            Err(RenderError::Cancelled) => return Err(JobFailure::Cancelled),
            Err(RenderError::Timeout) => return Err(JobFailure::Timeout),
            Err(RenderError::Failed(err)) => return Err(transient(err)),
        }
        self.telemetry
            .render_ms(render_started.elapsed().as_millis() as u64);

        self.transition(job.id, JobStatus::Packaging, "Transcoding", 85.0)
            .await
            .map_err(JobFailure::Fatal)?;
        let preset = Preset::parse(&job.preset)
            .map_err(|e| JobFailure::Fatal(anyhow::anyhow!("{e}")))?;
        let custom_options = job.custom_options().map_err(JobFailure::Fatal)?;
        let plan = transcode::plan_transcode(
            &intermediate_path,
            preset,
            custom_options.as_ref(),
            &output_dir,
            &job.output_name,
        );
        transcode::run_transcode(&self.cfg.ffmpeg_path, &plan)
            .await
            .map_err(transient)?;

        self.transition(job.id, JobStatus::Uploading, "Uploading render", 92.0)
            .await
            .map_err(JobFailure::Fatal)?;
        let filename = plan
            .output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| job.output_name.clone());
        let result_key = format!("results/{}/{}/{filename}", job.user_id, job.id);
        self.store
            .put_file(&plan.output_path, &result_key)
            .await
            .context("upload result")
            .map_err(transient)?;

        self.finalize(job, preset, &result_key, &filename)
            .await
            .map_err(JobFailure::Fatal)
    }

    /// Completion bookkeeping: final cost, settlement, usage, cache entry,
    /// terminal event, optional notification.
    async fn finalize(
        &self,
        job: &JobRow,
        preset: Preset,
        result_key: &str,
        filename: &str,
    ) -> Result<()> {
        // Re-read for the render start stamp written by the RENDERING
        // transition; the local row predates it.
        let fresh = self
            .db
            .job(job.id)
            .await?
            .context("job row vanished mid-flight")?;
        let started_at = fresh.started_at.unwrap_or_else(chrono::Utc::now);
        let elapsed_minutes =
            (chrono::Utc::now() - started_at).num_seconds() as f64 / 60.0;
        let billed_minutes = elapsed_minutes.max(1.0);

        let manifest = job.manifest()?;
        let custom_options = job.custom_options()?;
        let actual_cost = compute_actual_cost(
            &self.cfg.pricing,
            &manifest,
            preset,
            job.bundle_size_bytes,
            billed_minutes,
            custom_options.as_ref(),
        );

        self.db
            .complete_job(job.id, result_key, filename, actual_cost)
            .await?;
        self.db
            .append_job_event(job.id, "COMPLETED", "Completed", None)
            .await?;
        self.bus
            .publish_progress(ProgressEvent::new(job.id, JobStatus::Completed, 100.0))
            .await?;

        self.ledger
            .settle(job.id, actual_cost)
            .await
            .map_err(|e| anyhow::anyhow!("settle credits: {e}"))?;
        self.db
            .add_month_usage(job.user_id, &current_month(), actual_cost, billed_minutes)
            .await?;

        self.telemetry.cache_write();
        self.db
            .cache_insert_if_absent(&job.manifest_hash, &job.preset, result_key, filename)
            .await?;

        if let Some(to) = job.notification_email.clone() {
            let url = self.store.presign_get(result_key).await?;
            let mailer = self.mailer.clone();
            tokio::spawn(async move {
                if let Err(err) = mailer
                    .send(
                        &to,
                        "Render complete",
                        &format!("Your render is ready: {url}"),
                    )
                    .await
                {
                    tracing::warn!(err = %err, "completion email failed");
                }
            });
        }
        Ok(())
    }

    /// Routes a finished attempt to its terminal or retry path.
    async fn conclude(
        &self,
        job: &JobRow,
        outcome: std::result::Result<(), JobFailure>,
    ) -> Result<()> {
        match outcome {
            Ok(()) => Ok(()),
            Err(JobFailure::Cancelled) => {
                self.telemetry.cancelled();
                self.finish(
                    job.id,
                    JobStatus::Cancelled,
                    "Render cancelled by user",
                    None,
                )
                .await?;
                self.ledger
                    .void(job.id, "cancelled")
                    .await
                    .map_err(|e| anyhow::anyhow!("void reservation: {e}"))?;
                Ok(())
            }
            Err(JobFailure::Timeout) => {
                self.telemetry.timed_out();
                self.finish(
                    job.id,
                    JobStatus::Failed,
                    "Render timed out",
                    Some("Render timeout"),
                )
                .await?;
                self.ledger
                    .void(job.id, "failed")
                    .await
                    .map_err(|e| anyhow::anyhow!("void reservation: {e}"))?;
                Ok(())
            }
            Err(JobFailure::Transient(err)) => {
                let (attempts, max_attempts) = self.db.bump_job_attempts(job.id).await?;
                if attempts < max_attempts {
                    self.telemetry.retry();
                    tracing::info!(
                        job_id = %job.id,
                        attempts,
                        err = %err,
                        "transient failure; re-enqueueing"
                    );
                    self.db.requeue_job(job.id).await?;
                    self.db
                        .append_job_event(
                            job.id,
                            "QUEUED",
                            &format!("Retrying ({attempts})"),
                            None,
                        )
                        .await?;
                    self.bus
                        .publish_progress(ProgressEvent::new(job.id, JobStatus::Queued, 10.0))
                        .await?;
                    let gpu_class = dispatch::types::GpuClass::parse(&job.gpu_class)
                        .map_err(|e| anyhow::anyhow!("{e}"))?;
                    self.bus.enqueue(job.id, gpu_class).await?;
                    return Ok(());
                }
                self.finish(
                    job.id,
                    JobStatus::Failed,
                    "Render failed",
                    Some(&err.to_string()),
                )
                .await?;
                self.ledger
                    .void(job.id, "failed")
                    .await
                    .map_err(|e| anyhow::anyhow!("void reservation: {e}"))?;
                Ok(())
            }
            Err(JobFailure::Fatal(err)) => {
                tracing::error!(job_id = %job.id, err = %err, "fatal job failure");
                self.finish(
                    job.id,
                    JobStatus::Failed,
                    "Unhandled error",
                    Some(&err.to_string()),
                )
                .await?;
                self.ledger
                    .void(job.id, "failed")
                    .await
                    .map_err(|e| anyhow::anyhow!("void reservation: {e}"))?;
                Ok(())
            }
        }
    }

    /// Non-terminal lifecycle step: persist, log the event, publish progress.
    async fn transition(
        &self,
        job_id: Uuid,
        status: JobStatus,
        message: &str,
        progress: f64,
    ) -> Result<()> {
        let stored = self.db.advance_job(job_id, status, progress, None).await?;
        self.db
            .append_job_event(job_id, status.as_db_str(), message, None)
            .await?;
        self.bus
            .publish_progress(ProgressEvent::new(job_id, status, stored))
            .await?;
        Ok(())
    }

    /// Terminal step: FAILED and CANCELLED publish progress 0.
    async fn finish(
        &self,
        job_id: Uuid,
        status: JobStatus,
        message: &str,
        error: Option<&str>,
    ) -> Result<()> {
        self.db.finish_job(job_id, status, 0.0, error).await?;
        self.db
            .append_job_event(job_id, status.as_db_str(), message, None)
            .await?;
        self.bus
            .publish_progress(
                ProgressEvent::new(job_id, status, 0.0)
                    .with_error(error.map(str::to_string)),
            )
            .await?;
        Ok(())
    }
}
