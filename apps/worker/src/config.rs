use anyhow::{Context, Result};
use dispatch::mailer::SmtpSettings;
use dispatch::pricing::PricingSettings;
use dispatch::storage::S3Settings;
use dispatch::types::GpuClass;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Env {
    pub database_url: String,
    pub redis_url: String,

    pub gpu_class: String,
    pub worker_scratch_dir: String,
    pub aerender_path: String,
    pub ffmpeg_path: String,
    pub render_timeout_minutes: u64,
    pub dequeue_timeout_secs: u64,

    pub min_job_cost_usd: f64,
    pub storage_rate_per_gb_hour: f64,
    pub transfer_rate_per_gb: f64,
    pub upload_mbps: f64,
    pub gpu_rate_per_minute_json: String,
    pub gpu_speed_factor_json: String,

    pub s3_endpoint_url: String,
    pub s3_bucket: String,
    pub s3_region: String,
    pub s3_access_key_id: String,
    pub s3_secret_access_key: String,
    pub s3_force_path_style: bool,
    pub s3_presign_expiry_secs: u64,
    pub s3_sse_algorithm: String,

    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_password: String,
    pub smtp_from: String,
}

impl Default for Env {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            redis_url: "redis://localhost:6379/0".to_string(),
            gpu_class: "rtx4090".to_string(),
            worker_scratch_dir: String::new(),
            aerender_path: "aerender".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            render_timeout_minutes: 120,
            dequeue_timeout_secs: 5,
            min_job_cost_usd: 1.0,
            storage_rate_per_gb_hour: 0.001,
            transfer_rate_per_gb: 0.05,
            upload_mbps: 50.0,
            gpu_rate_per_minute_json: String::new(),
            gpu_speed_factor_json: String::new(),
            s3_endpoint_url: String::new(),
            s3_bucket: "dispatch".to_string(),
            s3_region: "us-east-1".to_string(),
            s3_access_key_id: "minioadmin".to_string(),
            s3_secret_access_key: "minioadmin".to_string(),
            s3_force_path_style: true,
            s3_presign_expiry_secs: 3600,
            s3_sse_algorithm: "AES256".to_string(),
            smtp_host: String::new(),
            smtp_port: 587,
            smtp_user: String::new(),
            smtp_password: String::new(),
            smtp_from: "Render Dispatch <noreply@localhost>".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub db_url: String,
    pub redis_url: String,
    pub gpu_class: GpuClass,
    pub scratch_root: PathBuf,
    pub aerender_path: String,
    pub ffmpeg_path: String,
    pub render_timeout: Duration,
    pub dequeue_timeout_secs: u64,
    pub pricing: PricingSettings,
    pub s3: S3Settings,
    pub smtp: Option<SmtpSettings>,
}

pub fn load_config() -> Result<WorkerConfig> {
    let env: Env = envy::from_env().context("load worker env config")?;

    if env.database_url.trim().is_empty() {
        anyhow::bail!("DATABASE_URL must be set");
    }
    let gpu_class = GpuClass::parse(env.gpu_class.trim())
        .map_err(|e| anyhow::anyhow!("GPU_CLASS: {e}"))?;

    let scratch_root = if env.worker_scratch_dir.trim().is_empty() {
        std::env::temp_dir()
    } else {
        PathBuf::from(env.worker_scratch_dir)
    };

    let pricing = PricingSettings {
        min_job_cost_usd: env.min_job_cost_usd,
        storage_rate_per_gb_hour: env.storage_rate_per_gb_hour,
        transfer_rate_per_gb: env.transfer_rate_per_gb,
        upload_mbps: env.upload_mbps.max(0.1),
        ..PricingSettings::default()
    }
    .with_gpu_overrides(&env.gpu_rate_per_minute_json, &env.gpu_speed_factor_json)?;

    let smtp = if env.smtp_host.trim().is_empty() || env.smtp_user.trim().is_empty() {
        None
    } else {
        Some(SmtpSettings {
            host: env.smtp_host,
            port: env.smtp_port,
            user: env.smtp_user,
            password: env.smtp_password,
            from: env.smtp_from,
        })
    };

    Ok(WorkerConfig {
        db_url: env.database_url,
        redis_url: env.redis_url,
        gpu_class,
        scratch_root,
        aerender_path: env.aerender_path,
        ffmpeg_path: env.ffmpeg_path,
        render_timeout: Duration::from_secs(env.render_timeout_minutes.max(1) * 60),
        dequeue_timeout_secs: env.dequeue_timeout_secs.clamp(1, 60),
        pricing,
        s3: S3Settings {
            endpoint_url: if env.s3_endpoint_url.trim().is_empty() {
                None
            } else {
                Some(env.s3_endpoint_url)
            },
            bucket: env.s3_bucket,
            region: env.s3_region,
            access_key_id: env.s3_access_key_id,
            secret_access_key: env.s3_secret_access_key,
            force_path_style: env.s3_force_path_style,
            presign_expiry: Duration::from_secs(env.s3_presign_expiry_secs.max(60)),
            sse_algorithm: env.s3_sse_algorithm,
        },
        smtp,
    })
}
