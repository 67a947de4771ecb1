use anyhow::{Context, Result};
use dispatch::controller::PublicUrls;
use dispatch::mailer::SmtpSettings;
use dispatch::pricing::PricingSettings;
use dispatch::storage::S3Settings;
use dispatch::webhook::LemonSettings;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Env {
    pub database_url: String,
    pub redis_url: String,

    pub gateway_bind_addr: String,
    pub api_base_url: String,
    pub dashboard_url: String,

    pub jwt_secret: String,
    pub jwt_ttl_secs: i64,

    pub bootstrap_admin_email: String,
    pub bootstrap_api_key: String,

    pub max_retry_attempts: i32,

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

    pub lemon_webhook_secret: String,
    pub lemon_variant_credits_json: String,
    pub lemon_auto_create_users: bool,
}

impl Default for Env {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            redis_url: "redis://localhost:6379/0".to_string(),
            gateway_bind_addr: "0.0.0.0:8000".to_string(),
            api_base_url: "http://localhost:8000".to_string(),
            dashboard_url: "http://localhost:8000/dashboard".to_string(),
            jwt_secret: "change-me".to_string(),
            jwt_ttl_secs: 60 * 60 * 24 * 7,
            bootstrap_admin_email: "admin@localhost".to_string(),
            bootstrap_api_key: "dispatch-dev-key".to_string(),
            max_retry_attempts: 3,
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
            lemon_webhook_secret: String::new(),
            lemon_variant_credits_json: String::new(),
            lemon_auto_create_users: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JwtSettings {
    pub secret: String,
    pub ttl_secs: i64,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub db_url: String,
    pub redis_url: String,
    pub bind_addr: String,
    pub urls: PublicUrls,
    pub jwt: JwtSettings,
    pub bootstrap_admin_email: String,
    pub bootstrap_api_key: String,
    pub max_attempts: i32,
    pub pricing: PricingSettings,
    pub s3: S3Settings,
    pub smtp: Option<SmtpSettings>,
    pub lemon: LemonSettings,
}

pub fn load_config() -> Result<GatewayConfig> {
    let env: Env = envy::from_env().context("load gateway env config")?;

    if env.database_url.trim().is_empty() {
        anyhow::bail!("DATABASE_URL must be set");
    }

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

    let variant_credits: HashMap<String, f64> =
        if env.lemon_variant_credits_json.trim().is_empty() {
            HashMap::new()
        } else {
            serde_json::from_str(&env.lemon_variant_credits_json)
                .context("parse LEMON_VARIANT_CREDITS_JSON")?
        };

    Ok(GatewayConfig {
        db_url: env.database_url,
        redis_url: env.redis_url,
        bind_addr: env.gateway_bind_addr,
        urls: PublicUrls {
            api_base_url: env.api_base_url,
            dashboard_url: env.dashboard_url,
        },
        jwt: JwtSettings {
            secret: env.jwt_secret,
            ttl_secs: env.jwt_ttl_secs.max(60),
        },
        bootstrap_admin_email: env.bootstrap_admin_email,
        bootstrap_api_key: env.bootstrap_api_key,
        max_attempts: env.max_retry_attempts.max(1),
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
        lemon: LemonSettings {
            webhook_secret: if env.lemon_webhook_secret.trim().is_empty() {
                None
            } else {
                Some(env.lemon_webhook_secret)
            },
            variant_credits,
            auto_create_users: env.lemon_auto_create_users,
        },
    })
}
