use crate::error::Result;
use crate::manifest::{Manifest, classify_effects};
use crate::types::{CustomOptions, GpuClass, Preset, round_cents};
use std::collections::HashMap;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Per-class billing rate and relative render speed.
#[derive(Debug, Clone, Copy)]
pub struct GpuPricing {
    pub rate_per_minute: f64,
    pub speed_factor: f64,
}

/// Process-wide pricing knobs, read-only after startup. The gateway and the
/// worker must be configured identically or estimate and settlement drift.
#[derive(Debug, Clone)]
pub struct PricingSettings {
    pub min_job_cost_usd: f64,
    pub storage_rate_per_gb_hour: f64,
    pub transfer_rate_per_gb: f64,
    pub upload_mbps: f64,
    pub gpu: HashMap<String, GpuPricing>,
}

impl Default for PricingSettings {
    fn default() -> Self {
        let mut gpu = HashMap::new();
        gpu.insert(
            "rtx4090".to_string(),
            GpuPricing {
                rate_per_minute: 0.5,
                speed_factor: 1.0,
            },
        );
        gpu.insert(
            "a100".to_string(),
            GpuPricing {
                rate_per_minute: 2.0,
                speed_factor: 1.6,
            },
        );
        Self {
            min_job_cost_usd: 1.0,
            storage_rate_per_gb_hour: 0.001,
            transfer_rate_per_gb: 0.05,
            upload_mbps: 50.0,
            gpu,
        }
    }
}

impl PricingSettings {
    /// Applies per-class rate and speed overrides supplied as JSON maps,
    /// e.g. `{"rtx4090": 0.5, "a100": 2.0}`. Unknown classes are accepted so
    /// operators can stage new pools ahead of the selection logic.
    pub fn with_gpu_overrides(
        mut self,
        rates_json: &str,
        speeds_json: &str,
    ) -> anyhow::Result<Self> {
        if !rates_json.trim().is_empty() {
            let rates: HashMap<String, f64> = serde_json::from_str(rates_json)
                .map_err(|e| anyhow::anyhow!("parse GPU_RATE_PER_MINUTE_JSON: {e}"))?;
            for (class, rate) in rates {
                self.gpu
                    .entry(class)
                    .or_insert(GpuPricing {
                        rate_per_minute: 1.0,
                        speed_factor: 1.0,
                    })
                    .rate_per_minute = rate;
            }
        }
        if !speeds_json.trim().is_empty() {
            let speeds: HashMap<String, f64> = serde_json::from_str(speeds_json)
                .map_err(|e| anyhow::anyhow!("parse GPU_SPEED_FACTOR_JSON: {e}"))?;
            for (class, speed) in speeds {
                self.gpu
                    .entry(class)
                    .or_insert(GpuPricing {
                        rate_per_minute: 1.0,
                        speed_factor: 1.0,
                    })
                    .speed_factor = speed;
            }
        }
        Ok(self)
    }

    fn gpu_pricing(&self, class: GpuClass) -> GpuPricing {
        self.gpu.get(class.as_str()).copied().unwrap_or(GpuPricing {
            rate_per_minute: 1.0,
            speed_factor: 1.0,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Estimate {
    pub cost_usd: f64,
    pub eta_seconds: i64,
    pub gpu_class: GpuClass,
    pub warnings: Vec<String>,
}

fn preset_bitrate_mbps(preset: Preset, custom_options: Option<&CustomOptions>) -> f64 {
    let base = match preset {
        Preset::Web => 8.0,
        Preset::Social => 12.0,
        Preset::HighQuality => 200.0,
        Preset::Custom => 8.0,
    };
    if preset == Preset::Custom {
        if let Some(opts) = custom_options {
            return opts.bitrate_mbps.unwrap_or(base);
        }
    }
    base
}

pub fn estimate_output_size_gb(
    duration_seconds: f64,
    preset: Preset,
    custom_options: Option<&CustomOptions>,
) -> f64 {
    let bits = preset_bitrate_mbps(preset, custom_options) * 1_000_000.0 * duration_seconds;
    (bits / 8.0) / GIB
}

/// Dimensionless render-complexity score, starting at 1.0.
pub fn compute_complexity(manifest: &Manifest) -> f64 {
    let (_, third_party) = classify_effects(&manifest.effects);
    let mut complexity = 1.0;
    if manifest.effects.len() > 10 {
        complexity += 0.5;
    }
    if manifest.effects.len() > 30 {
        complexity += 1.0;
    }
    if !third_party.is_empty() {
        complexity += 0.5;
    }
    if manifest.expressions_count > 50 {
        complexity += 0.5;
    }
    if manifest.expressions_count > 150 {
        complexity += 0.5;
    }
    complexity
}

pub fn choose_gpu_class(manifest: &Manifest, preset: Preset) -> GpuClass {
    let duration = manifest.composition.duration_seconds;
    if duration > 600.0 || compute_complexity(manifest) >= 2.5 || preset == Preset::HighQuality {
        GpuClass::A100
    } else {
        GpuClass::Rtx4090
    }
}

fn cost_components(
    settings: &PricingSettings,
    manifest: &Manifest,
    preset: Preset,
    bundle_size_bytes: i64,
    render_minutes: f64,
    custom_options: Option<&CustomOptions>,
    gpu_class: GpuClass,
) -> f64 {
    let pricing = settings.gpu_pricing(gpu_class);
    let render_cost = render_minutes * pricing.rate_per_minute;

    let duration = manifest.composition.duration_seconds;
    let output_gb = estimate_output_size_gb(duration, preset, custom_options);
    let bundle_gb = bundle_size_bytes as f64 / GIB;
    let storage_hours = (render_minutes / 60.0).max(1.0);
    let storage_cost = (bundle_gb + output_gb) * settings.storage_rate_per_gb_hour * storage_hours;
    let transfer_cost = output_gb * settings.transfer_rate_per_gb;

    (render_cost + storage_cost + transfer_cost).max(settings.min_job_cost_usd)
}

/// Deterministic (cost, ETA, GPU class, warnings) for a submission. Identical
/// inputs and settings always produce identical cost/ETA/class; warning order
/// is not part of the contract.
pub fn estimate_cost(
    settings: &PricingSettings,
    manifest: &Manifest,
    preset: Preset,
    bundle_size_bytes: i64,
    custom_options: Option<&CustomOptions>,
) -> Result<Estimate> {
    let mut warnings = Vec::new();
    let gpu_class = choose_gpu_class(manifest, preset);
    let complexity = compute_complexity(manifest);
    let duration = manifest.composition.duration_seconds;
    let pricing = settings.gpu_pricing(gpu_class);
    let render_minutes = (duration / 60.0) * (complexity / pricing.speed_factor);

    let total = cost_components(
        settings,
        manifest,
        preset,
        bundle_size_bytes,
        render_minutes,
        custom_options,
        gpu_class,
    );

    let upload_seconds = (bundle_size_bytes as f64 * 8.0) / (settings.upload_mbps * 1_000_000.0);
    let eta_seconds = (render_minutes * 60.0 + upload_seconds + 120.0) as i64;

    if bundle_size_bytes as f64 / GIB > 5.0 {
        warnings.push("Large bundle; upload may take longer.".to_string());
    }
    if complexity >= 2.5 {
        warnings.push("Complex composition; expect longer render time.".to_string());
    }

    Ok(Estimate {
        cost_usd: round_cents(total),
        eta_seconds,
        gpu_class,
        warnings,
    })
}

/// Final cost at settlement: measured render minutes replace the estimate,
/// while storage/transfer are re-derived from preset and duration exactly as
/// at estimate time (the produced file size is intentionally not consulted).
pub fn compute_actual_cost(
    settings: &PricingSettings,
    manifest: &Manifest,
    preset: Preset,
    bundle_size_bytes: i64,
    render_minutes: f64,
    custom_options: Option<&CustomOptions>,
) -> f64 {
    let gpu_class = choose_gpu_class(manifest, preset);
    round_cents(cost_components(
        settings,
        manifest,
        preset,
        bundle_size_bytes,
        render_minutes,
        custom_options,
        gpu_class,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::sample_manifest;

    fn effects(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("ADBE Effect {i}")).collect()
    }

    #[test]
    fn complexity_accumulates() {
        let simple = sample_manifest(60.0, effects(5), 0);
        assert_eq!(compute_complexity(&simple), 1.0);

        let busy = sample_manifest(60.0, effects(11), 60);
        assert_eq!(compute_complexity(&busy), 2.0);

        let mut heavy = sample_manifest(60.0, effects(31), 151);
        heavy.effects.push("Sapphire Glow".to_string());
        // 1.0 + 0.5 (>10) + 1.0 (>30) + 0.5 (third-party) + 0.5 + 0.5 (expressions)
        assert_eq!(compute_complexity(&heavy), 4.0);
    }

    #[test]
    fn gpu_class_selection() {
        let simple = sample_manifest(60.0, effects(5), 0);
        assert_eq!(choose_gpu_class(&simple, Preset::Web), GpuClass::Rtx4090);
        assert_eq!(
            choose_gpu_class(&simple, Preset::HighQuality),
            GpuClass::A100
        );

        let long = sample_manifest(601.0, effects(5), 0);
        assert_eq!(choose_gpu_class(&long, Preset::Web), GpuClass::A100);

        let mut complex = sample_manifest(60.0, effects(31), 0);
        complex.effects.push("Sapphire Glow".to_string());
        assert_eq!(choose_gpu_class(&complex, Preset::Web), GpuClass::A100);
    }

    #[test]
    fn minimum_job_cost_floors_small_jobs() {
        let settings = PricingSettings::default();
        let manifest = sample_manifest(60.0, effects(5), 0);
        let est = estimate_cost(&settings, &manifest, Preset::Web, 120_000_000, None).unwrap();
        assert_eq!(est.gpu_class, GpuClass::Rtx4090);
        assert_eq!(est.cost_usd, settings.min_job_cost_usd);
        // 60 s of render + 19.2 s of upload + 120 s of padding.
        assert_eq!(est.eta_seconds, 199);
        assert!(est.warnings.is_empty());
    }

    #[test]
    fn estimate_is_deterministic() {
        let settings = PricingSettings::default();
        let manifest = sample_manifest(240.0, effects(12), 80);
        let a = estimate_cost(&settings, &manifest, Preset::Social, 2_000_000_000, None).unwrap();
        let b = estimate_cost(&settings, &manifest, Preset::Social, 2_000_000_000, None).unwrap();
        assert_eq!(a.cost_usd, b.cost_usd);
        assert_eq!(a.eta_seconds, b.eta_seconds);
        assert_eq!(a.gpu_class, b.gpu_class);
    }

    #[test]
    fn custom_bitrate_changes_output_size() {
        let opts = CustomOptions {
            codec: None,
            bitrate_mbps: Some(16.0),
        };
        let small = estimate_output_size_gb(60.0, Preset::Custom, None);
        let large = estimate_output_size_gb(60.0, Preset::Custom, Some(&opts));
        assert!(large > small);
        // Custom options are ignored outside the custom preset.
        assert_eq!(
            estimate_output_size_gb(60.0, Preset::Web, Some(&opts)),
            estimate_output_size_gb(60.0, Preset::Web, None)
        );
    }

    #[test]
    fn warnings_for_large_bundle_and_complexity() {
        let settings = PricingSettings::default();
        let mut manifest = sample_manifest(60.0, effects(31), 0);
        manifest.effects.push("Sapphire Glow".to_string());
        let est = estimate_cost(
            &settings,
            &manifest,
            Preset::Web,
            6 * 1024 * 1024 * 1024,
            None,
        )
        .unwrap();
        assert_eq!(est.warnings.len(), 2);
    }

    #[test]
    fn gpu_overrides_merge_onto_defaults() {
        let settings = PricingSettings::default()
            .with_gpu_overrides(r#"{"a100": 3.0, "l40s": 1.25}"#, r#"{"a100": 2.0}"#)
            .unwrap();
        assert_eq!(settings.gpu["a100"].rate_per_minute, 3.0);
        assert_eq!(settings.gpu["a100"].speed_factor, 2.0);
        assert_eq!(settings.gpu["rtx4090"].rate_per_minute, 0.5);
        assert_eq!(settings.gpu["l40s"].rate_per_minute, 1.25);
        assert!(
            PricingSettings::default()
                .with_gpu_overrides("not json", "")
                .is_err()
        );
    }

    #[test]
    fn actual_cost_scales_with_measured_minutes() {
        let settings = PricingSettings::default();
        let manifest = sample_manifest(600.0, effects(5), 0);
        let short = compute_actual_cost(&settings, &manifest, Preset::Web, 1_000_000, 2.0, None);
        let long = compute_actual_cost(&settings, &manifest, Preset::Web, 1_000_000, 60.0, None);
        assert!(long > short);
        // rtx4090 at $0.5/min for 60 minutes dominates.
        assert!(long >= 30.0);
    }
}
