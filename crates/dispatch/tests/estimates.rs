use dispatch::ledger::plan_settlement;
use dispatch::manifest::{
    Manifest, ManifestComposition, ManifestProject, canonical_json, check_manifest, hash_manifest,
    sha256_hex,
};
use dispatch::pricing::{PricingSettings, compute_actual_cost, estimate_cost};
use dispatch::types::{GpuClass, Preset};

fn manifest(duration_seconds: f64, effects: Vec<&str>, expressions_count: i64) -> Manifest {
    Manifest {
        schema_version: 1,
        project: ManifestProject {
            name: "spot".to_string(),
            path: "/projects/spot.aep".to_string(),
            hash: "cd".repeat(32),
            size_bytes: 4_194_304,
            saved: true,
        },
        composition: ManifestComposition {
            name: "Main".to_string(),
            duration_seconds,
            fps: 24.0,
            width: 1920,
            height: 1080,
            work_area_start: 0.0,
            work_area_duration: duration_seconds,
        },
        assets: vec![],
        fonts: vec!["Inter".to_string()],
        effects: effects.into_iter().map(str::to_string).collect(),
        expressions_count,
        created_at: "2024-06-01T12:00:00Z".to_string(),
    }
}

#[test]
fn web_preset_happy_path_numbers() {
    // 60 s composition, 5 native effects, no expressions, 120 MB bundle.
    let settings = PricingSettings::default();
    let m = manifest(
        60.0,
        vec!["ADBE A", "ADBE B", "ADBE C", "ADBE D", "ADBE E"],
        0,
    );

    let est = estimate_cost(&settings, &m, Preset::Web, 120_000_000, None).unwrap();
    assert_eq!(est.gpu_class, GpuClass::Rtx4090);
    // Raw costs land under the floor, so the minimum job cost applies.
    assert_eq!(est.cost_usd, 1.0);
    assert!(est.cost_usd >= settings.min_job_cost_usd);
    assert!(est.warnings.is_empty());

    // A one-minute measured render settles at (or under) the estimate.
    let actual = compute_actual_cost(&settings, &m, Preset::Web, 120_000_000, 1.0, None);
    assert!(actual <= est.cost_usd);
}

#[test]
fn identical_submissions_share_a_fingerprint() {
    let a = manifest(60.0, vec!["ADBE A"], 0);
    let b = manifest(60.0, vec!["ADBE A"], 0);
    assert_eq!(hash_manifest(&a).unwrap(), hash_manifest(&b).unwrap());

    let c = manifest(61.0, vec!["ADBE A"], 0);
    assert_ne!(hash_manifest(&a).unwrap(), hash_manifest(&c).unwrap());
}

#[test]
fn canonical_hash_ignores_key_order_and_whitespace() {
    let a: serde_json::Value =
        serde_json::from_str(r#"{"preset":"web","manifest":{"b":2,"a":1}}"#).unwrap();
    let b: serde_json::Value =
        serde_json::from_str("{ \"manifest\": { \"a\": 1, \"b\": 2 },\n \"preset\": \"web\" }")
            .unwrap();
    assert_eq!(
        sha256_hex(&canonical_json(&a)),
        sha256_hex(&canonical_json(&b))
    );
}

#[test]
fn high_quality_preset_always_selects_a100() {
    let settings = PricingSettings::default();
    let m = manifest(10.0, vec!["ADBE A"], 0);
    let est = estimate_cost(&settings, &m, Preset::HighQuality, 1_000_000, None).unwrap();
    assert_eq!(est.gpu_class, GpuClass::A100);
}

#[test]
fn third_party_effects_warn_but_do_not_block() {
    let m = manifest(30.0, vec!["Trapcode Particular", "ADBE A"], 0);
    let (warnings, errors) = check_manifest(&m);
    assert!(errors.is_empty());
    assert!(warnings.iter().any(|w| w.contains("Trapcode Particular")));
}

#[test]
fn reserve_settle_void_laws() {
    // settle(actual <= reserved): posted drops by exactly actual, reserved
    // portion is fully released.
    let plan = plan_settlement(10.0, 90.0, 6.0);
    assert_eq!(plan.charge_usd, 6.0);
    assert_eq!(plan.adjustment_usd, Some(4.0));
    assert_eq!(-10.0 + plan.adjustment_usd.unwrap(), -6.0);

    // Settling at zero refunds the full reservation, the void equivalent.
    let plan = plan_settlement(10.0, 90.0, 0.0);
    assert_eq!(plan.charge_usd, 0.0);
    assert_eq!(plan.adjustment_usd, Some(10.0));
    assert_eq!(plan.shortfall_usd, None);
}

#[test]
fn overage_settlement_records_shortfall_detail() {
    // $5 reserved and only $1 otherwise available: a $9 actual cost can
    // charge at most $6 and must record the $3 gap.
    let plan = plan_settlement(5.0, 1.0, 9.0);
    assert_eq!(plan.charge_usd, 6.0);
    assert_eq!(plan.shortfall_usd, Some(3.0));
    assert_eq!(plan.adjustment_usd, Some(-1.0));
}
