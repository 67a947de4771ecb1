use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Immutable descriptor of a composition, produced client-side and embedded
/// in the job row as a snapshot. Field names are the wire names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: i32,
    pub project: ManifestProject,
    pub composition: ManifestComposition,
    pub assets: Vec<ManifestAsset>,
    pub fonts: Vec<String>,
    pub effects: Vec<String>,
    pub expressions_count: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestProject {
    pub name: String,
    pub path: String,
    pub hash: String,
    pub size_bytes: i64,
    pub saved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestComposition {
    pub name: String,
    pub duration_seconds: f64,
    pub fps: f64,
    pub width: i64,
    pub height: i64,
    pub work_area_start: f64,
    pub work_area_duration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestAsset {
    pub id: String,
    pub original_path: String,
    pub zip_path: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub last_modified: String,
}

const THIRD_PARTY_PREFIXES: &[&str] = &[
    "Sapphire",
    "Boris",
    "RedGiant",
    "VideoCopilot",
    "Element3D",
    "Trapcode",
];

const BLOCKED_EFFECTS: &[&str] = &["VC Element", "Trapcode Particular"];

/// Canonical JSON form: sorted keys, no whitespace, comma/colon separators.
/// serde_json's default map is ordered, so round-tripping any JSON value
/// through `Value` and compact serialization yields exactly this form.
pub fn canonical_json(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Content fingerprint of a manifest: SHA-256 over its canonical JSON.
pub fn hash_manifest(manifest: &Manifest) -> anyhow::Result<String> {
    let value = serde_json::to_value(manifest)?;
    Ok(sha256_hex(&canonical_json(&value)))
}

/// Splits effect names into (native, third-party). Unknown vendors default
/// to third-party.
pub fn classify_effects(effects: &[String]) -> (Vec<&str>, Vec<&str>) {
    let mut native = Vec::new();
    let mut third_party = Vec::new();
    for effect in effects {
        if effect.starts_with("ADBE") {
            native.push(effect.as_str());
            continue;
        }
        if BLOCKED_EFFECTS.contains(&effect.as_str()) {
            third_party.push(effect.as_str());
            continue;
        }
        if THIRD_PARTY_PREFIXES.iter().any(|p| effect.starts_with(p)) {
            third_party.push(effect.as_str());
            continue;
        }
        if effect.starts_with("PG") || effect.starts_with("CC") {
            native.push(effect.as_str());
            continue;
        }
        third_party.push(effect.as_str());
    }
    (native, third_party)
}

/// Advisory compatibility check. Warnings never block; errors abort the
/// estimate/submit path with a validation failure.
pub fn check_manifest(manifest: &Manifest) -> (Vec<String>, Vec<String>) {
    let mut warnings = Vec::new();
    let errors = Vec::new();

    let (_, third_party) = classify_effects(&manifest.effects);
    if !third_party.is_empty() {
        let mut names: Vec<&str> = third_party.clone();
        names.sort_unstable();
        names.dedup();
        warnings.push(format!(
            "Third-party effects detected: {}",
            names.join(", ")
        ));
    }
    if manifest.fonts.is_empty() {
        warnings.push("No fonts detected; verify text layers use default fonts.".to_string());
    }
    if manifest.expressions_count > 100 {
        warnings.push("High expression count may slow render.".to_string());
    }
    (warnings, errors)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_manifest(
        duration_seconds: f64,
        effects: Vec<String>,
        expressions_count: i64,
    ) -> Manifest {
        Manifest {
            schema_version: 1,
            project: ManifestProject {
                name: "promo".to_string(),
                path: "/projects/promo.aep".to_string(),
                hash: "ab".repeat(32),
                size_bytes: 1_048_576,
                saved: true,
            },
            composition: ManifestComposition {
                name: "Main".to_string(),
                duration_seconds,
                fps: 30.0,
                width: 1920,
                height: 1080,
                work_area_start: 0.0,
                work_area_duration: duration_seconds,
            },
            assets: vec![],
            fonts: vec!["Inter".to_string()],
            effects,
            expressions_count,
            created_at: "2024-05-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn canonical_json_sorts_keys_and_strips_whitespace() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"b": 1, "a": {"z": true, "y": [1, 2]}}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str("{\n  \"a\": {\"y\": [1,2], \"z\": true},\n  \"b\": 1\n}")
                .unwrap();
        assert_eq!(canonical_json(&a), r#"{"a":{"y":[1,2],"z":true},"b":1}"#);
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn hash_is_stable_under_key_reordering_and_whitespace() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"fonts":["Inter"],"effects":[],"schemaVersion":1}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(
            "{ \"schemaVersion\": 1,\n  \"effects\": [],\n  \"fonts\": [\"Inter\"] }",
        )
        .unwrap();
        assert_eq!(
            sha256_hex(&canonical_json(&a)),
            sha256_hex(&canonical_json(&b))
        );
    }

    #[test]
    fn effect_classification() {
        let effects = vec![
            "ADBE Gaussian Blur 2".to_string(),
            "CC Particle World".to_string(),
            "PG Shifter".to_string(),
            "Sapphire Glow".to_string(),
            "VC Element".to_string(),
            "Mystery Plugin".to_string(),
        ];
        let (native, third_party) = classify_effects(&effects);
        assert_eq!(
            native,
            vec!["ADBE Gaussian Blur 2", "CC Particle World", "PG Shifter"]
        );
        assert_eq!(
            third_party,
            vec!["Sapphire Glow", "VC Element", "Mystery Plugin"]
        );
    }

    #[test]
    fn check_manifest_warns_without_blocking() {
        let mut manifest = sample_manifest(10.0, vec!["Sapphire Glow".to_string()], 120);
        manifest.fonts.clear();
        let (warnings, errors) = check_manifest(&manifest);
        assert!(errors.is_empty());
        assert_eq!(warnings.len(), 3);
        assert!(warnings[0].contains("Sapphire Glow"));
    }

    #[test]
    fn clean_manifest_has_no_warnings() {
        let manifest = sample_manifest(10.0, vec!["ADBE Gaussian Blur 2".to_string()], 3);
        let (warnings, errors) = check_manifest(&manifest);
        assert!(warnings.is_empty());
        assert!(errors.is_empty());
    }
}
