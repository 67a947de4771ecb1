use anyhow::{Context, Result};
use dispatch::manifest::{Manifest, check_manifest};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Streaming SHA-256 of a file on the blocking pool.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 1024 * 1024];
        loop {
            let n = file.read(&mut buf).context("read bundle chunk")?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .context("join hash task")?
}

pub async fn extract_zip(zip_path: &Path, dest: &Path) -> Result<()> {
    let zip_path = zip_path.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(&zip_path)
            .with_context(|| format!("open {}", zip_path.display()))?;
        let mut archive = zip::ZipArchive::new(file).context("read bundle archive")?;
        archive.extract(&dest).context("extract bundle archive")?;
        Ok(())
    })
    .await
    .context("join extract task")?
}

/// Validates an extracted bundle's layout and re-runs the compatibility
/// check against the embedded manifest. Returns the manifest and the path
/// of the project file.
pub fn validate_bundle(dir: &Path) -> Result<(Manifest, PathBuf)> {
    let manifest_path = dir.join("manifest.json");
    if !manifest_path.exists() {
        anyhow::bail!("Manifest missing from bundle");
    }
    let raw = std::fs::read_to_string(&manifest_path).context("read bundle manifest")?;
    let manifest: Manifest =
        serde_json::from_str(&raw).context("decode bundle manifest")?;

    let (_, errors) = check_manifest(&manifest);
    if !errors.is_empty() {
        anyhow::bail!("{}", errors.join("; "));
    }

    let project_path = dir.join("project.aep");
    if !project_path.exists() {
        anyhow::bail!("Project file missing in bundle");
    }
    Ok((manifest, project_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn manifest_json() -> String {
        serde_json::json!({
            "schemaVersion": 1,
            "project": {
                "name": "promo",
                "path": "/projects/promo.aep",
                "hash": "ab".repeat(32),
                "sizeBytes": 1024,
                "saved": true
            },
            "composition": {
                "name": "Main",
                "durationSeconds": 30.0,
                "fps": 30.0,
                "width": 1920,
                "height": 1080,
                "workAreaStart": 0.0,
                "workAreaDuration": 30.0
            },
            "assets": [],
            "fonts": ["Inter"],
            "effects": ["ADBE Gaussian Blur 2"],
            "expressionsCount": 2,
            "createdAt": "2024-06-01T12:00:00Z"
        })
        .to_string()
    }

    #[tokio::test]
    async fn hashes_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.zip");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(
            sha256_file(&path).await.unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn extracts_and_validates_a_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("bundle.zip");

        let file = std::fs::File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("manifest.json", options).unwrap();
        writer.write_all(manifest_json().as_bytes()).unwrap();
        writer.start_file("project.aep", options).unwrap();
        writer.write_all(b"binary project data").unwrap();
        writer.finish().unwrap();

        let extracted = dir.path().join("extracted");
        std::fs::create_dir_all(&extracted).unwrap();
        extract_zip(&zip_path, &extracted).await.unwrap();

        let (manifest, project_path) = validate_bundle(&extracted).unwrap();
        assert_eq!(manifest.composition.name, "Main");
        assert!(project_path.ends_with("project.aep"));
    }

    #[test]
    fn missing_pieces_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = validate_bundle(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Manifest missing"));

        std::fs::write(dir.path().join("manifest.json"), manifest_json()).unwrap();
        let err = validate_bundle(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Project file missing"));
    }
}
