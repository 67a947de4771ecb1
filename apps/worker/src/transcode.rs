use anyhow::{Context, Result};
use dispatch::types::{CustomOptions, Preset};
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Planned ffmpeg invocation: final artifact path plus the argument list
/// (input through output, without the binary itself).
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodePlan {
    pub output_path: PathBuf,
    pub args: Vec<String>,
}

fn prores_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-c:v".to_string(),
        "prores_ks".to_string(),
        "-profile:v".to_string(),
        "3".to_string(),
        "-c:a".to_string(),
        "pcm_s16le".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

fn h264_args(input: &Path, bitrate_mbps: f64, output: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "fast".to_string(),
        "-b:v".to_string(),
        format!("{bitrate_mbps}M"),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "192k".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Chooses container/codec for the preset: web/social are H.264 MP4 at the
/// preset bitrate, high quality is ProRes MOV, custom honors the submitted
/// codec and bitrate.
pub fn plan_transcode(
    input: &Path,
    preset: Preset,
    custom_options: Option<&CustomOptions>,
    output_dir: &Path,
    output_name: &str,
) -> TranscodePlan {
    let base = output_dir.join(output_name);

    if preset == Preset::HighQuality {
        let output = base.with_extension("mov");
        return TranscodePlan {
            args: prores_args(input, &output),
            output_path: output,
        };
    }

    let mut codec = "h264".to_string();
    let mut bitrate = match preset {
        Preset::Social => 12.0,
        _ => 8.0,
    };
    if preset == Preset::Custom {
        if let Some(opts) = custom_options {
            if let Some(requested) = opts.bitrate_mbps {
                bitrate = requested;
            }
            if let Some(requested) = &opts.codec {
                codec = requested.clone();
            }
        }
    }

    if codec == "prores" {
        let output = base.with_extension("mov");
        TranscodePlan {
            args: prores_args(input, &output),
            output_path: output,
        }
    } else {
        let output = base.with_extension("mp4");
        TranscodePlan {
            args: h264_args(input, bitrate, &output),
            output_path: output,
        }
    }
}

pub async fn run_transcode(ffmpeg_path: &str, plan: &TranscodePlan) -> Result<()> {
    let status = Command::new(ffmpeg_path)
        .args(&plan.args)
        .status()
        .await
        .context("spawn ffmpeg")?;
    if !status.success() {
        anyhow::bail!("ffmpeg exited with {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> PathBuf {
        PathBuf::from("/scratch/output/render.mov")
    }

    #[test]
    fn web_preset_is_h264_mp4() {
        let plan = plan_transcode(&input(), Preset::Web, None, Path::new("/scratch/output"), "final");
        assert_eq!(plan.output_path, Path::new("/scratch/output/final.mp4"));
        assert!(plan.args.contains(&"libx264".to_string()));
        assert!(plan.args.contains(&"8M".to_string()));
    }

    #[test]
    fn social_preset_bumps_bitrate() {
        let plan = plan_transcode(
            &input(),
            Preset::Social,
            None,
            Path::new("/scratch/output"),
            "clip",
        );
        assert!(plan.args.contains(&"12M".to_string()));
    }

    #[test]
    fn high_quality_is_prores_mov() {
        let plan = plan_transcode(
            &input(),
            Preset::HighQuality,
            None,
            Path::new("/scratch/output"),
            "master",
        );
        assert_eq!(plan.output_path, Path::new("/scratch/output/master.mov"));
        assert!(plan.args.contains(&"prores_ks".to_string()));
        assert!(plan.args.contains(&"pcm_s16le".to_string()));
    }

    #[test]
    fn custom_preset_honors_codec_and_bitrate() {
        let opts = CustomOptions {
            codec: Some("prores".to_string()),
            bitrate_mbps: Some(25.0),
        };
        let plan = plan_transcode(
            &input(),
            Preset::Custom,
            Some(&opts),
            Path::new("/scratch/output"),
            "deliverable",
        );
        assert_eq!(
            plan.output_path,
            Path::new("/scratch/output/deliverable.mov")
        );

        let opts = CustomOptions {
            codec: None,
            bitrate_mbps: Some(25.5),
        };
        let plan = plan_transcode(
            &input(),
            Preset::Custom,
            Some(&opts),
            Path::new("/scratch/output"),
            "deliverable",
        );
        assert!(plan.args.contains(&"25.5M".to_string()));
        assert_eq!(
            plan.output_path,
            Path::new("/scratch/output/deliverable.mp4")
        );
    }

    #[test]
    fn existing_extension_is_replaced() {
        let plan = plan_transcode(
            &input(),
            Preset::Web,
            None,
            Path::new("/scratch/output"),
            "final.mov",
        );
        assert_eq!(plan.output_path, Path::new("/scratch/output/final.mp4"));
    }
}
