use anyhow::Context;
use dispatch::bus::{Bus, ProgressEvent};
use dispatch::store::Db;
use dispatch::types::JobStatus;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use uuid::Uuid;

pub enum RenderError {
    Cancelled,
    Timeout,
    Failed(anyhow::Error),
}

/// `aerender`-style invocation producing an intermediate master file.
pub fn render_command(
    aerender_path: &str,
    project_path: &Path,
    comp_name: &str,
    output_path: &Path,
) -> Command {
    let mut cmd = Command::new(aerender_path);
    cmd.arg("-project")
        .arg(project_path)
        .arg("-comp")
        .arg(comp_name)
        .arg("-output")
        .arg(output_path)
        .arg("-continueOnMissingFootage");
    cmd
}

/// Progress percentage from a renderer stdout line, `PROGRESS:<pct>%`.
pub fn parse_progress_line(line: &str) -> Option<f64> {
    let (_, rest) = line.split_once("PROGRESS:")?;
    rest.trim().trim_end_matches('%').trim().parse::<f64>().ok()
}

/// Maps reported render progress onto the job's 30–90 band.
pub fn map_render_progress(reported: f64) -> f64 {
    (30.0 + reported * 0.6).min(90.0)
}

/// Drives the renderer subprocess: streams stdout for progress lines, polls
/// the cancel flag once a second, and enforces the wall-clock timeout. The
/// subprocess is killed on cancel, timeout, and drop.
pub async fn run_render(
    db: &Db,
    bus: &Bus,
    job_id: Uuid,
    mut cmd: Command,
    timeout: Duration,
) -> Result<(), RenderError> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let mut child = cmd
        .spawn()
        .context("spawn renderer subprocess")
        .map_err(RenderError::Failed)?;
    let stdout = child
        .stdout
        .take()
        .context("renderer stdout unavailable")
        .map_err(RenderError::Failed)?;
    let mut lines = BufReader::new(stdout).lines();

    let started = Instant::now();
    let mut poll = tokio::time::interval(Duration::from_secs(1));
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("read renderer stdout").map_err(RenderError::Failed)? {
                    Some(line) => {
                        if let Some(reported) = parse_progress_line(&line) {
                            let progress = map_render_progress(reported);
                            publish_render_progress(db, bus, job_id, progress).await;
                        }
                    }
                    None => break,
                }
            }
            _ = poll.tick() => {
                match db.cancel_requested(job_id).await {
                    Ok(true) => {
                        let _ = child.start_kill();
                        return Err(RenderError::Cancelled);
                    }
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(err = %err, "cancel poll failed; continuing render");
                    }
                }
                if started.elapsed() > timeout {
                    let _ = child.start_kill();
                    return Err(RenderError::Timeout);
                }
            }
        }
    }

    let status = child
        .wait()
        .await
        .context("wait for renderer subprocess")
        .map_err(RenderError::Failed)?;
    if !status.success() {
        return Err(RenderError::Failed(anyhow::anyhow!(
            "renderer exited with {status}"
        )));
    }
    Ok(())
}

/// Mid-render progress is best-effort: a dropped update only delays the next
/// one, so failures are logged and swallowed.
async fn publish_render_progress(db: &Db, bus: &Bus, job_id: Uuid, progress: f64) {
    let stored = match db
        .advance_job(job_id, JobStatus::Rendering, progress, None)
        .await
    {
        Ok(stored) => stored,
        Err(err) => {
            tracing::warn!(err = %err, "failed to persist render progress");
            return;
        }
    };
    if let Err(err) = bus
        .publish_progress(ProgressEvent::new(job_id, JobStatus::Rendering, stored))
        .await
    {
        tracing::warn!(err = %err, "failed to publish render progress");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_lines_parse() {
        assert_eq!(parse_progress_line("PROGRESS: 42%"), Some(42.0));
        assert_eq!(parse_progress_line("PROGRESS:7.5%"), Some(7.5));
        assert_eq!(parse_progress_line("frame 10 PROGRESS: 100 %"), Some(100.0));
        assert_eq!(parse_progress_line("rendering frame 10"), None);
        assert_eq!(parse_progress_line("PROGRESS: n/a"), None);
    }

    #[test]
    fn render_progress_maps_into_band() {
        assert_eq!(map_render_progress(0.0), 30.0);
        assert_eq!(map_render_progress(50.0), 60.0);
        assert_eq!(map_render_progress(100.0), 90.0);
        // Values past 100 stay capped.
        assert_eq!(map_render_progress(150.0), 90.0);
    }

    #[test]
    fn command_shape() {
        let cmd = render_command(
            "aerender",
            Path::new("/tmp/p/project.aep"),
            "Main",
            Path::new("/tmp/p/out/render.mov"),
        );
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "-project");
        assert_eq!(args[2], "-comp");
        assert_eq!(args[3], "Main");
        assert!(args.contains(&"-continueOnMissingFootage".to_string()));
    }
}
