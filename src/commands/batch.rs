use anyhow::{bail, Context};

use super::cancel_on_ctrl_c;
use crate::app::YcdApp;
use crate::cli::BatchCommand;
use crate::jobs::{parse_batch_input, BatchError, BatchItemStatus, BatchJob, ResultType};

pub async fn run(app: &YcdApp, command: BatchCommand) -> anyhow::Result<()> {
    match command {
        BatchCommand::Submit {
            result_type,
            file,
            videos,
            clean,
            no_wait,
        } => {
            let mut text = videos.join("\n");
            if let Some(path) = file {
                let contents = tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                text.push('\n');
                text.push_str(&contents);
            }
            submit(app, &text, result_type.into(), clean, no_wait).await
        }
        BatchCommand::Status => {
            let Some(mut job) = app.batches.jobs().load()? else {
                println!("No saved batch");
                return Ok(());
            };
            if job.is_finished() {
                print_job(&job);
                return Ok(());
            }
            follow(app, &mut job).await
        }
        BatchCommand::Clear => {
            app.batches.jobs().clear()?;
            println!("Saved batch cleared");
            Ok(())
        }
    }
}

async fn submit(
    app: &YcdApp,
    text: &str,
    result_type: ResultType,
    clean: bool,
    no_wait: bool,
) -> anyhow::Result<()> {
    let parsed = parse_batch_input(text);
    for cell in &parsed.rejected {
        eprintln!("Skipping unrecognized link: {}", cell);
    }
    if parsed.duplicates > 0 {
        eprintln!("Skipped {} duplicate video(s)", parsed.duplicates);
    }
    if parsed.ids.is_empty() {
        bail!("No YouTube links or video ids found");
    }

    let mut job = app.batches.submit(parsed.ids, result_type, clean).await?;
    println!("Submitted batch {} with {} video(s)", job.job_id, job.items.len());
    if no_wait {
        return Ok(());
    }
    follow(app, &mut job).await
}

async fn follow(app: &YcdApp, job: &mut BatchJob) -> anyhow::Result<()> {
    let cancel = cancel_on_ctrl_c();
    let mut last_progress = None;
    let result = app
        .batches
        .poll_until_done(job, &cancel, |job| {
            let progress = job.progress();
            if last_progress != Some(progress) {
                println!(
                    "{:>3}%  {} done, {} failed, {} total",
                    progress,
                    job.count(BatchItemStatus::Completed),
                    job.count(BatchItemStatus::Failed),
                    job.items.len()
                );
                last_progress = Some(progress);
            }
        })
        .await;

    match result {
        Ok(summary) => {
            print_job(job);
            if summary.completed > 0 && !summary.usage_confirmed {
                eprintln!("Usage counter not updated yet, `ycd status` will catch up");
            }
            Ok(())
        }
        Err(BatchError::Cancelled) => {
            println!("Stopped following batch {}, resume with `ycd batch status`", job.job_id);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_job(job: &BatchJob) {
    println!("Batch {} ({})", job.job_id, job.result_type);
    for item in &job.items {
        let status = match item.status {
            BatchItemStatus::Queued => "queued",
            BatchItemStatus::Processing => "processing",
            BatchItemStatus::Completed => "completed",
            BatchItemStatus::Failed => "failed",
        };
        let detail = match &item.error {
            Some(error) => error.clone(),
            None => item.result_refs.join(", "),
        };
        println!("  {}  {:<10} {:>3}%  {}", item.youtube_id, status, item.progress, detail);
    }
}
