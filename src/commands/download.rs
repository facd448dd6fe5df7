use anyhow::Context;
use std::path::Path;

use super::cancel_on_ctrl_c;
use crate::app::YcdApp;
use crate::downloads::{DownloadKind, DownloadOptions, DownloadOutcome};

pub async fn download(
    app: &YcdApp,
    kind: DownloadKind,
    video: &str,
    options: &DownloadOptions,
    out: Option<&Path>,
) -> anyhow::Result<()> {
    let cancel = cancel_on_ctrl_c();
    let report = app
        .downloads
        .download(kind, video, options, &cancel)
        .await
        .with_context(|| format!("{} download failed", kind))?;

    match (&report.outcome, out) {
        (DownloadOutcome::Helper { .. }, dir) => {
            let path = app
                .downloads
                .save(&report.outcome, dir.unwrap_or(app.config.download_dir.as_path()))
                .await?;
            println!("Saved by YCD Desktop Helper: {}", path.display());
        }
        (_, Some(dir)) => {
            let path = app.downloads.save(&report.outcome, dir).await?;
            println!("Saved {}", path.display());
        }
        (DownloadOutcome::Transcript { text, .. }, None) => println!("{}", text),
        (DownloadOutcome::Remote { url, .. }, None) => println!("{}", url),
    }

    if !report.usage_confirmed {
        eprintln!("Usage counter not updated yet, `ycd status` will catch up");
    }
    Ok(())
}
