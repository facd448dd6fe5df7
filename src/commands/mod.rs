//! CLI command handlers

pub mod auth;
pub mod batch;
pub mod billing;
pub mod download;
pub mod status;

use tracing::debug;

use crate::app::YcdApp;
use crate::cancel::CancelFlag;
use crate::cli::Command;

/// Run one parsed command against the app
pub async fn run(app: &YcdApp, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Login { username, password } => auth::login(app, &username, &password).await,
        Command::Register {
            username,
            email,
            password,
        } => auth::register(app, username, email, password).await,
        Command::Logout => {
            auth::logout(app);
            Ok(())
        }
        Command::Status { sync } => status::status(app, sync).await,
        Command::Watch => status::watch(app).await,
        Command::Download {
            kind,
            video,
            clean,
            format,
            quality,
            out,
            no_save,
        } => {
            let options = crate::downloads::DownloadOptions {
                clean,
                format,
                quality,
            };
            let out = if no_save {
                None
            } else {
                Some(out.unwrap_or_else(|| app.config.download_dir.clone()))
            };
            download::download(app, kind.into(), &video, &options, out.as_deref()).await
        }
        Command::Batch { command } => batch::run(app, command).await,
        Command::Billing { command } => billing::run(app, command).await,
    }
}

/// Flag raised when the user presses Ctrl-C
pub fn cancel_on_ctrl_c() -> CancelFlag {
    let flag = CancelFlag::new();
    let raised = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Ctrl-C received, cancelling");
            raised.cancel();
        }
    });
    flag
}
