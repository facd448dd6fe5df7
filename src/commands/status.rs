use anyhow::bail;
use tokio::sync::watch;

use crate::app::YcdApp;
use crate::billing::{ActionKey, Limit, SubscriptionSnapshot, UsageLevel};

const BAR_WIDTH: usize = 20;

pub async fn status(app: &YcdApp, sync: bool) -> anyhow::Result<()> {
    let Some(session) = app.session.current() else {
        bail!("Not signed in, run `ycd login` first");
    };
    let snapshot = app.store.refresh(sync).await?;
    println!("Signed in as {}", session.user.username);
    print!("{}", render_usage(&snapshot));
    Ok(())
}

/// Poll in the background and print every change until Ctrl-C or logout
pub async fn watch(app: &YcdApp) -> anyhow::Result<()> {
    if !app.session.is_active() {
        bail!("Not signed in, run `ycd login` first");
    }

    let mut snapshots = app.store.subscribe();
    let mut session = app.session.subscribe();
    let (first, poller) = app.store.init().await;
    if let Err(e) = first {
        eprintln!("Initial refresh failed: {}", e);
    }
    print!("{}", render_usage(&app.store.snapshot()));
    let mut shown = app.store.snapshot();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = session.changed() => {
                if changed.is_err() || session.borrow().is_none() {
                    eprintln!("Session ended");
                    break;
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let latest = next_snapshot(&mut snapshots);
                if !latest.same_state_as(&shown) {
                    print!("{}", render_usage(&latest));
                    shown = latest;
                }
            }
        }
    }

    poller.stop().await;
    Ok(())
}

fn next_snapshot(rx: &mut watch::Receiver<SubscriptionSnapshot>) -> SubscriptionSnapshot {
    rx.borrow_and_update().clone()
}

/// Plan line plus one usage bar per action
pub fn render_usage(snapshot: &SubscriptionSnapshot) -> String {
    let mut out = format!("Plan: {}\n", snapshot.tier);
    for action in ActionKey::ALL {
        let eval = snapshot.evaluate(action);
        let (filled, amount) = match eval.limit {
            Limit::Unlimited => (0, format!("{} / unlimited", eval.used)),
            Limit::Count(0) => (BAR_WIDTH, format!("{} / 0", eval.used)),
            Limit::Count(max) => {
                let filled = ((eval.used.min(max) as usize) * BAR_WIDTH) / max as usize;
                (filled, format!("{} / {}", eval.used, max))
            }
        };
        let marker = match eval.level {
            UsageLevel::Ok => "",
            UsageLevel::NearLimit => "  near limit",
            UsageLevel::Exceeded => "  limit reached",
        };
        out.push_str(&format!(
            "  {:<20} [{}{}] {}{}\n",
            action.label(),
            "#".repeat(filled),
            "-".repeat(BAR_WIDTH - filled),
            amount,
            marker
        ));
    }
    if let Some(reset) = snapshot.next_reset {
        out.push_str(&format!("Usage resets {}\n", reset.format("%Y-%m-%d %H:%M UTC")));
    }
    out
}
