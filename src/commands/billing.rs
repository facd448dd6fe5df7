//! Billing redirects and cancellation

use anyhow::Context;

use crate::app::YcdApp;
use crate::cli::BillingCommand;
use crate::billing::SubscriptionTier;

pub async fn run(app: &YcdApp, command: BillingCommand) -> anyhow::Result<()> {
    match command {
        BillingCommand::Checkout { tier } => {
            let tier = SubscriptionTier::from(tier);
            let redirect = app
                .api
                .create_checkout_session(tier)
                .await
                .context("Could not start checkout")?;
            println!("Open this link to upgrade to {}:\n{}", tier, redirect.url);
        }
        BillingCommand::Portal => {
            let redirect = app
                .api
                .create_portal_session()
                .await
                .context("Could not open the billing portal")?;
            println!("{}", redirect.url);
        }
        BillingCommand::Cancel => {
            let response = app
                .api
                .cancel_subscription()
                .await
                .context("Could not cancel the subscription")?;
            println!(
                "{}",
                response
                    .message
                    .unwrap_or_else(|| "Subscription will end at the close of the current period".to_string())
            );

            // Plan and limits may change right away, pull them with a sync
            if let Err(e) = app.store.refresh(true).await {
                eprintln!("Could not refresh subscription status: {}", e);
            }
        }
    }
    Ok(())
}
