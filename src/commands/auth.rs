use anyhow::Context;

use crate::api::RegisterRequest;
use crate::app::YcdApp;

pub async fn login(app: &YcdApp, username: &str, password: &str) -> anyhow::Result<()> {
    let session = app.login(username, password).await.context("Sign in failed")?;
    println!("Signed in as {}", session.user.username);

    match app.store.refresh(true).await {
        Ok(snapshot) => println!("Plan: {}", snapshot.tier),
        Err(e) => eprintln!("Could not load subscription status: {}", e),
    }
    Ok(())
}

pub async fn register(
    app: &YcdApp,
    username: String,
    email: String,
    password: String,
) -> anyhow::Result<()> {
    let request = RegisterRequest {
        username,
        email,
        password,
    };
    let response = app.auth.register(&request).await.context("Registration failed")?;
    println!(
        "{}",
        response
            .message
            .unwrap_or_else(|| format!("Account {} created, you can now sign in", request.username))
    );
    Ok(())
}

pub fn logout(app: &YcdApp) {
    app.logout();
    println!("Signed out");
}
