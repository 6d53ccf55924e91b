//! Password grant sign-in and refresh against the auth token endpoint.

use std::io::{self, BufRead, Write};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use super::TokenStore;
use crate::config::{BackendSettings, Config};

/// Token endpoint response.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub user: Option<AuthUser>,
}

#[derive(Debug, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
}

/// A usable signed-in session.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub access_token: String,
}

async fn token_request(
    backend: &BackendSettings,
    grant_type: &str,
    body: serde_json::Value,
) -> Result<TokenResponse> {
    let url = format!(
        "{}/auth/v1/token?grant_type={}",
        backend.url.trim_end_matches('/'),
        grant_type
    );
    tracing::debug!("POST {}", url);

    let resp = reqwest::Client::new()
        .post(&url)
        .header("apikey", &backend.anon_key)
        .json(&body)
        .send()
        .await
        .context("Failed to reach auth service")?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("Sign-in failed (HTTP {}): {}", status.as_u16(), body);
    }

    resp.json()
        .await
        .context("Failed to parse auth token response")
}

fn store_tokens(config: &mut Config, tokens: TokenResponse) {
    config.set_access_token(tokens.access_token, tokens.expires_in);
    if let Some(rt) = tokens.refresh_token {
        config.set_refresh_token(rt);
    }
    if let Some(user) = tokens.user {
        config.user_id = Some(user.id);
        config.email = user.email;
    }
}

/// Renew the access token with the stored refresh token.
/// Returns Ok(false) when there is no refresh token to use.
pub async fn refresh() -> Result<bool> {
    let mut config = Config::load()?;
    let Some(refresh_token) = config.get_refresh_token() else {
        return Ok(false);
    };

    tracing::info!("Refreshing access token...");
    let tokens = token_request(
        &config.backend,
        "refresh_token",
        serde_json::json!({ "refresh_token": refresh_token }),
    )
    .await
    .context("Failed to refresh access token")?;

    store_tokens(&mut config, tokens);
    config.save()?;
    tracing::info!("Token refresh complete");
    Ok(true)
}

/// Print `label` and read one line from stdin.
pub fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Sign in with email and password.
pub async fn login(email: Option<String>, force: bool) -> Result<()> {
    {
        let config = Config::load()?;

        if !force {
            if let Some(token) = config.get_access_token() {
                if !token.is_expired() {
                    println!("Already logged in. Use --force to re-authenticate.");
                    return Ok(());
                }
                if config.get_refresh_token().is_some() {
                    tracing::info!("Access token expired, attempting refresh...");
                    match refresh().await {
                        Ok(true) => {
                            println!("Token refreshed successfully.");
                            return Ok(());
                        }
                        Ok(false) => {}
                        Err(e) => {
                            tracing::warn!("Refresh failed, falling back to password: {:#}", e);
                        }
                    }
                }
            }
        }
    }

    let email = match email {
        Some(e) => e,
        None => prompt("Email: ")?,
    };
    let password = match std::env::var("CALLRELAY_PASSWORD") {
        Ok(p) => p,
        Err(_) => prompt("Password: ")?,
    };
    if email.is_empty() || password.is_empty() {
        bail!("Email and password are required");
    }

    let mut config = Config::load()?;
    let tokens = token_request(
        &config.backend,
        "password",
        serde_json::json!({ "email": email, "password": password }),
    )
    .await?;

    store_tokens(&mut config, tokens);
    config.save()?;

    println!(
        "Logged in as {}.",
        config.email.as_deref().unwrap_or(email.as_str())
    );
    Ok(())
}

/// Clear stored credentials
pub async fn logout() -> Result<()> {
    let mut config = Config::load()?;
    config.clear_tokens();
    config.save()?;
    println!("Logged out.");
    Ok(())
}

/// Display current auth status
pub async fn status() -> Result<()> {
    let config = Config::load()?;

    println!("Backend:     {}", config.backend.url);
    match (&config.user_id, &config.email) {
        (Some(id), Some(email)) => println!("User:        {} ({})", email, id),
        (Some(id), None) => println!("User:        {}", id),
        _ => println!("User:        none"),
    }

    match config.get_access_token() {
        Some(token) if !token.is_expired() => {
            println!("Access tok:  valid");
            if let Some(exp) = token.expires_at {
                println!("  expires_at: {}", exp);
            }
        }
        Some(_) => println!("Access tok:  expired"),
        None => println!("Access tok:  none"),
    }

    match config.get_refresh_token() {
        Some(_) => println!("Refresh tok: present"),
        None => println!("Refresh tok: none"),
    }

    if config.get_access_token().is_none() {
        println!("\nRun 'callrelay login' to authenticate.");
    }

    Ok(())
}

/// Load the stored session, refreshing the access token when needed.
pub async fn active_session() -> Result<(Config, Session)> {
    let mut config = Config::load()?;

    let needs_refresh = config.get_access_token().map_or(true, |t| t.is_expired());
    if needs_refresh {
        match refresh().await {
            Ok(true) => config = Config::load()?,
            Ok(false) => bail!("Not signed in. Run 'callrelay login'."),
            Err(e) => bail!("Token refresh failed: {:#}. Run 'callrelay login'.", e),
        }
    }

    let access_token = config
        .get_access_token()
        .context("No access token. Run 'callrelay login' first.")?
        .token;
    let user_id = config.require_user_id()?;

    Ok((
        config,
        Session {
            user_id,
            access_token,
        },
    ))
}
