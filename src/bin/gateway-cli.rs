use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;

use api_gateway::config::{load_config, AuthConfig};
use api_gateway::pipeline::issue_token;

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Management CLI for the API gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and print the gateway's aggregated health
    Health {
        #[arg(short, long, default_value = "http://localhost:8080")]
        url: String,
    },
    /// Mint a development bearer token
    Token {
        /// Gateway configuration supplying the secret and default lifetime
        #[arg(short, long, env = "GATEWAY_CONFIG")]
        config: Option<PathBuf>,

        #[arg(short, long, env = "GATEWAY_JWT_SECRET")]
        secret: Option<String>,

        #[arg(short, long)]
        user: String,

        /// Lifetime in seconds; defaults to `auth.jwt_expiry_secs`
        #[arg(long)]
        ttl: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Health { url } => {
            let res = reqwest::Client::new()
                .get(format!("{}/health", url.trim_end_matches('/')))
                .timeout(Duration::from_secs(10))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Token {
            config,
            secret,
            user,
            ttl,
        } => {
            let auth = match config {
                Some(path) => load_config(&path)?.auth,
                None => AuthConfig::default(),
            };
            let (secret, lifetime) = token_settings(&auth, secret, ttl)?;
            let token = issue_token(&secret, &user, lifetime)?;
            println!("{token}");
        }
    }

    Ok(())
}

/// Command-line values win over the configuration.
fn token_settings(auth: &AuthConfig, secret: Option<String>, ttl: Option<u64>) -> Result<(String, Duration), String> {
    let secret = secret
        .or_else(|| Some(auth.jwt_secret.clone()).filter(|s| !s.is_empty()))
        .ok_or("no signing secret: pass --secret, set GATEWAY_JWT_SECRET or use --config")?;
    let lifetime = ttl.map(Duration::from_secs).unwrap_or_else(|| auth.token_lifetime());
    Ok((secret, lifetime))
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: gateway returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(secret: &str, expiry: u64) -> AuthConfig {
        AuthConfig {
            jwt_secret: secret.to_string(),
            jwt_expiry_secs: expiry,
            ..AuthConfig::default()
        }
    }

    #[test]
    fn lifetime_defaults_to_configured_expiry() {
        let (secret, lifetime) = token_settings(&auth("from-config", 900), None, None).unwrap();
        assert_eq!(secret, "from-config");
        assert_eq!(lifetime, Duration::from_secs(900));
    }

    #[test]
    fn flags_override_config() {
        let (secret, lifetime) = token_settings(&auth("from-config", 900), Some("flag".into()), Some(60)).unwrap();
        assert_eq!(secret, "flag");
        assert_eq!(lifetime, Duration::from_secs(60));
    }

    #[test]
    fn missing_secret_is_an_error() {
        assert!(token_settings(&AuthConfig::default(), None, None).is_err());
    }
}
