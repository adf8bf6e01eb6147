use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "burnlink", about = "burnlink: one-time secret links", version)]
struct Cli {
    /// burnlink server URL (default: http://localhost:8080 or $BURNLINK_SERVER)
    #[arg(long, env = "BURNLINK_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Value for the X-Origin-Verify header when the server requires one
    #[arg(long, env = "BURNLINK_ORIGIN_SECRET", hide_env_values = true)]
    origin_secret: Option<String>,

    /// reCAPTCHA token sent with state-changing requests, when the server checks for bots
    #[arg(long, env = "BURNLINK_RECAPTCHA_TOKEN", hide_env_values = true)]
    recaptcha_token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the burnlink HTTP server
    Serve {
        /// Port to listen on (default: $BURNLINK_PORT or 8080)
        #[arg(long, env = "BURNLINK_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $BURNLINK_HOST or 0.0.0.0)
        #[arg(long, env = "BURNLINK_HOST", default_value = "0.0.0.0")]
        host: String,
        /// Directory holding burnlink.db and blobs
        #[arg(long, env = "BURNLINK_DATA_DIR")]
        data_dir: Option<PathBuf>,
        /// How often expired and consumed shares are swept, e.g. 5m, 1h
        #[arg(long, env = "BURNLINK_SWEEP_INTERVAL", default_value = "1h")]
        sweep_interval: String,
    },
    /// Run one sweep pass against a local data directory
    Sweep {
        #[arg(long, env = "BURNLINK_DATA_DIR")]
        data_dir: Option<PathBuf>,
    },
    /// Show download statistics
    Stats,
    /// Show public metadata for a share
    Info {
        /// Share id (UUID or 6-digit PIN id)
        id: String,
    },
    /// Report a share for abuse
    Report {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("BURNLINK_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let api = Api::new(&cli.server, cli.origin_secret.clone(), cli.recaptcha_token.clone())?;

    match cli.command {
        Commands::Serve {
            port,
            host,
            data_dir,
            sweep_interval,
        } => cmd_serve(host, port, data_dir, &sweep_interval).await,
        Commands::Sweep { data_dir } => cmd_sweep(data_dir),
        Commands::Stats => cmd_stats(&api).await,
        Commands::Info { id } => cmd_info(&api, &id).await,
        Commands::Report { id, reason } => cmd_report(&api, &id, reason.as_deref()).await,
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(
    host: String,
    port: u16,
    data_dir: Option<PathBuf>,
    sweep_interval: &str,
) -> Result<()> {
    let cfg = burnlink_server::ServerConfig {
        host,
        port,
        data_dir,
        sweep_interval: parse_duration(sweep_interval)?,
        ..Default::default()
    };
    burnlink_server::run(cfg).await
}

fn cmd_sweep(data_dir: Option<PathBuf>) -> Result<()> {
    let data_dir = burnlink_server::resolve_data_dir(data_dir.as_ref())?;
    let cfg = burnlink_server::ServerConfig::default();
    let public_url = cfg
        .public_url
        .unwrap_or_else(|| format!("http://localhost:{}", cfg.port));
    let services = burnlink_server::open_services(&data_dir, &public_url, cfg.lifecycle)
        .with_context(|| format!("open data dir {}", data_dir.display()))?;

    let report = services.sweeper.sweep().context("sweep")?;
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

async fn cmd_stats(api: &Api) -> Result<()> {
    let json = api.send(api.get("/stats")).await?;
    let downloads = json["downloads"].as_u64().unwrap_or(0);
    let bytes = json["total_bytes"].as_u64().unwrap_or(0);
    println!("{downloads} download(s), {} transferred", format_bytes(bytes));
    Ok(())
}

async fn cmd_info(api: &Api, id: &str) -> Result<()> {
    let json = api.send(api.get(&format!("/shares/{id}"))).await?;
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let expires = json["expires_at"].as_i64().unwrap_or(0);
    let ttl_info = if expires > now {
        format!("expires in {}", format_duration((expires - now) as u64))
    } else {
        "expired".to_owned()
    };

    println!("  id:         {}", json["file_id"].as_str().unwrap_or(id));
    println!("  type:       {}", json["content_type"].as_str().unwrap_or("?"));
    println!("  size:       {}", format_bytes(json["file_size"].as_u64().unwrap_or(0)));
    println!("  access:     {}", json["access_mode"].as_str().unwrap_or("?"));
    println!("  available:  {}", json["available"].as_bool().unwrap_or(false));
    println!("  lifetime:   {ttl_info}");
    if let Some(count) = json["download_count"].as_u64() {
        println!("  downloads:  {count}");
    }
    Ok(())
}

async fn cmd_report(api: &Api, id: &str, reason: Option<&str>) -> Result<()> {
    let body = serde_json::json!({ "reason": reason });
    let json = api
        .send(api.post(&format!("/shares/{id}/report")).json(&body))
        .await?;
    println!(
        "✓ reported {id} ({} report(s))",
        json["report_count"].as_u64().unwrap_or(0)
    );
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

struct Api {
    client: Client,
    base: String,
    origin_secret: Option<String>,
    recaptcha_token: Option<String>,
}

impl Api {
    fn new(
        server: &str,
        origin_secret: Option<String>,
        recaptcha_token: Option<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            client,
            base: server.trim_end_matches('/').to_owned(),
            origin_secret,
            recaptcha_token,
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.with_origin(self.client.get(format!("{}{path}", self.base)))
    }

    /// POST routes sit behind the bot gate as well as the origin gate.
    fn post(&self, path: &str) -> RequestBuilder {
        let req = self.with_origin(self.client.post(format!("{}{path}", self.base)));
        match &self.recaptcha_token {
            Some(token) => req.header("x-recaptcha-token", token),
            None => req,
        }
    }

    fn with_origin(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.origin_secret {
            Some(secret) => req.header("x-origin-verify", secret),
            None => req,
        }
    }

    /// Send and decode the JSON body, turning the error envelope into an error.
    async fn send(&self, req: RequestBuilder) -> Result<Value> {
        let resp = req.send().await.context("HTTP request failed")?;
        let status = resp.status();
        let json: Value = resp.json().await.unwrap_or_default();
        if !status.is_success() {
            let error = json["error"].as_str().unwrap_or("unknown error");
            match json["code"].as_str() {
                Some(code) => anyhow::bail!("server returned {status} ({code}): {error}"),
                None => anyhow::bail!("server returned {status}: {error}"),
            }
        }
        Ok(json)
    }
}

/// Parse human duration strings like "1h", "30m", "5s".
fn parse_duration(s: &str) -> Result<Duration> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    let d: Duration = d.into();
    if d.is_zero() {
        anyhow::bail!("duration must be positive: {s}");
    }
    Ok(d)
}

fn format_duration(secs: u64) -> String {
    if secs >= 86400 {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_human_durations() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("0s").is_err());
    }

    #[test]
    fn formats_sizes_and_durations() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
        assert_eq!(format_duration(90), "1m");
        assert_eq!(format_duration(7200), "2h");
        assert_eq!(format_duration(2 * 86400), "2d");
    }

    #[test]
    fn post_carries_gate_headers() {
        let api = Api::new(
            "http://localhost:8080/",
            Some("edge".into()),
            Some("tok".into()),
        )
        .unwrap();
        let req = api.post("/shares/123456/report").build().unwrap();
        assert_eq!(req.url().as_str(), "http://localhost:8080/shares/123456/report");
        assert_eq!(req.headers()["x-origin-verify"], "edge");
        assert_eq!(req.headers()["x-recaptcha-token"], "tok");

        let get = api.get("/stats").build().unwrap();
        assert!(get.headers().get("x-recaptcha-token").is_none());

        let bare = Api::new("http://localhost:8080", None, None).unwrap();
        let req = bare.post("/shares/123456/report").build().unwrap();
        assert!(req.headers().get("x-origin-verify").is_none());
        assert!(req.headers().get("x-recaptcha-token").is_none());
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["burnlink", "report", "abc", "--reason", "spam"]).unwrap();
        match cli.command {
            Commands::Report { id, reason } => {
                assert_eq!(id, "abc");
                assert_eq!(reason.as_deref(), Some("spam"));
            }
            _ => panic!("expected report"),
        }
    }
}
