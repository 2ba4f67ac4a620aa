// ██████╗ ██╗     ███████╗██╗   ██╗███████╗██████╗
// ██╔══██╗██║     ██╔════╝██║   ██║██╔════╝██╔══██╗
// ██████╔╝██║     █████╗  ██║   ██║█████╗  ██████╔╝
// ██╔══██╗██║     ██╔══╝  ╚██╗ ██╔╝██╔══╝  ██╔══██╗
// ██████╔╝███████╗███████╗ ╚████╔╝ ███████╗██║  ██║
// ╚═════╝ ╚══════╝╚══════╝  ╚═══╝  ╚══════╝╚═╝  ╚═╝
//
// G A T E W A Y
//
// Sits in front of the BLever.AI frontend. Every request is classified
// before a page renders; the ones that pass are proxied through with the
// caller's identity attached.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use blever_gateway::config::Config;
use blever_gateway::gate::middleware::GateState;
use blever_gateway::gate::session::IdentityClient;
use blever_gateway::metrics::GatewayMetrics;
use blever_gateway::routes::{self, AppState};
use blever_gateway::trackers::TrackerRegistry;
use blever_gateway::webhook::WebhookVerifier;

fn print_banner() {
    let banner = r#"

    ╔══════════════════════════════════════════════════════════════╗
    ║                                                              ║
    ║        ██████╗ ██╗     ███████╗██╗   ██╗███████╗██████╗      ║
    ║        ██╔══██╗██║     ██╔════╝██║   ██║██╔════╝██╔══██╗     ║
    ║        ██████╔╝██║     █████╗  ██║   ██║█████╗  ██████╔╝     ║
    ║        ██╔══██╗██║     ██╔══╝  ╚██╗ ██╔╝██╔══╝  ██╔══██╗     ║
    ║        ██████╔╝███████╗███████╗ ╚████╔╝ ███████╗██║  ██║     ║
    ║        ╚═════╝ ╚══════╝╚══════╝  ╚═══╝  ╚══════╝╚═╝  ╚═╝     ║
    ║                                                              ║
    ║                 ESG PLATFORM ACCESS GATEWAY                  ║
    ║                                                              ║
    ║   Gate:     anonymous | no org | pending | authorized        ║
    ║   Identity: session introspection + signed webhooks          ║
    ║   Upstream: frontend proxy, backend API, scoring trackers    ║
    ║                                                              ║
    ╚══════════════════════════════════════════════════════════════╝

    "#;
    println!("{}", banner);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("BLEVER_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .with_target(true)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(true)
            .init();
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    if std::env::var("BLEVER_NO_BANNER").is_err() {
        print_banner();
    }

    info!("🚪 BLever gateway initializing...");

    let config = Arc::new(Config::from_env());
    info!(
        bind = %config.bind_addr,
        frontend = %config.frontend_url,
        backend = %config.api_base_url,
        "✅ Configuration loaded"
    );
    if config.identity_secret_key.is_empty() {
        warn!("BLEVER_IDENTITY_SECRET_KEY is empty, every session lookup will fail closed");
    }

    let metrics = Arc::new(GatewayMetrics::new());

    let http = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .user_agent(concat!("blever-gateway/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("building backend HTTP client")?;
    let upstream = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(config.request_timeout)
        .build()
        .context("building frontend HTTP client")?;

    let identity = Arc::new(IdentityClient::new(
        http.clone(),
        &config.identity_api_url,
        &config.identity_secret_key,
    ));

    let webhook = match config.webhook_secret.as_deref() {
        Some(secret) => Some(Arc::new(
            WebhookVerifier::from_secret(secret).context("BLEVER_WEBHOOK_SECRET is not valid")?,
        )),
        None => {
            warn!("No webhook secret configured, identity webhooks will be refused");
            None
        }
    };
    info!("✅ Identity provider client online");

    let trackers = Arc::new(TrackerRegistry::new(
        http.clone(),
        &config.api_base_url,
        &config.identity_api_url,
        &config.identity_secret_key,
        config.tracker_config(),
        config.upload_limits(),
        config.tracker_idle,
    ));
    info!(
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        max_files = config.max_files,
        "✅ Scoring trackers ready"
    );

    let gate = GateState {
        policy: Arc::new(config.gate_policy()),
        resolver: identity.clone(),
        session_cookie: config.session_cookie.clone(),
        metrics: metrics.clone(),
    };
    let state = AppState {
        api_base_url: config.api_base_url.clone(),
        frontend_url: config.frontend_url.clone(),
        backend: http,
        upstream,
        metrics: metrics.clone(),
        directory: identity,
        webhook,
        trackers,
    };
    let app = routes::router(state, gate);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;

    info!("═══════════════════════════════════════════════════════");
    info!("  🟢 BLEVER GATEWAY ACTIVE on {}", config.bind_addr);
    info!("  📊 Metrics at /_gateway/metrics");
    info!("  ⚡ Press Ctrl+C for graceful shutdown");
    info!("═══════════════════════════════════════════════════════");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server failed")?;

    let snap = metrics.snapshot();
    info!(
        requests = snap.requests_total,
        redirects = snap.redirects_sign_in + snap.redirects_organization_selection + snap.redirects_approval,
        "💤 BLever gateway: OFFLINE"
    );
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => warn!("🛑 Shutdown signal received, draining connections"),
        Err(err) => error!("❌ Signal listener error: {}", err),
    }
}
