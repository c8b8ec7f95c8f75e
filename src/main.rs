use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use callflow::api::{ApiState, api_routes};
use callflow::channels::{ChannelManager, GatewayChannel, PendingDeliveries, ScriptedChannel};
use callflow::config::{Config, GatewayConfig};
use callflow::orchestrator::{self, Orchestrator};
use callflow::session::ChannelKind;
use callflow::store::{Database, LibSqlBackend};
use callflow::survey::SurveyRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Invalid configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(&config);

    eprintln!("📞 Callflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api", config.api.port);
    eprintln!("   Database: {}", config.db_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Channels ─────────────────────────────────────────────────────────
    let pending = Arc::new(PendingDeliveries::new());
    let channels = build_channels(&config, &config.gateways, &pending)?;
    if channels.kinds().is_empty() {
        eprintln!("   Channels: none configured (set CALLFLOW_*_GATEWAY_URL or CALLFLOW_SIMULATE=1)");
    } else {
        let names: Vec<String> = channels.kinds().iter().map(ToString::to_string).collect();
        eprintln!("   Channels: {}", names.join(", "));
    }
    for (kind, health) in channels.health_check_all().await {
        if let Err(e) = health {
            tracing::warn!(channel = %kind, error = %e, "Channel health check failed");
        }
    }

    // ── Orchestrator ─────────────────────────────────────────────────────
    let surveys = Arc::new(SurveyRegistry::new(Arc::clone(&db)));
    let orchestrator = Orchestrator::new(
        config.orchestrator.clone(),
        Arc::clone(&db),
        surveys,
        channels,
    );

    let recovered = orchestrator
        .recover_interrupted()
        .await
        .context("Startup recovery failed")?;
    if recovered > 0 {
        eprintln!("   Recovered {} interrupted sessions", recovered);
    }

    let ticker = orchestrator::spawn_dispatch_ticker(
        orchestrator.clone(),
        config.orchestrator.dispatch_interval,
    );
    eprintln!(
        "   Dispatch: every {}s, max {} concurrent\n",
        config.orchestrator.dispatch_interval.as_secs(),
        config.orchestrator.max_concurrent_calls,
    );

    // ── Control API ──────────────────────────────────────────────────────
    let app = api_routes(ApiState {
        orchestrator,
        pending,
        bearer_token: config.api.bearer_token.clone(),
    })
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.api.port))
        .await
        .with_context(|| format!("Failed to bind API port {}", config.api.port))?;
    tracing::info!(port = config.api.port, "Control API started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
        .context("API server failed")?;

    // Live attempts are settled as interrupted on the next start.
    ticker.abort();
    tracing::info!("Shut down");
    Ok(())
}

fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "callflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

fn build_channels(
    config: &Config,
    gateways: &GatewayConfig,
    pending: &Arc<PendingDeliveries>,
) -> anyhow::Result<ChannelManager> {
    let mut channels = ChannelManager::new();

    if config.simulate {
        channels.register_all(Arc::new(ScriptedChannel::auto_answering()));
        eprintln!("   Simulation: scripted adapter answering on every channel");
    }

    let urls = [
        (ChannelKind::Voice, &gateways.voice_url),
        (ChannelKind::WhatsApp, &gateways.whatsapp_url),
        (ChannelKind::Sms, &gateways.sms_url),
    ];
    for (kind, url) in urls {
        if let Some(url) = url {
            let gateway = GatewayChannel::new(kind, url.clone(), Arc::clone(pending))
                .with_context(|| format!("Failed to create {kind} gateway"))?;
            channels.register(kind, Arc::new(gateway));
        }
    }

    Ok(channels)
}
