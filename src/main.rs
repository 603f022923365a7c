use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use railfair::api::{self, fares_view::FareService, AppState};
use railfair::config::{Config, Credentials, PhaseConfig};
use railfair::ingest::PhaseRunner;
use railfair::providers::fares::{FareDecoder, FaresClient, FlowFileDecoder};
use railfair::providers::hsp::HspClient;
use railfair::stats::Aggregator;
use railfair::store::{PoolProfile, Store};

#[derive(Parser)]
#[command(name = "railfair")]
#[command(about = "UK rail delay prediction and fare comparison", long_about = None)]
struct Cli {
    /// Service configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API server.
    Serve,
    /// Run a batch collection phase against the HSP service.
    Ingest {
        /// Phase configuration file (routes, dates, pacing).
        phase_config: String,
    },
    /// Recompute route, operator, and time-slot statistics.
    Aggregate,
    /// Refresh the fare archive and reload the fare table.
    Fares,
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "RailFair API",
        description = "UK train delay prediction and fare comparison",
        version = "0.1.0"
    ),
    paths(
        railfair::api::health::health_check,
        railfair::api::predictions::predict_endpoint,
        railfair::api::feedback::submit_feedback,
        railfair::api::stats::usage_stats,
        railfair::api::stats::reset_rate_limit,
        railfair::api::routes::route_stops,
        railfair::api::routes::popular_routes,
    ),
    components(schemas(
        railfair::api::ErrorResponse,
        railfair::api::FieldError,
        railfair::api::MetricsSnapshot,
        railfair::api::health::HealthResponse,
        railfair::api::health::HealthComponents,
        railfair::api::predictions::PredictRequest,
        railfair::api::predictions::PredictionResponse,
        railfair::api::predictions::ResponseMetadata,
        railfair::api::feedback::FeedbackRequest,
        railfair::api::feedback::FeedbackResponse,
        railfair::api::stats::ResetResponse,
        railfair::api::routes::RouteStop,
        railfair::api::routes::RouteStopsResponse,
        railfair::api::routes::PopularRoute,
        railfair::api::routes::PopularRoutesResponse,
        railfair::api::fares_view::FareComparison,
        railfair::api::fares_view::FareView,
        railfair::api::recommend::Recommendation,
        railfair::api::recommend::RecommendationTag,
        railfair::predict::Prediction,
        railfair::predict::Confidence,
        railfair::predict::LadderLevel,
    )),
    tags(
        (name = "health", description = "Service health"),
        (name = "predictions", description = "Delay predictions and fares"),
        (name = "feedback", description = "Prediction feedback"),
        (name = "stats", description = "Usage statistics and admin"),
        (name = "routes", description = "Route information")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "railfair=info,tower_http=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = if std::path::Path::new(&cli.config).exists() {
        Config::load(&cli.config).with_context(|| format!("loading {}", cli.config))?
    } else {
        tracing::warn!(path = %cli.config, "Config file not found, using defaults");
        Config::default()
    };
    config.validate();

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Ingest { phase_config } => ingest(config, &phase_config).await,
        Commands::Aggregate => aggregate(config).await,
        Commands::Fares => refresh_fares(config).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    let store = Store::connect(&config.server.effective_database_path(), PoolProfile::Reader)
        .await
        .context("connecting to database")?;

    // Fares refresh inline only when credentials are present; otherwise the
    // endpoint serves whatever a previous `railfair fares` run stored.
    let fare_service = match Credentials::from_env() {
        Ok(credentials) => {
            let client = FaresClient::new(config.fares.clone(), credentials)
                .context("building fares client")?;
            let decoder: Box<dyn FareDecoder> = Box::new(FlowFileDecoder);
            FareService::new(store.clone(), Some((client, decoder)))
        }
        Err(_) => {
            tracing::warn!("No HSP credentials in environment, fare refresh disabled");
            FareService::read_only(store.clone())
        }
    };

    let state = AppState::new(store, fare_service, config.server.admin_token.clone());

    // Periodic housekeeping: expired cache rows and idle rate-limit clients.
    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
        interval.tick().await;
        loop {
            interval.tick().await;
            let pruned = sweep_state.cache.prune().await;
            let swept = sweep_state.rate_limiter.sweep();
            tracing::debug!(pruned, swept, "Housekeeping pass");
        }
    });

    let cors_layer = if config.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([axum::http::header::CONTENT_TYPE])
    };

    let app = api::router(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer);

    let port = config.server.effective_port();
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    tracing::info!(port, "RailFair API listening");
    tracing::info!("Swagger UI: http://localhost:{port}/swagger-ui");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
    })
    .await
    .context("serving")?;
    Ok(())
}

async fn ingest(config: Config, phase_config_path: &str) -> Result<()> {
    let phase = PhaseConfig::load(phase_config_path)
        .with_context(|| format!("loading {phase_config_path}"))?;
    let credentials = Credentials::from_env().context("reading HSP credentials")?;
    let store = Store::connect(&config.server.effective_database_path(), PoolProfile::Writer)
        .await
        .context("connecting to database")?;
    let client = HspClient::new(
        &config.hsp,
        credentials,
        phase.request_interval,
        phase.retry,
    )
    .context("building HSP client")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown requested, finishing in-flight task");
        let _ = signal_tx.send(true);
        // The in-flight task gets a grace window to commit; then we go.
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        tracing::error!("Clean shutdown window elapsed, forcing exit");
        std::process::exit(1);
    });

    let runner = PhaseRunner::new(client, store, phase);
    let summary = runner.run(shutdown_rx).await?;
    tracing::info!(
        completed = summary.completed,
        skipped = summary.skipped,
        failed = summary.failed,
        records = summary.records_written,
        interrupted = summary.interrupted,
        "Ingestion phase done"
    );
    Ok(())
}

async fn aggregate(config: Config) -> Result<()> {
    let store = Store::connect(&config.server.effective_database_path(), PoolProfile::Writer)
        .await
        .context("connecting to database")?;
    let summary = Aggregator::new(store).recompute().await?;
    tracing::info!(
        routes = summary.routes_computed,
        skipped = summary.routes_skipped,
        tocs = summary.tocs_computed,
        "Aggregation done"
    );
    Ok(())
}

async fn refresh_fares(config: Config) -> Result<()> {
    let credentials = Credentials::from_env().context("reading feed credentials")?;
    let store = Store::connect(&config.server.effective_database_path(), PoolProfile::Writer)
        .await
        .context("connecting to database")?;
    let client = FaresClient::new(config.fares, credentials).context("building fares client")?;

    let archive = client.ensure_fresh().await.context("fetching archive")?;
    let records = FlowFileDecoder.decode(&archive).context("decoding archive")?;
    let admissible: Vec<_> = records.into_iter().filter(|r| r.is_admissible()).collect();
    let written = store.upsert_fares(&admissible).await?;
    tracing::info!(written, admissible = admissible.len(), "Fare refresh done");
    Ok(())
}
