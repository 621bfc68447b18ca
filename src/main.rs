use std::sync::Arc;

use htms_server::{config::Config, db, jobs, models::AppState, routes};

use htms_server::external::carrier::HttpShipmentCarrier;
use htms_server::external::notifier::HttpNotifier;
use htms_server::external::payment_gateway::HttpPaymentGateway;

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use axum::http::header;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env()?;
    let pool = db::connect_pg(&cfg.database_url).await?;

    let state = AppState {
        db: pool,
        gateway: Arc::new(HttpPaymentGateway::new(cfg.payment_gateway_url.clone())),
        carrier: Arc::new(HttpShipmentCarrier::new(cfg.carrier_url.clone())),
        notifier: Arc::new(HttpNotifier::new(cfg.notifier_url.clone())),
        config: cfg.clone(),
    };

    jobs::payment_sweep::spawn(state.clone());

    // DEV ONLY: allow browser/WebView clients to call the API.
    // This fixes OPTIONS preflight (CORS) that otherwise returns 405.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
        ]);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on http://{}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
