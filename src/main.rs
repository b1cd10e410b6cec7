use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use http::HeaderValue;
use tokio::{signal, sync::mpsc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use marketplace_checkout as api;
use api::{
    notifications::{LogMailer, Mailer},
    payments::{PaymentGateway, StripeGateway},
    session_store::{InMemorySessionStore, RedisSessionStore, SessionStore},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(&cfg.log_level, cfg.log_json);
    api::handlers::health::init_start_time();

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    // Session store; the Redis backend is mandatory outside explicit in-memory mode
    let sessions: Arc<dyn SessionStore> = if cfg.uses_in_memory_sessions() {
        warn!("Using in-memory payment session store; sessions are lost on restart");
        Arc::new(InMemorySessionStore::new())
    } else {
        let store = RedisSessionStore::connect(cfg.redis_url())
            .await
            .context("failed to connect payment session store")?;
        Arc::new(store)
    };

    let gateway: Option<Arc<dyn PaymentGateway>> = match cfg.stripe_secret_key.as_deref() {
        Some(key) => Some(Arc::new(StripeGateway::new(cfg.stripe_api_base.clone(), key)?)),
        None => {
            warn!("No payment processor key configured; payment intents are disabled");
            None
        }
    };

    let webhook_verifier = match cfg.payment_webhook_secret.clone() {
        Some(secret) => Some(api::webhooks::WebhookVerifier::new(
            secret,
            cfg.payment_webhook_tolerance_secs,
        )),
        None => {
            warn!("No payment webhook secret configured; webhook deliveries will be rejected");
            None
        }
    };

    // Init events
    let (event_tx, event_rx) = mpsc::channel(1024);
    let event_sender = api::events::EventSender::new(event_tx);
    tokio::spawn(api::events::process_events(event_rx));

    let mailer: Arc<dyn Mailer> = Arc::new(LogMailer);

    // Aggregate app services used by HTTP handlers
    let services = api::handlers::AppServices::new(
        &cfg,
        db_arc.clone(),
        sessions.clone(),
        gateway,
        mailer,
        event_sender.clone(),
    );

    // Compose shared app state
    let app_state = api::AppState {
        db: db_arc,
        config: cfg.clone(),
        event_sender,
        sessions,
        jwt: Arc::new(api::auth::JwtAuth::new(&cfg.jwt_secret)),
        webhook_verifier,
        services,
    };

    // Build CORS layer from config
    let origins: Vec<HeaderValue> = cfg
        .cors_origins()
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    let cors_layer = if !origins.is_empty() {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    } else if cfg.is_development() {
        info!("Using permissive CORS because explicit origins were not configured (development environment)");
        CorsLayer::permissive()
    } else {
        error!("Missing CORS configuration detected; set APP__CORS_ALLOWED_ORIGINS");
        return Err("Missing CORS configuration: set APP__CORS_ALLOWED_ORIGINS".into());
    };

    let app = api::app_router(app_state).layer(cors_layer);

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid listen address")?;
    info!("marketplace-checkout listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
