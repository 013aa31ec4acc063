use anyhow::Result;
use axum::http::{header, Method};
use dotenv::dotenv;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use kinjo_api::config::AppConfig;
use kinjo_api::documents::{DocumentServiceClient, LibreOfficeConverter};
use kinjo_api::{
    auth::SupabaseAuth, enedis::EnedisClient, mailer::ResendMailer, observability::Observability,
    routes, services::Collaborators, services::ServiceSettings, state::AppState,
    storage::SupabaseStorage, store::PgStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv().ok();

    let obs = Observability::init()?;
    let config = AppConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.connection_string)
        .await?;

    sqlx::migrate!("../../database/migrations")
        .run(&pool)
        .await?;

    tracing::info!("Database connected and migrations applied");

    let timeout = config.http_timeout_secs;
    let document_service = Arc::new(DocumentServiceClient::new(
        config.documents.service_url.clone(),
        timeout,
    ));
    let services = Collaborators {
        store: Arc::new(PgStore::new(pool)),
        storage: Arc::new(SupabaseStorage::new(&config.supabase, timeout)),
        auth: Arc::new(SupabaseAuth::new(&config.supabase, timeout)),
        mailer: Arc::new(ResendMailer::new(&config.mail, timeout)),
        renderer: document_service.clone(),
        signer: document_service,
        converter: Arc::new(LibreOfficeConverter::new(
            config.documents.converter_bin.clone(),
            config.documents.conversion_timeout_secs,
        )),
        metering: Arc::new(EnedisClient::new(&config.enedis, timeout)),
        settings: ServiceSettings {
            temp_dir: config.documents.temp_dir.clone(),
            template_dir: config.documents.template_dir.clone(),
            backend_base_url: config.backend_base_url.clone(),
            signed_url_ttl_secs: config.signed_url_ttl_secs,
            mail_pacing_ms: config.mail.pacing_ms,
        },
    };

    let port = config.port;
    let state = AppState::new(services, config, obs.registry.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    let app = routes::app(state).layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    obs.shutdown();
    Ok(())
}
