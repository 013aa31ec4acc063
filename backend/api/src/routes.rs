use axum::{
    extract::MatchedPath,
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use std::time::Instant;

use crate::{
    consent_handlers, handlers, invoice_handlers, metering_handlers, metrics, operation_handlers,
    signature_handlers, state::AppState, waiver_handlers,
};

pub fn observability_routes() -> Router<AppState> {
    Router::new().route("/metrics", get(handlers::metrics))
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(handlers::health_check))
}

pub fn signature_routes() -> Router<AppState> {
    Router::new()
        .route("/generate", post(signature_handlers::sign_consumer_contract))
        .route(
            "/signature-producteur",
            post(signature_handlers::sign_producer_contract),
        )
        .route(
            "/contrats/:id/statut",
            get(signature_handlers::preview_contract_status),
        )
}

pub fn invoice_routes() -> Router<AppState> {
    Router::new()
        .route("/factures/generate", post(invoice_handlers::generate_invoice))
        .route(
            "/factures/operation",
            post(invoice_handlers::generate_operation_invoices),
        )
        .route("/factures/:id", get(invoice_handlers::download_invoice))
}

pub fn metering_routes() -> Router<AppState> {
    Router::new().route("/enedis/fetch", post(metering_handlers::fetch_consumption))
}

pub fn authorization_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/autorisations/renoncement-droit-retractation",
            post(waiver_handlers::record_retraction_waiver),
        )
        .route(
            "/autorisations/acceptation-cgu",
            post(consent_handlers::accept_terms),
        )
        .route(
            "/autorisations/autorisation-communication",
            post(consent_handlers::authorize_data_sharing),
        )
        .route(
            "/dac/autorisation-communication",
            post(consent_handlers::authorize_data_sharing),
        )
        .route(
            "/autorisations/accord-participation-acc",
            post(consent_handlers::agree_participation),
        )
        .route(
            "/autorisations/autorisation-participation-acc",
            post(consent_handlers::authorize_participation),
        )
}

pub fn operation_routes() -> Router<AppState> {
    Router::new().route(
        "/operations/date-demarrage-notification",
        post(operation_handlers::confirm_start_date),
    )
}

/// Every route, the fallback and the request logger, bound to `state`.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(signature_routes())
        .merge(invoice_routes())
        .merge(metering_routes())
        .merge(authorization_routes())
        .merge(operation_routes())
        .merge(health_routes())
        .merge(observability_routes())
        .fallback(handlers::route_not_found)
        .layer(middleware::from_fn(request_logger))
        .with_state(state)
}

async fn request_logger(req: Request<axum::body::Body>, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();

    let response = next.run(req).await;

    let elapsed = start.elapsed();
    let status = response.status().as_u16();
    metrics::observe_http(method.as_str(), &path, status, elapsed.as_secs_f64());
    tracing::info!("{method} {uri} {status} {}ms", elapsed.as_millis());

    response
}
