pub mod auth;
pub mod backoff;
pub mod config;
pub mod consent_handlers;
pub mod documents;
pub mod enedis;
pub mod error;
pub mod handlers;
pub mod http;
pub mod invoice_handlers;
pub mod mailer;
pub mod metering_handlers;
pub mod metrics;
pub mod observability;
pub mod operation_handlers;
pub mod outbox;
pub mod routes;
pub mod services;
pub mod signature_handlers;
pub mod state;
pub mod storage;
pub mod store;
pub mod waiver_handlers;
