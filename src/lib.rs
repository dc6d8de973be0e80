pub mod api;
pub mod auth;
pub mod config;
pub mod course;
pub mod db;
pub mod enrollment;
pub mod error;
pub mod mail;
pub mod payment;
pub mod user;
pub mod utils;

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::{auth::TokenKeys, config::Config, mail::Mailer, payment::PaymentService};

/// Everything a request handler needs
pub struct AppState {
    pub database: SqlitePool,
    pub config: Config,
    pub tokens: TokenKeys,
    pub payments: PaymentService,
}

impl AppState {
    pub fn new(
        database: SqlitePool,
        config: Config,
        jwt_secret: &[u8],
        mailer: Arc<dyn Mailer>,
    ) -> Arc<Self> {
        let tokens = TokenKeys::new(jwt_secret, config.auth.token_ttl());
        let payments = PaymentService::new(database.clone(), mailer, config.otp.clone());
        Arc::new(Self {
            database,
            config,
            tokens,
            payments,
        })
    }
}
