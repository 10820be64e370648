//! Configuration for the ledger engine.

use ledger_core::config as core_config;
use ledger_core::error::LedgerError;
use secrecy::Secret;
use std::env;

use crate::services::gateway::StripeConfig;
use crate::services::sequencer::NumberFormat;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub database: DatabaseConfig,
    pub stripe: StripeConfig,
    pub numbering: NumberingConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct NumberingConfig {
    pub invoice_prefix: String,
    pub pad_width: usize,
}

impl NumberingConfig {
    pub fn format(&self) -> NumberFormat {
        NumberFormat {
            prefix: self.invoice_prefix.clone(),
            pad_width: self.pad_width,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, LedgerError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "ledger-engine".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    LedgerError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            stripe: StripeConfig {
                secret_key: Secret::new(env::var("STRIPE_SECRET_KEY").unwrap_or_default()),
                webhook_secret: Secret::new(env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default()),
                api_base_url: env::var("STRIPE_API_BASE_URL")
                    .unwrap_or_else(|_| "https://api.stripe.com/v1".to_string()),
            },
            numbering: NumberingConfig {
                invoice_prefix: env::var("INVOICE_NUMBER_PREFIX")
                    .unwrap_or_else(|_| "INV-".to_string()),
                pad_width: env::var("INVOICE_NUMBER_PAD_WIDTH")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(6),
            },
        })
    }
}
