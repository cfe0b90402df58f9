//! CLI subcommand implementations

pub mod admin;
pub mod run;
pub mod status;

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use trailguard::config::Config;
use trailguard::engine::Engine;
use trailguard::exchange::rest::{Credentials, RestVenue, RestVenueConfig};
use trailguard::exchange::sim::PaperVenue;
use trailguard::exchange::{Endpoint, EndpointLimit, ExchangeAdapter, RateLimitPolicy, RetryPolicy};
use trailguard::orchestrator::Orchestrator;
use trailguard::portfolio::PortfolioManager;
use trailguard::store::Store;
use trailguard::Symbol;

/// Shared rate-limit policy built from the exchange config.
fn rate_limits(config: &Config) -> RateLimitPolicy {
    RateLimitPolicy::new([
        (
            Endpoint::Orders,
            EndpointLimit::per_second(config.exchange.orders_rate_limit as usize),
        ),
        (
            Endpoint::Cancel,
            EndpointLimit::per_second(config.exchange.orders_rate_limit as usize),
        ),
        (
            Endpoint::Status,
            EndpointLimit::per_second(config.exchange.reads_rate_limit as usize),
        ),
        (
            Endpoint::MarketData,
            EndpointLimit::per_second(config.exchange.reads_rate_limit as usize),
        ),
    ])
}

fn rest_venue(config: &Config, credentials: Credentials) -> RestVenue {
    RestVenue::new(
        credentials,
        RestVenueConfig {
            base_url: config.exchange.base_url.clone(),
            timeout: Duration::from_secs(config.exchange.request_timeout_secs),
            retry: RetryPolicy {
                max_retries: config.exchange.max_retries,
                ..RetryPolicy::default()
            },
            max_rate_limit_wait: Duration::from_secs(2),
        },
        rate_limits(config),
    )
}

/// Venue selection: the real exchange, or live market data over a simulated
/// order book for paper trading (which only touches public endpoints and
/// needs no credentials).
pub(crate) fn build_venue(config: &Config, paper: bool) -> Result<Arc<dyn ExchangeAdapter>> {
    let credentials = match (&config.exchange.api_key, &config.exchange.api_secret) {
        (Some(key), Some(secret)) => Credentials::new(key, secret),
        _ if paper => Credentials::new("", ""),
        _ => Credentials::from_env().context(
            "API credentials missing: set TRAILGUARD_API_KEY / TRAILGUARD_API_SECRET",
        )?,
    };
    let rest = Arc::new(rest_venue(config, credentials));
    if paper {
        Ok(Arc::new(PaperVenue::new(rest)))
    } else {
        Ok(rest)
    }
}

/// Wire up the store, portfolio, engines, and orchestrator from config.
pub(crate) fn build_orchestrator(
    config: &Config,
    venue: Arc<dyn ExchangeAdapter>,
) -> Result<(Orchestrator, Store, Arc<Mutex<PortfolioManager>>)> {
    let store = Store::open(config.state_db_path())?;

    let mut portfolio = PortfolioManager::new(config.portfolio.clone());
    for pair in &config.pairs {
        portfolio.register_pair(
            Symbol::new(&pair.product_id),
            pair.correlation_group.clone(),
            pair.target_allocation_pct,
        );
    }
    let portfolio = Arc::new(Mutex::new(portfolio));

    let mut orchestrator = Orchestrator::new(Arc::clone(&portfolio));
    for pair in &config.pairs {
        orchestrator.register(Engine::new(
            Symbol::new(&pair.product_id),
            config.strategy.clone(),
            Arc::clone(&venue),
            store.clone(),
            Arc::clone(&portfolio),
        ));
    }
    Ok((orchestrator, store, portfolio))
}
