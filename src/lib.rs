//! Pluct - a resilient CLI client for the Pluct Business Engine
//!
//! This library submits short-video URLs to the engine for transcription and
//! polls the job to completion. Every request passes through a local rate
//! limiter, a retry executor with exponential backoff, and a circuit
//! breaker; authentication uses short-lived signed user credentials plus a
//! cached, persisted service token.

pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod monitor;
pub mod output;
pub mod resilience;
pub mod workflow;

use std::sync::Arc;

pub use cli::{Cli, Commands, OutputFormat};
pub use client::{EngineApi, EngineClient, TranscriptionResult};
pub use config::Config;
pub use error::EngineError;
pub use workflow::{TranscriptionWorkflow, WorkflowEvent, WorkflowOutcome};

use auth::ServiceTokenCache;
use monitor::Metrics;
use resilience::{CircuitBreaker, ErrorCache, RateLimiter};

/// Everything one engine connection owns: client, caches, breaker, limiter,
/// and metrics. Built once per process and passed around explicitly so tests
/// can stand up isolated instances.
pub struct EngineContext {
    pub api: Arc<EngineClient>,
    pub tokens: Arc<ServiceTokenCache>,
    pub errors: Arc<ErrorCache>,
    pub metrics: Arc<Metrics>,
    config: Config,
}

impl EngineContext {
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let metrics = Arc::new(Metrics::new());
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let api = Arc::new(EngineClient::new(
            config.engine_settings(),
            config.retry.clone(),
            limiter,
            breaker,
            Arc::clone(&metrics),
        )?);
        let tokens = Arc::new(ServiceTokenCache::with_storage(Config::token_store_path()?));
        let errors = Arc::new(ErrorCache::default());
        Ok(Self { api, tokens, errors, metrics, config })
    }

    pub fn workflow(&self) -> TranscriptionWorkflow {
        TranscriptionWorkflow::new(
            Arc::clone(&self.api) as Arc<dyn EngineApi>,
            Arc::clone(&self.tokens),
            Arc::clone(&self.errors),
            self.config.workflow.clone(),
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
