use crate::error::EngineError;
use async_trait::async_trait;
use configuration::DecisionSettings;
use core_types::{Balance, Decision, OpenOrder, OrderHistoryRecord, Phase, Position, Strategy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Standing instructions sent with every consultation.
pub const BASE_INSTRUCTIONS: &str = "Restore the declared strategy on the venue. \
     Answer with a JSON object {\"decisions\": [...]} using the listed actions only.";

/// Everything the provider sees about one strategy.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionContext {
    pub trader_id: String,
    pub strategy: Strategy,
    pub phase: Phase,
    pub balance: Balance,
    pub positions: Vec<Position>,
    pub open_orders: Vec<OpenOrder>,
    pub history: Vec<OrderHistoryRecord>,
    /// The rendered divergence report.
    pub report: String,
}

/// The external oracle that proposes corrective actions.
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn decide(
        &self,
        context: &DecisionContext,
        instructions: &str,
    ) -> Result<Vec<Decision>, EngineError>;
}

/// True when the answer proposes nothing to do.
pub fn is_decline(decisions: &[Decision]) -> bool {
    decisions.iter().all(|d| d.action.is_passive())
}

/// Always answers `hold`. Used when no provider endpoint is configured, which
/// leaves every confirmed divergence to the deterministic fallback.
#[derive(Debug, Default)]
pub struct DeclineProvider;

#[async_trait]
impl DecisionProvider for DeclineProvider {
    fn name(&self) -> &str {
        "decline"
    }

    async fn decide(
        &self,
        context: &DecisionContext,
        _instructions: &str,
    ) -> Result<Vec<Decision>, EngineError> {
        Ok(vec![Decision::hold(
            &context.strategy.symbol,
            "no decision provider configured",
        )])
    }
}

#[derive(Serialize)]
struct DecideRequest<'a> {
    context: &'a DecisionContext,
    instructions: &'a str,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DecideResponse {
    Wrapped { decisions: Vec<Decision> },
    Bare(Vec<Decision>),
}

/// Accepts `{"decisions": [...]}` or a bare array.
pub fn parse_decisions(body: &str) -> Result<Vec<Decision>, EngineError> {
    let parsed: DecideResponse = serde_json::from_str(body)?;
    Ok(match parsed {
        DecideResponse::Wrapped { decisions } | DecideResponse::Bare(decisions) => decisions,
    })
}

/// POSTs `{context, instructions}` as JSON and reads back decisions.
pub struct HttpDecisionProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDecisionProvider {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, EngineError> {
        if endpoint.trim().is_empty() {
            return Err(EngineError::Configuration(
                "decision endpoint must not be empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl DecisionProvider for HttpDecisionProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn decide(
        &self,
        context: &DecisionContext,
        instructions: &str,
    ) -> Result<Vec<Decision>, EngineError> {
        debug!(endpoint = %self.endpoint, strategy_id = %context.strategy.id, "consulting decision provider");
        let response = self
            .client
            .post(&self.endpoint)
            .json(&DecideRequest {
                context,
                instructions,
            })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(EngineError::DecisionProvider(format!(
                "HTTP {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        parse_decisions(&body)
    }
}

/// The HTTP provider when an endpoint is configured, the declining one otherwise.
pub fn provider_from_settings(
    settings: &DecisionSettings,
) -> Result<Arc<dyn DecisionProvider>, EngineError> {
    match settings.endpoint.as_deref() {
        Some(endpoint) if !endpoint.trim().is_empty() => {
            info!(endpoint, "using HTTP decision provider");
            Ok(Arc::new(HttpDecisionProvider::new(
                endpoint,
                settings.timeout(),
            )?))
        }
        _ => {
            info!("no decision endpoint configured, the deterministic fallback governs");
            Ok(Arc::new(DeclineProvider))
        }
    }
}
