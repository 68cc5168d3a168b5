#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use configuration::settings::Config;
use core_types::{AddPoint, Decision, Direction, Strategy};
use database::MemoryStore;
use engine::decision::{DecisionContext, DecisionProvider};
use engine::{DeclineProvider, Engine, EngineError};
use executor::PaperVenue;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const TRADER: &str = "t-1";

pub fn config() -> Config {
    let mut config = Config::default();
    config.engine.trader_id = TRADER.to_string();
    config
}

/// Entry at 60000 with adds at 61000 and 62000, 30% each.
pub fn ladder() -> Strategy {
    Strategy {
        id: "s-1".to_string(),
        symbol: "BTCUSDT".to_string(),
        direction: Direction::Long,
        entry_price: dec!(60000),
        add_points: vec![
            AddPoint { price: dec!(61000), percent: dec!(0.3) },
            AddPoint { price: dec!(62000), percent: dec!(0.3) },
        ],
        stop_loss: dec!(58000),
        take_profits: vec![dec!(65000)],
        leverage: Some(10),
        rationale: "breakout retest".to_string(),
        received_at: Utc::now() - chrono::Duration::minutes(5),
    }
}

pub fn entry_only() -> Strategy {
    Strategy {
        add_points: vec![],
        ..ladder()
    }
}

pub struct Harness {
    pub venue: Arc<PaperVenue>,
    pub store: Arc<MemoryStore>,
    pub engine: Arc<Engine>,
}

pub fn harness_with(
    config: Config,
    balance: rust_decimal::Decimal,
    provider: Arc<dyn DecisionProvider>,
) -> Harness {
    let venue = Arc::new(PaperVenue::new(balance));
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new(config, venue.clone(), store.clone(), provider).unwrap();
    Harness {
        venue,
        store,
        engine: Arc::new(engine),
    }
}

pub fn harness() -> Harness {
    harness_with(config(), dec!(10000), Arc::new(DeclineProvider))
}

/// Answers from a fixed script, one entry per call. An exhausted script holds.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<Vec<Decision>, String>>>,
    pub instructions: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<Vec<Decision>, String>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            instructions: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.instructions.lock().unwrap().len()
    }
}

#[async_trait]
impl DecisionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn decide(
        &self,
        context: &DecisionContext,
        instructions: &str,
    ) -> Result<Vec<Decision>, EngineError> {
        self.instructions
            .lock()
            .unwrap()
            .push(instructions.to_string());
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(decisions)) => Ok(decisions),
            Some(Err(message)) => Err(EngineError::DecisionProvider(message)),
            None => Ok(vec![Decision::hold(&context.strategy.symbol, "script exhausted")]),
        }
    }
}
