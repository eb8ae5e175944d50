// =============================================================================
// Simulation Manager — registry and control surface for all simulations
// =============================================================================
//
// Owns the engine registry, creates and deletes simulations, and forwards
// control operations with a hard 2 s deadline. Also implements `CandleSink`
// so the candle coordinator can write validated series back into the owning
// engine's price history without a concrete reference to it.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::candles::CandleCoordinator;
use crate::events::{CandleSink, EventSink};
use crate::pool::ObjectPool;
use crate::queue::TransactionQueue;
use crate::types::{Candle, Position, PriceUpdate, TpsMode, Trade};

use super::params::SimulationParameters;
use super::simulation::{
    CascadeOutcome, ControlError, ExternalTradeOutcome, ExternalTradeRequest, ReadyStatus,
    ResetOptions, SimulationEngine, SimulationSnapshot, SimulationSummary,
};

/// Deadline for control operations.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(2);

/// Failures a manager operation can surface to the API layer.
#[derive(Debug)]
pub enum ManagerError {
    NotFound(String),
    Control(ControlError),
    CapacityExceeded(usize),
}

impl std::fmt::Display for ManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "unknown simulation {id}"),
            Self::Control(e) => write!(f, "{e}"),
            Self::CapacityExceeded(max) => {
                write!(f, "simulation capacity reached ({max})")
            }
        }
    }
}

impl std::error::Error for ManagerError {}

impl From<ControlError> for ManagerError {
    fn from(e: ControlError) -> Self {
        Self::Control(e)
    }
}

/// Registry of live simulation engines plus the shared subsystems every
/// engine is wired to at creation.
pub struct SimulationManager {
    engines: RwLock<HashMap<String, Arc<SimulationEngine>>>,
    hub: Arc<dyn EventSink>,
    coordinator: Arc<CandleCoordinator>,
    queue: Arc<TransactionQueue>,
    trade_pool: Arc<ObjectPool<Trade>>,
    position_pool: Arc<ObjectPool<Position>>,
    price_update_pool: Arc<ObjectPool<PriceUpdate>>,
    max_simulations: usize,
    decision_workers: usize,
}

impl SimulationManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hub: Arc<dyn EventSink>,
        coordinator: Arc<CandleCoordinator>,
        queue: Arc<TransactionQueue>,
        trade_pool: Arc<ObjectPool<Trade>>,
        position_pool: Arc<ObjectPool<Position>>,
        price_update_pool: Arc<ObjectPool<PriceUpdate>>,
        max_simulations: usize,
        decision_workers: usize,
    ) -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
            hub,
            coordinator,
            queue,
            trade_pool,
            position_pool,
            price_update_pool,
            max_simulations,
            decision_workers,
        }
    }

    // ── Registry ────────────────────────────────────────────────────────

    /// Create a simulation from validated parameters.
    pub fn create(
        &self,
        params: SimulationParameters,
    ) -> Result<SimulationSnapshot, ManagerError> {
        params.validate().map_err(ControlError::Validation)?;

        {
            let engines = self.engines.read();
            if engines.len() >= self.max_simulations {
                return Err(ManagerError::CapacityExceeded(self.max_simulations));
            }
        }

        let engine = SimulationEngine::new(
            params,
            self.hub.clone(),
            self.coordinator.clone(),
            self.queue.clone(),
            self.trade_pool.clone(),
            self.position_pool.clone(),
            self.price_update_pool.clone(),
            self.decision_workers,
        );
        let snapshot = engine.snapshot();
        self.engines
            .write()
            .insert(engine.id().to_string(), engine);
        info!(simulation_id = %snapshot.id, "simulation registered");
        Ok(snapshot)
    }

    fn engine(&self, id: &str) -> Result<Arc<SimulationEngine>, ManagerError> {
        self.engines
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<SimulationSummary> {
        let mut summaries: Vec<SimulationSummary> = self
            .engines
            .read()
            .values()
            .map(|e| e.summary())
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn count(&self) -> usize {
        self.engines.read().len()
    }

    pub fn snapshot(&self, id: &str) -> Result<SimulationSnapshot, ManagerError> {
        Ok(self.engine(id)?.snapshot())
    }

    pub fn ready(&self, id: &str) -> Result<ReadyStatus, ManagerError> {
        Ok(self.engine(id)?.ready())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.engines.read().contains_key(id)
    }

    /// Delete a simulation, tearing down its coordinator and queue state.
    pub fn delete(&self, id: &str) -> Result<(), ManagerError> {
        let engine = {
            let mut engines = self.engines.write();
            engines
                .remove(id)
                .ok_or_else(|| ManagerError::NotFound(id.to_string()))?
        };
        engine.terminate();
        self.coordinator.remove(id);
        self.queue.remove_simulation(id);
        info!(simulation_id = %id, "simulation deleted");
        Ok(())
    }

    // ── Control operations (2 s deadline each) ──────────────────────────

    pub async fn start(&self, id: &str) -> Result<SimulationSnapshot, ManagerError> {
        let engine = self.engine(id)?;
        match tokio::time::timeout(CONTROL_TIMEOUT, engine.start()).await {
            Ok(result) => result.map_err(ManagerError::from)?,
            Err(_) => {
                warn!(simulation_id = %id, "start timed out");
                return Err(ManagerError::Control(ControlError::Timeout));
            }
        }
        Ok(engine.snapshot())
    }

    pub fn pause(&self, id: &str) -> Result<SimulationSnapshot, ManagerError> {
        let engine = self.engine(id)?;
        engine.pause()?;
        Ok(engine.snapshot())
    }

    pub fn reset(
        &self,
        id: &str,
        options: &ResetOptions,
    ) -> Result<SimulationSnapshot, ManagerError> {
        let engine = self.engine(id)?;
        engine.reset(options)?;
        Ok(engine.snapshot())
    }

    pub fn set_speed(&self, id: &str, speed: u32) -> Result<SimulationSnapshot, ManagerError> {
        let engine = self.engine(id)?;
        engine.set_speed(speed)?;
        Ok(engine.snapshot())
    }

    pub fn tps_mode(&self, id: &str) -> Result<TpsMode, ManagerError> {
        Ok(self.engine(id)?.tps_mode())
    }

    pub fn set_tps_mode(&self, id: &str, mode: TpsMode) -> Result<TpsMode, ManagerError> {
        let engine = self.engine(id)?;
        engine.set_tps_mode(mode);
        Ok(mode)
    }

    pub fn external_trade(
        &self,
        id: &str,
        request: &ExternalTradeRequest,
    ) -> Result<ExternalTradeOutcome, ManagerError> {
        Ok(self.engine(id)?.external_trade(request)?)
    }

    pub fn liquidation_cascade(&self, id: &str) -> Result<CascadeOutcome, ManagerError> {
        Ok(self.engine(id)?.liquidation_cascade()?)
    }

    /// Stop every simulation (process shutdown).
    pub fn shutdown(&self) {
        let engines: Vec<Arc<SimulationEngine>> =
            self.engines.read().values().cloned().collect();
        for engine in engines {
            engine.terminate();
        }
        info!("all simulations terminated");
    }
}

impl CandleSink for SimulationManager {
    fn publish_candles(&self, simulation_id: &str, candles: &[Candle]) {
        if let Ok(engine) = self.engine(simulation_id) {
            engine.publish_candles(candles);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEventSink;
    use crate::types::PriceRange;

    fn manager() -> SimulationManager {
        let hub: Arc<dyn EventSink> = Arc::new(NullEventSink);
        let coordinator = Arc::new(CandleCoordinator::new(hub.clone()));
        let queue = Arc::new(TransactionQueue::new(hub.clone()));
        let trade_pool = Arc::new(ObjectPool::new("trades", 2_000, 200));
        let position_pool = Arc::new(ObjectPool::new("positions", 1_000, 100));
        let price_update_pool = Arc::new(ObjectPool::new("price-updates", 500, 50));
        SimulationManager::new(
            hub,
            coordinator,
            queue,
            trade_pool,
            position_pool,
            price_update_pool,
            4,
            4,
        )
    }

    fn params() -> SimulationParameters {
        SimulationParameters {
            price_range: Some(PriceRange::Mid),
            ..SimulationParameters::default()
        }
    }

    #[test]
    fn create_list_get_delete() {
        let mgr = manager();
        let snapshot = mgr.create(params()).unwrap();
        assert_eq!(mgr.count(), 1);
        assert!(mgr.exists(&snapshot.id));

        let listed = mgr.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, snapshot.id);

        let fetched = mgr.snapshot(&snapshot.id).unwrap();
        assert_eq!(fetched.id, snapshot.id);

        mgr.delete(&snapshot.id).unwrap();
        assert_eq!(mgr.count(), 0);
        assert!(matches!(
            mgr.snapshot(&snapshot.id),
            Err(ManagerError::NotFound(_))
        ));
    }

    #[test]
    fn invalid_params_rejected() {
        let mgr = manager();
        let bad = SimulationParameters {
            duration: 1,
            ..SimulationParameters::default()
        };
        assert!(matches!(
            mgr.create(bad),
            Err(ManagerError::Control(ControlError::Validation(_)))
        ));
        assert_eq!(mgr.count(), 0);
    }

    #[test]
    fn capacity_is_enforced() {
        let mgr = manager();
        for _ in 0..4 {
            mgr.create(params()).unwrap();
        }
        assert!(matches!(
            mgr.create(params()),
            Err(ManagerError::CapacityExceeded(4))
        ));
    }

    #[test]
    fn unknown_id_is_not_found() {
        let mgr = manager();
        assert!(matches!(
            mgr.pause("nope"),
            Err(ManagerError::NotFound(_))
        ));
        assert!(matches!(
            mgr.ready("nope"),
            Err(ManagerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn lifecycle_through_manager() {
        let mgr = manager();
        let id = mgr.create(params()).unwrap().id;

        assert!(mgr.ready(&id).unwrap().ready);
        let started = mgr.start(&id).await.unwrap();
        assert!(started.is_running);

        let paused = mgr.pause(&id).unwrap();
        assert!(!paused.is_running);
        assert!(paused.is_paused);

        let reset = mgr.reset(&id, &ResetOptions::default()).unwrap();
        assert!(!reset.is_running);
        assert!(!reset.is_paused);
        assert!(reset.price_history.is_empty());

        mgr.delete(&id).unwrap();
    }

    #[tokio::test]
    async fn candle_sink_routes_to_engine() {
        let mgr = manager();
        let id = mgr.create(params()).unwrap().id;
        let candles = vec![Candle {
            timestamp: 0,
            open: 5.0,
            high: 5.5,
            low: 4.8,
            close: 5.2,
            volume: 10.0,
        }];
        mgr.publish_candles(&id, &candles);
        assert_eq!(mgr.snapshot(&id).unwrap().price_history.len(), 1);

        // Unknown ids are ignored rather than panicking.
        mgr.publish_candles("nope", &candles);
    }

    #[test]
    fn tps_mode_roundtrip() {
        let mgr = manager();
        let id = mgr.create(params()).unwrap().id;
        assert_eq!(mgr.tps_mode(&id).unwrap(), TpsMode::Normal);
        mgr.set_tps_mode(&id, TpsMode::Stress).unwrap();
        assert_eq!(mgr.tps_mode(&id).unwrap(), TpsMode::Stress);
    }
}
