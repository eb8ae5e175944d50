// =============================================================================
// Server Configuration
// =============================================================================
//
// Process-level knobs come from the environment (via dotenv in main); all
// per-simulation parameters arrive through the REST API instead.
// =============================================================================

use serde::Serialize;

/// Runtime configuration for the server process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Address the API + WebSocket server binds to.
    pub bind_addr: String,
    /// Hard cap on concurrently existing simulations.
    pub max_simulations: usize,
    /// Worker pool size for high-speed trader decision rounds.
    pub decision_workers: usize,
}

impl ServerConfig {
    /// Build from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let bind_addr =
            std::env::var("VERTEX_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());

        let max_simulations = std::env::var("VERTEX_MAX_SIMULATIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(32);

        let decision_workers = std::env::var("VERTEX_DECISION_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(|w: usize| w.clamp(1, 8))
            .unwrap_or(8);

        Self {
            bind_addr,
            max_simulations,
            decision_workers,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3001".into(),
            max_simulations: 32,
            decision_workers: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert!(config.max_simulations > 0);
        assert!(config.decision_workers >= 1 && config.decision_workers <= 8);
    }
}
