// ABOUTME: Estimated spend per execution from the engine used, wall-clock time and memory ceiling
// ABOUTME: Feeds the daily usage ledger and the abuse monitor's cost threshold

use crate::settings::CostModel;
use crate::types::Engine;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    pub base_cost: f64,
    pub compute_cost: f64,
    pub memory_cost: f64,
    pub total_cost: f64,
}

#[derive(Debug, Clone)]
pub struct CostCalculator {
    model: CostModel,
}

impl CostCalculator {
    pub fn new(model: CostModel) -> Self {
        Self { model }
    }

    pub fn estimate(&self, engine: Engine, duration: Duration, memory_mb: u64) -> CostBreakdown {
        let mut breakdown = CostBreakdown::default();
        match engine {
            Engine::Light => {
                breakdown.base_cost = self.model.light_base;
            }
            Engine::Heavy => {
                let seconds = duration.as_secs_f64();
                let memory_gb = memory_mb as f64 / 1024.0;
                breakdown.base_cost = self.model.heavy_base;
                breakdown.compute_cost = self.model.heavy_per_second * seconds;
                breakdown.memory_cost = self.model.heavy_per_gb_second * memory_gb * seconds;
            }
        }
        breakdown.total_cost = breakdown.base_cost + breakdown.compute_cost + breakdown.memory_cost;
        breakdown
    }

    pub fn is_within_limit(&self, cost: f64, limit: f64) -> bool {
        cost <= limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator() -> CostCalculator {
        CostCalculator::new(CostModel {
            light_base: 0.0,
            heavy_base: 0.001,
            heavy_per_second: 0.01,
            heavy_per_gb_second: 0.002,
        })
    }

    #[test]
    fn test_light_costs_only_its_base() {
        let cost = calculator().estimate(Engine::Light, Duration::from_secs(30), 512);
        assert_eq!(cost, CostBreakdown::default());
    }

    #[test]
    fn test_heavy_scales_with_time_and_memory() {
        let cost = calculator().estimate(Engine::Heavy, Duration::from_secs(2), 512);
        assert!((cost.compute_cost - 0.02).abs() < 1e-12);
        assert!((cost.memory_cost - 0.002).abs() < 1e-12);
        assert!((cost.total_cost - 0.023).abs() < 1e-12);
    }

    #[test]
    fn test_is_within_limit() {
        let calculator = calculator();
        assert!(calculator.is_within_limit(5.0, 10.0));
        assert!(calculator.is_within_limit(10.0, 10.0));
        assert!(!calculator.is_within_limit(15.0, 10.0));
    }
}
