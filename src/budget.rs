//! Per-provider budget ceilings.
//!
//! The runner reports the winning call's cost after each successful run.
//! A breached ceiling with `allow_overrun=false` demotes the run to a
//! `guard_violation` failure carrying a `stop_reason`; with overruns allowed
//! the breach is logged and the response returned anyway.

use chrono::NaiveDate;
use dashmap::DashMap;
use tracing::warn;

use crate::config::BudgetConfig;

/// Outcome of consulting the budget manager with an observed cost.
#[derive(Debug, Clone, Default)]
pub struct BudgetDecision {
    /// Present when the run must abort.
    pub stop_reason: Option<String>,
    /// All breach messages, also present when overruns are allowed.
    pub messages: Vec<String>,
}

impl BudgetDecision {
    pub fn breached(&self) -> bool {
        !self.messages.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct DailySpend {
    day: NaiveDate,
    spent_usd: f64,
}

/// Tracks per-provider spend and enforces run/daily ceilings.
pub struct BudgetManager {
    config: BudgetConfig,
    ledger: DashMap<String, DailySpend>,
}

impl BudgetManager {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            ledger: DashMap::new(),
        }
    }

    fn today() -> NaiveDate {
        chrono::Utc::now().date_naive()
    }

    /// Run-level ceiling for a provider; zero means unlimited.
    pub fn run_budget(&self, provider: &str) -> f64 {
        self.config
            .run_budget_usd
            .get(provider)
            .copied()
            .unwrap_or(self.config.default_run_budget_usd)
    }

    /// Daily ceiling for a provider; zero means unlimited.
    pub fn daily_budget(&self, provider: &str) -> f64 {
        self.config
            .daily_budget_usd
            .get(provider)
            .copied()
            .unwrap_or(self.config.default_daily_budget_usd)
    }

    pub fn spent_today(&self, provider: &str) -> f64 {
        let today = Self::today();
        self.ledger
            .get(provider)
            .filter(|entry| entry.day == today)
            .map(|entry| entry.spent_usd)
            .unwrap_or(0.0)
    }

    /// Record a cost against today's ledger; returns false when the daily
    /// ceiling is now exceeded.
    pub fn notify_cost(&self, provider: &str, cost_usd: f64) -> bool {
        let today = Self::today();
        let mut entry = self.ledger.entry(provider.to_string()).or_insert(DailySpend {
            day: today,
            spent_usd: 0.0,
        });
        if entry.day != today {
            entry.day = today;
            entry.spent_usd = 0.0;
        }
        entry.spent_usd += cost_usd;
        let daily_limit = self.daily_budget(provider);
        daily_limit <= 0.0 || entry.spent_usd <= daily_limit
    }

    /// Evaluate an observed cost against both ceilings.
    pub fn evaluate(&self, provider: &str, cost_usd: f64) -> BudgetDecision {
        let run_limit = self.run_budget(provider);
        let run_hit = run_limit > 0.0 && cost_usd > run_limit;
        let daily_ok = self.notify_cost(provider, cost_usd);

        let mut messages = Vec::new();
        let mut run_reason = None;
        if run_hit {
            let reason = format!(
                "provider={provider} run budget {run_limit:.4} USD exceeded (cost={cost_usd:.4} USD)"
            );
            run_reason = Some(reason.clone());
            messages.push(reason);
        }
        let mut daily_reason = None;
        if !daily_ok {
            let reason = format!(
                "provider={provider} daily budget {:.4} USD exceeded (spent={:.4} USD)",
                self.daily_budget(provider),
                self.spent_today(provider),
            );
            daily_reason = Some(reason.clone());
            messages.push(reason);
        }

        let stop_reason = if self.config.allow_overrun {
            if !messages.is_empty() {
                warn!("budget overrun allowed: {}", messages.join(" | "));
            }
            None
        } else {
            daily_reason.or(run_reason)
        };

        BudgetDecision {
            stop_reason,
            messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn manager(run: f64, daily: f64, allow_overrun: bool) -> BudgetManager {
        BudgetManager::new(BudgetConfig {
            default_run_budget_usd: run,
            default_daily_budget_usd: daily,
            run_budget_usd: HashMap::new(),
            daily_budget_usd: HashMap::new(),
            allow_overrun,
        })
    }

    #[test]
    fn test_unlimited_by_default() {
        let manager = manager(0.0, 0.0, false);
        let decision = manager.evaluate("alpha", 125.0);
        assert!(!decision.breached());
        assert!(decision.stop_reason.is_none());
    }

    #[test]
    fn test_run_budget_breach_stops_run() {
        let manager = manager(0.01, 0.0, false);
        let decision = manager.evaluate("alpha", 0.02);
        assert!(decision.breached());
        let reason = decision.stop_reason.expect("stop_reason on breach");
        assert!(reason.contains("run budget"));
        assert!(reason.contains("alpha"));
    }

    #[test]
    fn test_daily_budget_accumulates() {
        let manager = manager(0.0, 0.05, false);
        assert!(manager.evaluate("alpha", 0.03).stop_reason.is_none());
        let decision = manager.evaluate("alpha", 0.03);
        assert!(decision
            .stop_reason
            .expect("daily breach")
            .contains("daily budget"));
        assert!(manager.spent_today("alpha") > 0.05);
    }

    #[test]
    fn test_daily_reason_preferred_over_run_reason() {
        let manager = manager(0.01, 0.01, false);
        let decision = manager.evaluate("alpha", 0.02);
        assert_eq!(decision.messages.len(), 2);
        assert!(decision.stop_reason.unwrap().contains("daily budget"));
    }

    #[test]
    fn test_allow_overrun_records_but_continues() {
        let manager = manager(0.01, 0.0, true);
        let decision = manager.evaluate("alpha", 0.02);
        assert!(decision.breached());
        assert!(decision.stop_reason.is_none());
    }

    #[test]
    fn test_per_provider_limits_override_defaults() {
        let mut run_budget_usd = HashMap::new();
        run_budget_usd.insert("beta".to_string(), 1.0);
        let manager = BudgetManager::new(BudgetConfig {
            default_run_budget_usd: 0.01,
            default_daily_budget_usd: 0.0,
            run_budget_usd,
            daily_budget_usd: HashMap::new(),
            allow_overrun: false,
        });
        assert!(manager.evaluate("beta", 0.5).stop_reason.is_none());
        assert!(manager.evaluate("alpha", 0.5).stop_reason.is_some());
    }
}
