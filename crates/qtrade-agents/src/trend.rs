use async_trait::async_trait;
use qtrade_models::agent_message::{AnalysisResult, PartialDecision};
use qtrade_models::memory::{MemoryRecord, MemoryType, Priority};
use qtrade_models::score::Score;
use qtrade_models::trade_decision::{Action, DecisionOutcome};
use qtrade_vault::MemoryVault;
use tracing::debug;

use crate::agent::{Agent, AgentContext};
use crate::error::AgentError;

pub const DEFAULT_SERIES_KEY: &str = "closes";
pub const DEFAULT_MIN_RUN: u32 = 3;

/// Votes with the recent run of consecutive closes.
///
/// A run of at least `min_run` higher closes is a BUY, the same run of lower
/// closes a SELL, anything shorter a HOLD.
pub struct TrendAgent {
    id: String,
    series_key: String,
    min_run: u32,
}

impl TrendAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            series_key: DEFAULT_SERIES_KEY.to_string(),
            min_run: DEFAULT_MIN_RUN,
        }
    }

    pub fn with_series_key(mut self, key: impl Into<String>) -> Self {
        self.series_key = key.into();
        self
    }

    pub fn with_min_run(mut self, min_run: u32) -> Self {
        self.min_run = min_run.max(1);
        self
    }

    fn action_for(&self, run: i32) -> Action {
        let min_run = self.min_run as i32;
        if run >= min_run {
            Action::Buy
        } else if run <= -min_run {
            Action::Sell
        } else {
            Action::Hold
        }
    }
}

/// Count consecutive direction from the end of a price array.
/// Returns positive for consecutive higher closes, negative for lower.
pub fn consecutive_trend(values: &[f64]) -> i32 {
    if values.len() < 2 {
        return 0;
    }
    let mut count = 0i32;
    let mut direction: Option<bool> = None; // true = up, false = down
    for i in (1..values.len()).rev() {
        let up = values[i] > values[i - 1];
        let down = values[i] < values[i - 1];
        match direction {
            None => {
                if up {
                    direction = Some(true);
                    count = 1;
                } else if down {
                    direction = Some(false);
                    count = -1;
                } else {
                    break;
                }
            }
            Some(true) if up => count += 1,
            Some(false) if down => count -= 1,
            Some(_) => break,
        }
    }
    count
}

/// Close prices under `key`: either plain numbers or bars with a `close` field.
pub fn extract_closes(market: &serde_json::Value, key: &str) -> Option<Vec<f64>> {
    let series = market.get(key)?.as_array()?;
    Some(
        series
            .iter()
            .filter_map(|point| {
                point
                    .as_f64()
                    .or_else(|| point.get("close").and_then(|c| c.as_f64()))
            })
            .collect(),
    )
}

#[async_trait]
impl Agent for TrendAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn analyze(&self, context: &AgentContext) -> Result<AnalysisResult, AgentError> {
        let closes = extract_closes(&context.market, &self.series_key).ok_or_else(|| {
            AgentError::Execution(format!(
                "market context has no `{}` series",
                self.series_key
            ))
        })?;

        let run = consecutive_trend(&closes);
        let strength = run.unsigned_abs();
        // Confidence grows with every close past the threshold.
        let confidence = if strength >= self.min_run {
            Score::clamped((50 + 10 * i64::from(strength - self.min_run + 1)).min(95))
        } else {
            Score::clamped(40)
        };

        debug!(agent = %self.id, symbol = %context.symbol, run, "Trend analyzed");
        Ok(AnalysisResult::new(&self.id, context.tier, confidence)
            .with_finding("run", serde_json::json!(run))
            .with_finding("points", serde_json::json!(closes.len())))
    }

    async fn decide(&self, analysis: &AnalysisResult) -> Result<PartialDecision, AgentError> {
        let run = analysis
            .findings
            .get("run")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| AgentError::Parse("missing finding: run".to_string()))?;
        let run = i32::try_from(run).map_err(|e| AgentError::Parse(e.to_string()))?;
        let action = self.action_for(run);

        let rationale = match run {
            0 => "No directional run in recent closes".to_string(),
            r if r > 0 => format!("{r} consecutive higher close(s)"),
            r => format!("{} consecutive lower close(s)", -r),
        };

        Ok(PartialDecision {
            action,
            confidence: analysis.confidence,
            rationale,
            factors: analysis.findings.clone(),
        })
    }

    /// Losing directional trades are remembered as LEARNING memories.
    async fn learn(&self, outcome: &DecisionOutcome, vault: &MemoryVault) -> Result<(), AgentError> {
        if outcome.positive || outcome.action.is_conservative() {
            return Ok(());
        }

        let record = MemoryRecord::new(
            MemoryType::Learning,
            format!("Trend {} on {} lost", outcome.action, outcome.symbol),
            format!(
                "Trend-following {} on {} closed at pnl {}{}",
                outcome.action,
                outcome.symbol,
                outcome.pnl,
                outcome
                    .exit_reason
                    .as_deref()
                    .map(|r| format!(" ({r})"))
                    .unwrap_or_default()
            ),
            &self.id,
        )
        .with_priority(Priority::Medium)
        .with_symbols([outcome.symbol.as_str()]);

        let id = vault.store(record).await?;
        debug!(agent = %self.id, memory = %id, "Stored trend learning");
        Ok(())
    }
}
