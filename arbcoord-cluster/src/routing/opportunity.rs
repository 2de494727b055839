//! The opportunity record and its wire form.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::ingest::Envelope;

/// Profit-percentage bounds; records outside are rejected, not stored
pub const PROFIT_PERCENT_MIN: f64 = -100.0;
pub const PROFIT_PERCENT_MAX: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpportunityStatus {
    Pending,
    Forwarded,
    Completed,
    Failed,
}

impl OpportunityStatus {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "forwarded" => Self::Forwarded,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Forwarded => "forwarded",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A detected arbitrage opportunity
#[derive(Debug, Clone, Serialize)]
pub struct Opportunity {
    pub id: String,
    /// Detector confidence in [0, 1]
    pub confidence: f64,
    pub timestamp_ms: i64,
    pub chain: Option<String>,
    pub buy_dex: Option<String>,
    pub sell_dex: Option<String>,
    pub profit_percentage: Option<f64>,
    pub expires_at_ms: Option<i64>,
    pub status: OpportunityStatus,
    pub token_in: Option<String>,
    pub token_out: Option<String>,
    pub amount_in: Option<String>,
    pub expected_profit: Option<f64>,
    pub estimated_profit: Option<f64>,
    pub gas_estimate: Option<f64>,
    pub buy_chain: Option<String>,
    pub sell_chain: Option<String>,
    pub pipeline_timestamps: Option<String>,
    /// Trace-context fields (`_trace_traceId`, ...) passed through verbatim
    pub trace: BTreeMap<String, String>,
}

impl Opportunity {
    /// Parse an opportunity envelope. Returns `None` when the required
    /// string id is missing.
    #[must_use]
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        let id = envelope.get("id")?.to_string();

        let trace: BTreeMap<String, String> = envelope
            .fields()
            .iter()
            .filter(|(k, _)| k.starts_with("_trace_"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Some(Self {
            id,
            confidence: envelope.get_f64("confidence").unwrap_or(0.0).clamp(0.0, 1.0),
            timestamp_ms: envelope
                .get_i64("timestamp")
                .unwrap_or_else(|| Utc::now().timestamp_millis()),
            chain: envelope.get("chain").map(ToString::to_string),
            buy_dex: envelope.get("buyDex").map(ToString::to_string),
            sell_dex: envelope.get("sellDex").map(ToString::to_string),
            profit_percentage: envelope.get_f64("profitPercentage"),
            expires_at_ms: envelope.get_i64("expiresAt"),
            status: OpportunityStatus::parse(envelope.get("status").unwrap_or("pending")),
            token_in: envelope.get("tokenIn").map(ToString::to_string),
            token_out: envelope.get("tokenOut").map(ToString::to_string),
            amount_in: envelope.get("amountIn").map(ToString::to_string),
            expected_profit: envelope.get_f64("expectedProfit"),
            estimated_profit: envelope.get_f64("estimatedProfit"),
            gas_estimate: envelope.get_f64("gasEstimate"),
            buy_chain: envelope.get("buyChain").map(ToString::to_string),
            sell_chain: envelope.get("sellChain").map(ToString::to_string),
            pipeline_timestamps: envelope.get("pipelineTimestamps").map(ToString::to_string),
            trace,
        })
    }

    /// Whether the profit percentage (when present) is inside the
    /// accepted range. Bounds are inclusive.
    #[must_use]
    pub fn profit_in_range(&self) -> bool {
        self.profit_percentage
            .is_none_or(|p| (PROFIT_PERCENT_MIN..=PROFIT_PERCENT_MAX).contains(&p))
    }

    #[must_use]
    pub fn is_expired(&self, now_ms: i64, ttl_ms: i64) -> bool {
        if let Some(expires_at) = self.expires_at_ms {
            if expires_at < now_ms {
                return true;
            }
        }
        now_ms - self.timestamp_ms > ttl_ms
    }

    /// Serialize to the flat execution-request map.
    ///
    /// Field order is fixed. Missing numerics serialize as "0", missing
    /// strings as "". `expiresAt` is omitted entirely when absent because
    /// an empty string would fail the executor's numeric validation.
    #[must_use]
    pub fn to_execution_fields(
        &self,
        forwarded_by: &str,
        forwarded_at_ms: i64,
    ) -> Vec<(String, String)> {
        fn opt_str(value: &Option<String>) -> String {
            value.clone().unwrap_or_default()
        }
        fn opt_num(value: Option<f64>) -> String {
            value.map_or_else(|| "0".to_string(), |v| format_num(v))
        }
        fn format_num(value: f64) -> String {
            format!("{value}")
        }

        let mut fields = vec![
            ("id".to_string(), self.id.clone()),
            ("type".to_string(), "arbitrage".to_string()),
            ("chain".to_string(), opt_str(&self.chain)),
            ("buyDex".to_string(), opt_str(&self.buy_dex)),
            ("sellDex".to_string(), opt_str(&self.sell_dex)),
            (
                "profitPercentage".to_string(),
                opt_num(self.profit_percentage),
            ),
            ("confidence".to_string(), format_num(self.confidence)),
            ("timestamp".to_string(), self.timestamp_ms.to_string()),
        ];

        if let Some(expires_at) = self.expires_at_ms {
            fields.push(("expiresAt".to_string(), expires_at.to_string()));
        }

        fields.push(("tokenIn".to_string(), opt_str(&self.token_in)));
        fields.push(("tokenOut".to_string(), opt_str(&self.token_out)));
        fields.push(("amountIn".to_string(), opt_str(&self.amount_in)));
        fields.push(("forwardedBy".to_string(), forwarded_by.to_string()));
        fields.push(("forwardedAt".to_string(), forwarded_at_ms.to_string()));
        fields.push(("expectedProfit".to_string(), opt_num(self.expected_profit)));
        fields.push((
            "estimatedProfit".to_string(),
            opt_num(self.estimated_profit),
        ));
        fields.push(("gasEstimate".to_string(), opt_num(self.gas_estimate)));

        if let Some(buy_chain) = &self.buy_chain {
            fields.push(("buyChain".to_string(), buy_chain.clone()));
        }
        if let Some(sell_chain) = &self.sell_chain {
            fields.push(("sellChain".to_string(), sell_chain.clone()));
        }
        if let Some(pipeline) = &self.pipeline_timestamps {
            fields.push(("pipelineTimestamps".to_string(), pipeline.clone()));
        }

        for (key, value) in &self.trace {
            fields.push((key.clone(), value.clone()));
        }

        fields
    }
}
