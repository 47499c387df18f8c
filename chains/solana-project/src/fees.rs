use core_logic::{CoreError, PercentileTable, PriorityLevel};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use solana_client::nonblocking::rpc_client::RpcClient;
use tracing::debug;

/// Fees are sampled for swaps through the Jupiter program.
const JUPITER_PROGRAM: &str = "JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4";

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EstimateResult {
    priority_fee_levels: Option<FeeLevels>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeeLevels {
    min: f64,
    low: f64,
    medium: f64,
    high: f64,
    very_high: f64,
    unsafe_max: f64,
}

impl FeeLevels {
    fn into_table(self) -> PercentileTable {
        PercentileTable::from_levels([
            (PriorityLevel::Min, self.min as u64),
            (PriorityLevel::Low, self.low as u64),
            (PriorityLevel::Medium, self.medium as u64),
            (PriorityLevel::High, self.high as u64),
            (PriorityLevel::VeryHigh, self.very_high as u64),
            (PriorityLevel::UnsafeMax, self.unsafe_max as u64),
        ])
    }
}

/// Helius `getPriorityFeeEstimate` with every level included.
pub async fn helius_table(http: &Client, url: &str) -> Result<PercentileTable, CoreError> {
    let payload = json!({
        "jsonrpc": "2.0",
        "id": "1",
        "method": "getPriorityFeeEstimate",
        "params": [{
            "accountKeys": [JUPITER_PROGRAM],
            "options": { "includeAllPriorityFeeLevels": true }
        }]
    });

    let response: RpcResponse<EstimateResult> = http
        .post(url)
        .json(&payload)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| CoreError::EndpointUnavailable {
            endpoint: url.to_string(),
            reason: e.to_string(),
        })?
        .json()
        .await
        .map_err(|e| CoreError::chain(format!("malformed fee estimate: {}", e)))?;

    if let Some(error) = response.error {
        return Err(CoreError::chain(format!("getPriorityFeeEstimate: {}", error)));
    }
    response
        .result
        .and_then(|r| r.priority_fee_levels)
        .map(FeeLevels::into_table)
        .ok_or_else(|| CoreError::chain("getPriorityFeeEstimate returned no levels"))
}

/// Percentiles over the node's recent prioritization fees.
pub async fn recent_fees_table(rpc: &RpcClient) -> Result<PercentileTable, CoreError> {
    let samples = rpc
        .get_recent_prioritization_fees(&[])
        .await
        .map_err(|e| CoreError::EndpointUnavailable {
            endpoint: rpc.url(),
            reason: e.to_string(),
        })?;
    debug!("{} recent prioritization fee samples", samples.len());
    Ok(PercentileTable::from_samples(
        samples.into_iter().map(|s| s.prioritization_fee).collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helius_levels_map_to_percentiles() {
        let body = r#"{"jsonrpc":"2.0","id":"1","result":{"priorityFeeLevels":{
            "min":0.0,"low":10.0,"medium":1000.5,"high":5000.0,"veryHigh":20000.0,"unsafeMax":900000.0}}}"#;
        let response: RpcResponse<EstimateResult> = serde_json::from_str(body).unwrap();
        let table = response.result.unwrap().priority_fee_levels.unwrap().into_table();

        assert_eq!(table.fee_at(PriorityLevel::Medium.percentile()), 1000);
        assert_eq!(table.fee_at(PriorityLevel::UnsafeMax.percentile()), 900_000);
    }
}
