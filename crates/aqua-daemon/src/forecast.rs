// crates/aqua-daemon/src/forecast.rs
//
// HTTP client for the usage forecast service, used as the ledger's
// historical-usage source.
//
// POST {forecast_url}/api/predict with {"floor", "unit", "days"}; the reply
// carries `predictions: [{date, value}]`. Replies are untrusted: null or
// non-numeric values pass through as NaN and are discarded by the
// allocation engine.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use aqua_core::error::AquaError;
use aqua_core::period::PeriodWindow;
use aqua_core::traits::UsageHistorySource;
use aqua_core::unit::Unit;
use aqua_core::usage::UsageSample;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpUsageSource {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct PredictRequest {
    floor: u16,
    unit: u16,
    days: u32,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    status: String,
    #[serde(default)]
    predictions: Vec<Prediction>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    value: Option<f64>,
}

impl HttpUsageSource {
    pub fn new(base_url: &str) -> Result<Self, AquaError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AquaError::AllocationUnavailable(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

/// Map a forecast reply onto daily samples.
///
/// Dates that are missing or unparseable are filled in from the window
/// start, one day per prediction.
fn into_samples(
    response: PredictResponse,
    window: &PeriodWindow,
) -> Result<Vec<UsageSample>, AquaError> {
    if response.status != "success" {
        return Err(AquaError::NoHistory(
            response
                .message
                .unwrap_or_else(|| format!("forecast status '{}'", response.status)),
        ));
    }
    let first_day = window.start.date_naive();
    Ok(response
        .predictions
        .into_iter()
        .enumerate()
        .map(|(i, p)| {
            let date = p
                .date
                .as_deref()
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
                .or_else(|| first_day.checked_add_days(chrono::Days::new(i as u64)))
                .unwrap_or(first_day);
            UsageSample {
                date,
                litres: p.value.unwrap_or(f64::NAN),
            }
        })
        .collect())
}

#[async_trait]
impl UsageHistorySource for HttpUsageSource {
    async fn fetch_series(
        &self,
        unit: &Unit,
        window: &PeriodWindow,
    ) -> Result<Vec<UsageSample>, AquaError> {
        let url = format!("{}/api/predict", self.base_url);
        let body = PredictRequest {
            floor: unit.profile.floor,
            unit: unit.profile.unit_number,
            days: window.days(),
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AquaError::AllocationUnavailable(format!("POST {}: {}", url, e)))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AquaError::NotFound(format!(
                "no forecast model for unit {}",
                unit.unit_id
            )));
        }
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AquaError::AllocationUnavailable(format!(
                "forecast service returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(AquaError::InvalidRequest(format!(
                "forecast service rejected request for unit {}: {}",
                unit.unit_id, status
            )));
        }

        let parsed: PredictResponse = resp
            .json()
            .await
            .map_err(|e| AquaError::AllocationUnavailable(format!("forecast reply: {}", e)))?;
        let samples = into_samples(parsed, window)?;
        tracing::debug!(
            "Fetched {} forecast samples for unit {}",
            samples.len(),
            unit.unit_id
        );
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqua_core::period::PeriodCadence;
    use chrono::{TimeZone, Utc};

    fn october() -> PeriodWindow {
        PeriodWindow::containing(
            Utc.with_ymd_and_hms(2026, 10, 10, 0, 0, 0).single().unwrap(),
            PeriodCadence::Monthly,
        )
    }

    #[test]
    fn test_maps_predictions() {
        let reply: PredictResponse = serde_json::from_str(
            r#"{
                "status": "success",
                "predictions": [
                    {"date": "2026-10-01", "value": 182.5},
                    {"date": "not-a-date", "value": 190.0},
                    {"date": "2026-10-03", "value": null}
                ],
                "unit_info": {"floor": 1, "unit": 1}
            }"#,
        )
        .unwrap();
        let samples = into_samples(reply, &october()).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].date, NaiveDate::from_ymd_opt(2026, 10, 1).unwrap());
        assert!((samples[0].litres - 182.5).abs() < f64::EPSILON);
        assert_eq!(samples[1].date, NaiveDate::from_ymd_opt(2026, 10, 2).unwrap());
        assert!(samples[2].litres.is_nan());
    }

    #[test]
    fn test_error_status_is_no_history() {
        let reply: PredictResponse =
            serde_json::from_str(r#"{"status": "error", "message": "Model not found"}"#).unwrap();
        let err = into_samples(reply, &october()).unwrap_err();
        assert_eq!(err, AquaError::NoHistory("Model not found".to_string()));
    }

    #[test]
    fn test_request_body_shape() {
        let body = serde_json::to_value(PredictRequest {
            floor: 3,
            unit: 7,
            days: 31,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"floor": 3, "unit": 7, "days": 31}));
    }
}
