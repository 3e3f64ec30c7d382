// =============================================================================
// Prediction Service Client
// =============================================================================
//
// The model lives in an external service with two endpoints:
//
//   POST /predict  {movingAverage7, movingAverage30, rsi}  => {prediction}
//   POST /train    {}                                      => 2xx on accept
//
// One attempt per call, no internal retries.  `/train` only starts retraining
// on the service side; the call returns as soon as the service acknowledges.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::error::{PredictionError, RetrainError};
use crate::types::IndicatorVector;

/// Acknowledgement of a retrain trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrainAck {
    pub message: Option<String>,
}

/// External model service.
#[async_trait]
pub trait PredictionService: Send + Sync {
    /// Ask for the predicted price given the latest indicators.
    async fn request_prediction(&self, features: &IndicatorVector) -> Result<f64, PredictionError>;

    /// Ask the service to retrain in the background.
    async fn trigger_retrain(&self) -> Result<RetrainAck, RetrainError>;
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    prediction: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TrainResponse {
    message: Option<String>,
}

/// HTTP implementation of [`PredictionService`].
pub struct HttpPredictionClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPredictionClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PredictionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PredictionError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl PredictionService for HttpPredictionClient {
    #[instrument(skip(self), name = "prediction::request")]
    async fn request_prediction(&self, features: &IndicatorVector) -> Result<f64, PredictionError> {
        let url = format!("{}/predict", self.base_url);

        let resp = self
            .client
            .post(&url)
            .json(features)
            .send()
            .await
            .map_err(|e| PredictionError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PredictionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: PredictResponse = resp
            .json()
            .await
            .map_err(|e| PredictionError::Malformed(e.to_string()))?;
        let prediction = parse_prediction(body)?;

        debug!(prediction, "prediction received");
        Ok(prediction)
    }

    #[instrument(skip(self), name = "prediction::retrain")]
    async fn trigger_retrain(&self) -> Result<RetrainAck, RetrainError> {
        let url = format!("{}/train", self.base_url);

        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| RetrainError::Transport(e.to_string()))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(RetrainError::Rejected {
                status: status.as_u16(),
                body: text,
            });
        }

        let message = serde_json::from_str::<TrainResponse>(&text)
            .ok()
            .and_then(|r| r.message);
        debug!(?message, "retrain accepted");
        Ok(RetrainAck { message })
    }
}

fn parse_prediction(body: PredictResponse) -> Result<f64, PredictionError> {
    match body.prediction {
        Some(p) if p.is_finite() => Ok(p),
        Some(p) => Err(PredictionError::Malformed(format!("non-finite prediction {p}"))),
        None => Err(PredictionError::Malformed("response has no 'prediction'".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prediction_must_be_present() {
        let body: PredictResponse = serde_json::from_str(r#"{"error":"boom"}"#).unwrap();
        assert!(matches!(parse_prediction(body), Err(PredictionError::Malformed(_))));
    }

    #[test]
    fn prediction_is_extracted() {
        let body: PredictResponse = serde_json::from_str(r#"{"prediction": 50000.126}"#).unwrap();
        assert_eq!(parse_prediction(body).unwrap(), 50000.126);
    }

    #[test]
    fn string_prediction_does_not_decode() {
        assert!(serde_json::from_str::<PredictResponse>(r#"{"prediction":"12"}"#).is_err());
    }

    #[tokio::test]
    async fn unreachable_service_is_transport_error() {
        // Port 9 (discard) on localhost is essentially never listening.
        let client = HttpPredictionClient::new("http://127.0.0.1:9/", Duration::from_secs(2)).unwrap();
        assert_eq!(client.base_url, "http://127.0.0.1:9");

        let features = IndicatorVector { ma7: 1.0, ma30: 2.0, rsi: 50.0 };
        assert!(matches!(
            client.request_prediction(&features).await,
            Err(PredictionError::Transport(_))
        ));
        assert!(matches!(
            client.trigger_retrain().await,
            Err(RetrainError::Transport(_))
        ));
    }
}
