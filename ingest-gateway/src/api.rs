use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common_broker::BrokerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("failed to decode request: {0}")]
    RequestDecoding(String),
    #[error("JSON parsing error: {0}")]
    RequestParsing(#[from] serde_json::Error),
    #[error("request body is too large")]
    PayloadTooLarge,

    #[error("failed to encode batch: {0}")]
    Encoding(#[source] serde_json::Error),

    #[error("transient error, please retry")]
    BrokerUnavailable(#[source] BrokerError),
    #[error("batch could not be published")]
    BrokerRejected(#[source] BrokerError),
}

impl From<BrokerError> for GatewayError {
    fn from(error: BrokerError) -> Self {
        if error.is_unavailable() {
            GatewayError::BrokerUnavailable(error)
        } else {
            GatewayError::BrokerRejected(error)
        }
    }
}

impl GatewayError {
    /// Label for the dropped batches metric.
    pub fn cause(&self) -> &'static str {
        match self {
            GatewayError::RequestDecoding(_) => "decoding",
            GatewayError::RequestParsing(_) => "parsing",
            GatewayError::PayloadTooLarge => "too_large",
            GatewayError::Encoding(_) => "encoding",
            GatewayError::BrokerUnavailable(_) => "broker_unavailable",
            GatewayError::BrokerRejected(_) => "broker_rejected",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::RequestDecoding(_) | GatewayError::RequestParsing(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }

            GatewayError::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),

            GatewayError::BrokerUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }

            GatewayError::Encoding(_) | GatewayError::BrokerRejected(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        }
        .into_response()
    }
}
