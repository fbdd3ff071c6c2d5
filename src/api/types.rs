use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::db::repository::{BlockSyncRow, TrackedWalletRow, WalletTransactionRow};
use crate::error::EngineError;
use crate::rpc::pool::EndpointHealth;
use crate::snapshot::types::WalletSnapshot;

// ============================================================
// Errors
// ============================================================

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Engine errors mapped onto HTTP statuses per the API contract.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            EngineError::UnsupportedChain(_) | EngineError::NotTracked(_) => StatusCode::NOT_FOUND,
            EngineError::ProviderUnavailable { .. }
            | EngineError::ProviderDisagreement { .. }
            | EngineError::Database(_)
            | EngineError::Oracle(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::BuildTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            EngineError::LogRangeIrrecoverable { .. } | EngineError::CallFailed { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================
// Query params
// ============================================================

#[derive(Debug, Default, Deserialize)]
pub struct WalletQuery {
    #[serde(default)]
    pub refresh: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSearchQuery {
    pub chain_id: Option<i64>,
    pub search_query: Option<String>,
    pub is_verified: Option<bool>,
    pub is_spam: Option<bool>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

// ============================================================
// Request bodies
// ============================================================

#[derive(Debug, Deserialize)]
pub struct AddWalletRequest {
    pub address: String,
    pub chains: Vec<i64>,
}

// ============================================================
// Responses
// ============================================================

#[derive(Debug, Serialize)]
pub struct MultiChainSnapshot {
    pub wallet: String,
    pub total_usd: f64,
    pub total_tokens: usize,
    pub chains_count: usize,
    pub chains: Vec<WalletSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct TransactionsResponse {
    pub transactions: Vec<WalletTransactionRow>,
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub has_next_page: bool,
}

#[derive(Debug, Serialize)]
pub struct AddWalletResponse {
    pub wallet: String,
    pub chains: Vec<i64>,
    pub tracked: bool,
}

#[derive(Debug, Serialize)]
pub struct RemoveWalletResponse {
    pub wallet: String,
    pub removed: bool,
}

#[derive(Debug, Serialize)]
pub struct TrackedListResponse {
    pub wallets: Vec<TrackedWalletRow>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: bool,
    pub chains: Vec<BlockSyncRow>,
    pub providers: std::collections::HashMap<i64, Vec<EndpointHealth>>,
}
