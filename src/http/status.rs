//! Operational endpoints.

use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use super::chain::AdmissionChain;
use crate::load::AdaptiveStatus;

/// `GET /api/admission/status`
pub async fn admission_status(State(chain): State<Arc<AdmissionChain>>) -> Json<AdaptiveStatus> {
    Json(chain.adaptive().status())
}

/// `GET /health`
pub async fn health(State(chain): State<Arc<AdmissionChain>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "bannedClients": chain.offenders().banned_count(),
    }))
}
