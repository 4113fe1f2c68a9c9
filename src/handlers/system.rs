//! System Handlers

use axum::Json;
use serde::Serialize;

#[derive(Serialize)]
pub struct RuntimeInfo {
    pub name: &'static str,
    pub version: &'static str,
}

/// GET /api/system/runtime_info
pub async fn get_runtime_info() -> Json<RuntimeInfo> {
    Json(RuntimeInfo { name: env!("CARGO_PKG_NAME"), version: env!("CARGO_PKG_VERSION") })
}
