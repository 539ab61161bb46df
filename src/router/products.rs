// Product lookup endpoints

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};

use super::router::{api_error, ApiError};
use crate::service::MAX_BATCH_IDS;
use crate::state::AppState;
use crate::store::Product;

/// GET /api/v1/products/:id
pub async fn get_product(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Result<Response, ApiError> {
    let id: i64 = raw_id.parse().map_err(|_| {
        api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            format!("product id must be an integer, got {raw_id:?}"),
        )
    })?;

    match state.products.get_by_id(id).await? {
        Some(product) => Ok(Json(product.as_ref()).into_response()),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("product {id} not found"),
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub requested: usize,
    pub found: usize,
    pub products: Vec<Product>,
}

/// POST /api/v1/products/batch
pub async fn get_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    if req.ids.is_empty() || req.ids.len() > MAX_BATCH_IDS {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            format!("ids must contain between 1 and {MAX_BATCH_IDS} entries"),
        ));
    }
    let requested = req.ids.len();
    let products = state.products.get_by_ids(req.ids).await?;
    Ok(Json(BatchResponse {
        requested,
        found: products.len(),
        products,
    }))
}
