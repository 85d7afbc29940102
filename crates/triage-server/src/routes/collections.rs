use axum::extract::{Path, State};
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/collections: every configured collection with its latest
/// totals. Collections not computed yet report null totals.
pub async fn list_collections(State(app): State<AppState>) -> Json<serde_json::Value> {
    let list: Vec<serde_json::Value> = app
        .scheduler
        .triage()
        .list_collections()
        .iter()
        .map(|c| {
            let latest = app.scheduler.latest(&c.id);
            serde_json::json!({
                "id": c.id,
                "name": c.name,
                "description": c.description,
                "hidden": c.hidden,
                "total": latest.as_ref().map(|r| r.total),
                "created": latest.as_ref().map(|r| r.created),
            })
        })
        .collect();
    Json(serde_json::json!(list))
}

/// GET /api/collections/{id}: the collection result, computed on demand.
pub async fn get_collection(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let result = app
        .scheduler
        .lookup(&id, true)
        .await?
        .ok_or_else(|| anyhow::anyhow!("results for '{id}' are not available"))?;
    Ok(Json(serde_json::to_value(&*result)?))
}

/// POST /api/collections/{id}/refresh: rebuild from fresh forge data.
pub async fn refresh_collection(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let result = app.scheduler.force_refresh(&id).await?;
    Ok(Json(serde_json::to_value(&*result)?))
}
