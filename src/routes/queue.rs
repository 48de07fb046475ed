use axum::extract::State;
use axum::Json;

use crate::app_state::AppState;
use crate::error::ScoringError;
use crate::routes::error::ApiError;
use crate::services::queue::QueueStats;

/// GET /api/queue/stats
pub async fn queue_stats(State(state): State<AppState>) -> Result<Json<QueueStats>, ApiError> {
    let stats = state.broker.stats().await.map_err(ScoringError::from)?;
    metrics::gauge!("scoring_queue_depth").set((stats.waiting + stats.delayed) as f64);
    Ok(Json(stats))
}
