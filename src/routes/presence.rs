use actix_web::{get, web, HttpResponse};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[get("/internal/v1/presence/{user_id}")]
pub async fn get_presence(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let raw = path.into_inner();
    let user_id = Uuid::parse_str(&raw)
        .map_err(|_| AppError::BadRequest(format!("invalid user id: {raw}")))?;

    let snapshot = state.presence.snapshot(user_id).await;
    Ok(HttpResponse::Ok().json(snapshot))
}
