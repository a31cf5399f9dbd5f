use crate::error::AppError;
use crate::metrics;
use crate::models::DeviceCategory;
use crate::services::auth::AuthenticatedDevice;
use crate::state::AppState;
use crate::websocket::session::WsSession;
use actix_web::{get, http::header, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;

pub const DEVICE_CATEGORY_HEADER: &str = "X-Device-Category";

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
    pub platform: Option<String>,
}

fn bearer_token(params: &WsParams, req: &HttpRequest) -> Option<String> {
    params.token.clone().or_else(|| {
        req.headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .map(|s| s.trim().to_string())
    })
}

fn device_category(params: &WsParams, req: &HttpRequest) -> Result<DeviceCategory, AppError> {
    let raw = req
        .headers()
        .get(DEVICE_CATEGORY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| params.platform.clone());

    match raw {
        Some(raw) => raw.parse(),
        None => Ok(DeviceCategory::Web),
    }
}

async fn authenticate(
    params: &WsParams,
    req: &HttpRequest,
    state: &AppState,
) -> Result<AuthenticatedDevice, AppError> {
    let Some(token) = bearer_token(params, req) else {
        tracing::warn!("WebSocket connection rejected: no token provided");
        metrics::record_rejection("unauthorized");
        return Err(AppError::Unauthorized);
    };

    state.verifier.verify(&token).await.map_err(|e| {
        tracing::warn!(error = %e, "WebSocket connection rejected: invalid token");
        metrics::record_rejection("unauthorized");
        e
    })
}

#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    let params = query.into_inner();

    // Refuse non-upgrade requests before touching the registry.
    ws::handshake(&req)?;

    let device = authenticate(&params, &req, &state).await?;
    let category = device_category(&params, &req)?;

    let handle = state
        .presence
        .on_connect(device.user_id, device.driver_id, category)
        .await?;

    let key = handle.key.clone();
    let session = WsSession::new(
        handle.key,
        handle.frames,
        state.presence.clone(),
        state.config.heartbeat,
    );

    match ws::start(session, &req, stream) {
        Ok(resp) => Ok(resp),
        Err(e) => {
            tracing::error!(
                user_id = %key.user_id,
                error = %e,
                "failed to start WebSocket session"
            );
            state.presence.on_disconnect(key).await;
            Err(e)
        }
    }
}
