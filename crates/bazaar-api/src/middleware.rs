use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use tracing::error;

use bazaar_gateway::identity;

use crate::auth::AppState;
use crate::error::ApiError;

/// Extract the Bearer token from the Authorization header and run it through
/// the same credential verifier the gateway handshake uses. The resolved
/// `Identity` is injected as a request extension for the handlers.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthenticated)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(ApiError::Unauthenticated)?
        .to_string();

    let db = state.db.clone();
    let secret = state.jwt_secret.clone();
    let resolved = tokio::task::spawn_blocking(move || {
        identity::verify_credential(&db, &secret, &token)
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {e}");
        ApiError::Internal
    })??;

    req.extensions_mut().insert(resolved);
    Ok(next.run(req).await)
}
