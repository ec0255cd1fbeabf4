use axum::{
    Extension, Json,
    extract::{Path, State},
};
use tracing::error;
use uuid::Uuid;

use bazaar_db::models::{MessageRow, ThreadRow};
use bazaar_gateway::identity::Identity;
use bazaar_types::api::{ChatResponse, CreateChatRequest, MessageResponse};
use bazaar_types::models::ListingRef;

use crate::auth::AppState;
use crate::error::ApiError;

/// GET /chats — every thread the caller participates in, most recently
/// active first, annotated with the counterpart and last message.
pub async fn list_chats(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<ChatResponse>>, ApiError> {
    let db = state.db.clone();
    let user_id = identity.user_id;

    let threads = tokio::task::spawn_blocking(move || db.list_threads_for(user_id))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {e}");
            ApiError::Internal
        })??;

    Ok(Json(
        threads.into_iter().map(ThreadRow::into_response).collect(),
    ))
}

/// POST /chats/create — resolve or create the thread for the caller and a
/// counterparty. A listing id implies the counterparty (its owner); a
/// listing-less chat names the counterparty explicitly.
pub async fn create_chat(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<CreateChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let listing = match (req.product_id, req.accommodation_id) {
        (Some(_), Some(_)) => {
            return Err(ApiError::InvalidRequest(
                "a chat is about a product or an accommodation, not both".into(),
            ));
        }
        (Some(id), None) => ListingRef::Product(id),
        (None, Some(id)) => ListingRef::Accommodation(id),
        (None, None) => ListingRef::None,
    };

    let db = state.db.clone();
    let user_id = identity.user_id;

    let thread = tokio::task::spawn_blocking(move || {
        let chat = db.get_or_create_chat(user_id, req.counterparty_id, listing)?;
        db.get_thread(user_id, &chat.id)
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {e}");
        ApiError::Internal
    })??;

    Ok(Json(thread.into_response()))
}

/// GET /chats/{chat_id}/messages — the full history in send order. Fetching
/// marks the counterpart's messages read, so this read is also a write.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<MessageResponse>>, ApiError> {
    let db = state.db.clone();
    let user_id = identity.user_id;

    let rows = tokio::task::spawn_blocking(move || {
        db.assert_participant(chat_id, user_id)?;
        db.list_and_mark_read(chat_id, user_id)
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {e}");
        ApiError::Internal
    })??;

    Ok(Json(
        rows.into_iter().map(MessageRow::into_response).collect(),
    ))
}
