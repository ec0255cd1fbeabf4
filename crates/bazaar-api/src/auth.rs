use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::error;
use uuid::Uuid;

use bazaar_db::Database;
use bazaar_gateway::dispatcher::Dispatcher;
use bazaar_types::api::{Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub dispatcher: Dispatcher,
    pub jwt_secret: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.username.len() < 3 || req.username.len() > 32 {
        return Err(ApiError::InvalidRequest(
            "username must be 3-32 characters".into(),
        ));
    }
    if req.password.len() < 8 {
        return Err(ApiError::InvalidRequest(
            "password must be at least 8 characters".into(),
        ));
    }
    let display_name = req.display_name.trim().to_string();
    if display_name.is_empty() || display_name.len() > 64 {
        return Err(ApiError::InvalidRequest(
            "display name must be 1-64 characters".into(),
        ));
    }

    let user_id = Uuid::new_v4();
    let db = state.db.clone();
    let username = req.username.clone();
    let password = req.password;

    // Hashing is CPU-heavy; keep it off the async runtime with the DB work.
    tokio::task::spawn_blocking(move || {
        if db.get_user_by_username(&username)?.is_some() {
            return Err(ApiError::Conflict);
        }

        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| {
                error!("Password hashing failed: {e}");
                ApiError::Internal
            })?
            .to_string();

        db.create_user(user_id, &username, &password_hash, &display_name)?;
        Ok(())
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {e}");
        ApiError::Internal
    })??;

    let token = create_token(&state.jwt_secret, user_id, &req.username)?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse { user_id, token }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let db = state.db.clone();
    let username = req.username.clone();
    let password = req.password;

    let user = tokio::task::spawn_blocking(move || {
        let user = db
            .get_user_by_username(&username)?
            .ok_or(ApiError::Unauthenticated)?;

        if user.banned {
            return Err(ApiError::Forbidden);
        }

        let parsed_hash = PasswordHash::new(&user.password).map_err(|e| {
            error!("Stored password hash is corrupt: {e}");
            ApiError::Internal
        })?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .map_err(|_| ApiError::Unauthenticated)?;

        Ok(user)
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {e}");
        ApiError::Internal
    })??;

    let user_id: Uuid = user.id.parse().map_err(|e| {
        error!("Corrupt user id '{}': {e}", user.id);
        ApiError::Internal
    })?;
    let token = create_token(&state.jwt_secret, user_id, &user.username)?;

    Ok(Json(LoginResponse {
        user_id,
        display_name: user.display_name,
        token,
    }))
}

fn create_token(secret: &str, user_id: Uuid, username: &str) -> Result<String, ApiError> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| {
        error!("Token issuance failed: {e}");
        ApiError::Internal
    })
}
