use jsonwebtoken::{DecodingKey, Validation, decode};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use bazaar_db::Database;
use bazaar_types::api::Claims;

/// A verified, live user behind a bearer credential. Bound to a REST request
/// or to a gateway connection for its whole lifetime.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: Uuid,
    pub display_name: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credential")]
    Unauthenticated,

    #[error("account is banned or no longer exists")]
    Forbidden,

    #[error("credential check failed")]
    Internal,
}

/// Resolve a bearer token to a non-banned user. Signature, expiry, and claim
/// shape problems are `Unauthenticated`; a token for a banned or deleted
/// account is `Forbidden`. Pure lookup, no side effects.
///
/// The REST middleware runs this per request; the gateway runs it once per
/// connection at the identify handshake.
pub fn verify_credential(
    db: &Database,
    secret: &str,
    token: &str,
) -> Result<Identity, AuthError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| AuthError::Unauthenticated)?;

    let user = db
        .get_user_by_id(token_data.claims.sub)
        .map_err(|e| {
            error!("Identity lookup failed: {e}");
            AuthError::Internal
        })?
        .ok_or(AuthError::Forbidden)?;

    if user.banned {
        return Err(AuthError::Forbidden);
    }

    Ok(Identity {
        user_id: token_data.claims.sub,
        display_name: user.display_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    const SECRET: &str = "test-secret";

    fn seed_user(db: &Database, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(id, name, "argon2-hash", name).unwrap();
        id
    }

    fn token_for(user_id: Uuid, username: &str, secret: &str) -> String {
        let claims = Claims {
            sub: user_id,
            username: username.to_string(),
            exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_resolves_to_identity() {
        let db = Database::open_in_memory().unwrap();
        let alice = seed_user(&db, "alice");

        let identity = verify_credential(&db, SECRET, &token_for(alice, "alice", SECRET)).unwrap();
        assert_eq!(identity.user_id, alice);
        assert_eq!(identity.display_name, "alice");
    }

    #[test]
    fn garbage_and_wrong_key_tokens_are_unauthenticated() {
        let db = Database::open_in_memory().unwrap();
        let alice = seed_user(&db, "alice");

        let err = verify_credential(&db, SECRET, "not-a-jwt").unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated));

        let forged = token_for(alice, "alice", "some-other-secret");
        let err = verify_credential(&db, SECRET, &forged).unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated));
    }

    #[test]
    fn banned_and_unknown_accounts_are_forbidden() {
        let db = Database::open_in_memory().unwrap();
        let alice = seed_user(&db, "alice");

        db.set_banned(alice, true).unwrap();
        let err = verify_credential(&db, SECRET, &token_for(alice, "alice", SECRET)).unwrap_err();
        assert!(matches!(err, AuthError::Forbidden));

        // Valid signature, but the account never existed.
        let ghost = token_for(Uuid::new_v4(), "ghost", SECRET);
        let err = verify_credential(&db, SECRET, &ghost).unwrap_err();
        assert!(matches!(err, AuthError::Forbidden));
    }
}
