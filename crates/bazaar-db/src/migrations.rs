use rusqlite::Connection;
use tracing::info;

use crate::error::ChatError;

pub fn run(conn: &Connection) -> Result<(), ChatError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id           TEXT PRIMARY KEY,
            username     TEXT NOT NULL UNIQUE,
            password     TEXT NOT NULL,
            display_name TEXT NOT NULL,
            banned       INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS products (
            id          TEXT PRIMARY KEY,
            owner_id    TEXT NOT NULL REFERENCES users(id),
            title       TEXT NOT NULL,
            price_taka  INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS accommodations (
            id          TEXT PRIMARY KEY,
            owner_id    TEXT NOT NULL REFERENCES users(id),
            title       TEXT NOT NULL,
            location    TEXT NOT NULL DEFAULT '',
            created_at  TEXT NOT NULL
        );

        -- One thread per unordered participant pair and listing context.
        -- A chat is about a product, an accommodation, or neither.
        CREATE TABLE IF NOT EXISTS chats (
            id               TEXT PRIMARY KEY,
            participant_a    TEXT NOT NULL REFERENCES users(id),
            participant_b    TEXT NOT NULL REFERENCES users(id),
            product_id       TEXT REFERENCES products(id),
            accommodation_id TEXT REFERENCES accommodations(id),
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL,
            CHECK (participant_a <> participant_b),
            CHECK (product_id IS NULL OR accommodation_id IS NULL)
        );

        CREATE INDEX IF NOT EXISTS idx_chats_participants
            ON chats(participant_a, participant_b);

        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            chat_id     TEXT NOT NULL REFERENCES chats(id),
            sender_id   TEXT NOT NULL REFERENCES users(id),
            body        TEXT NOT NULL,
            is_read     INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_chat
            ON messages(chat_id, created_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
