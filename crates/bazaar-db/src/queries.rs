use chrono::SecondsFormat;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use bazaar_types::models::ListingRef;

use crate::Database;
use crate::error::ChatError;
use crate::models::{ChatRow, MessageRow, ThreadRow, UserRow};

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: Uuid,
        username: &str,
        password_hash: &str,
        display_name: &str,
    ) -> Result<(), ChatError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password, display_name, banned, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![id.to_string(), username, password_hash, display_name, now_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>, ChatError> {
        self.with_conn(|conn| {
            query_user(conn, "SELECT id, username, password, display_name, banned, created_at FROM users WHERE username = ?1", username)
        })
    }

    pub fn get_user_by_id(&self, id: Uuid) -> Result<Option<UserRow>, ChatError> {
        self.with_conn(|conn| {
            query_user(conn, "SELECT id, username, password, display_name, banned, created_at FROM users WHERE id = ?1", &id.to_string())
        })
    }

    /// Moderation hook: a banned account keeps its rows but fails credential
    /// verification from then on.
    pub fn set_banned(&self, user_id: Uuid, banned: bool) -> Result<(), ChatError> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE users SET banned = ?2 WHERE id = ?1",
                params![user_id.to_string(), banned],
            )?;
            if updated == 0 {
                return Err(ChatError::NotFound("user"));
            }
            Ok(())
        })
    }

    // -- Listings --
    //
    // Listing CRUD lives outside this core; these stubs exist so the chat
    // directory can resolve a listing reference to an existing row and its
    // owner.

    pub fn insert_product(
        &self,
        id: Uuid,
        owner_id: Uuid,
        title: &str,
        price_taka: i64,
    ) -> Result<(), ChatError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO products (id, owner_id, title, price_taka, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.to_string(), owner_id.to_string(), title, price_taka, now_rfc3339()],
            )?;
            Ok(())
        })
    }

    pub fn insert_accommodation(
        &self,
        id: Uuid,
        owner_id: Uuid,
        title: &str,
        location: &str,
    ) -> Result<(), ChatError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO accommodations (id, owner_id, title, location, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.to_string(), owner_id.to_string(), title, location, now_rfc3339()],
            )?;
            Ok(())
        })
    }

    // -- Chat directory --

    /// Resolve or create the unique thread for a participant pair and listing
    /// context. The pair is unordered: `{a, b}` and `{b, a}` resolve to the
    /// same thread. Lookup and insert run in one transaction, so concurrent
    /// first-contact cannot create duplicates.
    ///
    /// When `counterparty_id` is absent the listing's owner is the
    /// counterparty (the REST create path).
    pub fn get_or_create_chat(
        &self,
        user_id: Uuid,
        counterparty_id: Option<Uuid>,
        listing: ListingRef,
    ) -> Result<ChatRow, ChatError> {
        if counterparty_id == Some(user_id) {
            return Err(ChatError::InvalidRequest(
                "cannot open a chat with yourself".into(),
            ));
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let user = user_id.to_string();
            let owner = listing_owner(&tx, &listing)?;
            if owner.as_deref() == Some(user.as_str()) {
                return Err(ChatError::InvalidRequest(
                    "cannot open a chat about your own listing".into(),
                ));
            }

            let counterparty = match counterparty_id {
                Some(id) => id.to_string(),
                None => owner.ok_or_else(|| {
                    ChatError::InvalidRequest(
                        "counterparty_id is required for a chat without a listing".into(),
                    )
                })?,
            };
            if counterparty == user {
                return Err(ChatError::InvalidRequest(
                    "cannot open a chat with yourself".into(),
                ));
            }
            if !user_exists(&tx, &counterparty)? {
                return Err(ChatError::NotFound("user"));
            }

            let chat = match find_chat(&tx, &user, &counterparty, &listing)? {
                Some(existing) => existing,
                None => {
                    let now = now_rfc3339();
                    let chat = ChatRow {
                        id: Uuid::new_v4().to_string(),
                        participant_a: user,
                        participant_b: counterparty,
                        product_id: listing.product_id().map(|id| id.to_string()),
                        accommodation_id: listing.accommodation_id().map(|id| id.to_string()),
                        created_at: now.clone(),
                        updated_at: now,
                    };
                    tx.execute(
                        "INSERT INTO chats (id, participant_a, participant_b, product_id, accommodation_id, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            chat.id,
                            chat.participant_a,
                            chat.participant_b,
                            chat.product_id,
                            chat.accommodation_id,
                            chat.created_at,
                            chat.updated_at
                        ],
                    )?;
                    chat
                }
            };

            tx.commit()?;
            Ok(chat)
        })
    }

    /// Succeeds silently when the user is one of the chat's two participants.
    /// Both the message-history fetch and the relay's join/send paths gate on
    /// this.
    pub fn assert_participant(&self, chat_id: Uuid, user_id: Uuid) -> Result<(), ChatError> {
        self.with_conn(|conn| {
            let chat =
                query_chat(conn, &chat_id.to_string())?.ok_or(ChatError::NotFound("chat"))?;
            let uid = user_id.to_string();
            if chat.participant_a == uid || chat.participant_b == uid {
                Ok(())
            } else {
                Err(ChatError::Forbidden)
            }
        })
    }

    /// All threads the user participates in, most recently active first, each
    /// annotated with the counterpart and the latest message. Full list every
    /// call; pagination is out of scope.
    pub fn list_threads_for(&self, user_id: Uuid) -> Result<Vec<ThreadRow>, ChatError> {
        self.with_conn(|conn| query_threads(conn, &user_id.to_string(), None))
    }

    pub fn get_thread(&self, user_id: Uuid, chat_id: &str) -> Result<ThreadRow, ChatError> {
        self.with_conn(|conn| {
            query_threads(conn, &user_id.to_string(), Some(chat_id))?
                .into_iter()
                .next()
                .ok_or(ChatError::NotFound("chat"))
        })
    }

    // -- Message store --

    /// Append a message to a chat's log and bump the chat's `updated_at`, in
    /// one transaction. Participancy is the caller's precondition; this layer
    /// only re-checks that the chat exists.
    pub fn append_message(
        &self,
        chat_id: Uuid,
        sender_id: Uuid,
        body: &str,
    ) -> Result<MessageRow, ChatError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ChatError::InvalidRequest(
                "message text must not be empty".into(),
            ));
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let cid = chat_id.to_string();
            if query_chat(&tx, &cid)?.is_none() {
                return Err(ChatError::NotFound("chat"));
            }

            let sid = sender_id.to_string();
            let sender_name: String = tx
                .query_row(
                    "SELECT display_name FROM users WHERE id = ?1",
                    [&sid],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(ChatError::NotFound("user"))?;

            let id = Uuid::new_v4().to_string();
            let now = now_rfc3339();
            tx.execute(
                "INSERT INTO messages (id, chat_id, sender_id, body, is_read, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![id, cid, sid, body, now],
            )?;
            tx.execute(
                "UPDATE chats SET updated_at = ?2 WHERE id = ?1",
                params![cid, now],
            )?;

            tx.commit()?;
            Ok(MessageRow {
                id,
                chat_id: cid,
                sender_id: sid,
                sender_name,
                body: body.to_string(),
                is_read: false,
                created_at: now,
            })
        })
    }

    /// The chat's full history in send order. Retrieval doubles as the read
    /// cursor: the *other* participant's unread messages flip to read in the
    /// same transaction, so callers must treat this as a write.
    pub fn list_and_mark_read(
        &self,
        chat_id: Uuid,
        reader_id: Uuid,
    ) -> Result<Vec<MessageRow>, ChatError> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let cid = chat_id.to_string();
            tx.execute(
                "UPDATE messages SET is_read = 1
                 WHERE chat_id = ?1 AND sender_id <> ?2 AND is_read = 0",
                params![cid, reader_id.to_string()],
            )?;

            let mut stmt = tx.prepare(
                "SELECT m.id, m.chat_id, m.sender_id, u.display_name, m.body, m.is_read, m.created_at
                 FROM messages m
                 LEFT JOIN users u ON u.id = m.sender_id
                 WHERE m.chat_id = ?1
                 ORDER BY m.created_at ASC, m.rowid ASC",
            )?;
            let rows = stmt
                .query_map([&cid], map_message_row)?
                .collect::<Result<Vec<_>, _>>()?;
            drop(stmt);

            tx.commit()?;
            Ok(rows)
        })
    }
}

/// Application-written RFC 3339 timestamps with microsecond precision.
/// Lexicographic order equals chronological order, and sub-second message
/// bursts keep their send order.
fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn query_user(conn: &Connection, sql: &str, key: &str) -> Result<Option<UserRow>, ChatError> {
    let mut stmt = conn.prepare(sql)?;
    let row = stmt
        .query_row([key], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                display_name: row.get(3)?,
                banned: row.get(4)?,
                created_at: row.get(5)?,
            })
        })
        .optional()?;
    Ok(row)
}

fn user_exists(conn: &Connection, id: &str) -> Result<bool, ChatError> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM users WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

/// Owner of the referenced listing; `Ok(None)` for a listing-less chat,
/// `NotFound` when the reference does not resolve.
fn listing_owner(conn: &Connection, listing: &ListingRef) -> Result<Option<String>, ChatError> {
    let (sql, id) = match listing {
        ListingRef::None => return Ok(None),
        ListingRef::Product(id) => ("SELECT owner_id FROM products WHERE id = ?1", id),
        ListingRef::Accommodation(id) => ("SELECT owner_id FROM accommodations WHERE id = ?1", id),
    };
    let owner: Option<String> = conn
        .query_row(sql, [id.to_string()], |row| row.get(0))
        .optional()?;
    match owner {
        Some(owner) => Ok(Some(owner)),
        None => Err(ChatError::NotFound("listing")),
    }
}

fn map_chat_row(row: &rusqlite::Row) -> rusqlite::Result<ChatRow> {
    Ok(ChatRow {
        id: row.get(0)?,
        participant_a: row.get(1)?,
        participant_b: row.get(2)?,
        product_id: row.get(3)?,
        accommodation_id: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn query_chat(conn: &Connection, chat_id: &str) -> Result<Option<ChatRow>, ChatError> {
    let mut stmt = conn.prepare(
        "SELECT id, participant_a, participant_b, product_id, accommodation_id, created_at, updated_at
         FROM chats WHERE id = ?1",
    )?;
    let row = stmt.query_row([chat_id], map_chat_row).optional()?;
    Ok(row)
}

/// The unordered-pair lookup: both participant orderings are OR'd, and the
/// listing columns compare with IS so a NULL ref matches only NULL.
fn find_chat(
    conn: &Connection,
    a: &str,
    b: &str,
    listing: &ListingRef,
) -> Result<Option<ChatRow>, ChatError> {
    let mut stmt = conn.prepare(
        "SELECT id, participant_a, participant_b, product_id, accommodation_id, created_at, updated_at
         FROM chats
         WHERE ((participant_a = ?1 AND participant_b = ?2)
             OR (participant_a = ?2 AND participant_b = ?1))
           AND product_id IS ?3
           AND accommodation_id IS ?4",
    )?;
    let row = stmt
        .query_row(
            params![
                a,
                b,
                listing.product_id().map(|id| id.to_string()),
                listing.accommodation_id().map(|id| id.to_string())
            ],
            map_chat_row,
        )
        .optional()?;
    Ok(row)
}

fn map_message_row(row: &rusqlite::Row) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row
            .get::<_, Option<String>>(3)?
            .unwrap_or_else(|| "unknown".to_string()),
        body: row.get(4)?,
        is_read: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn map_thread_row(row: &rusqlite::Row) -> rusqlite::Result<ThreadRow> {
    let chat = ChatRow {
        id: row.get(0)?,
        participant_a: row.get(1)?,
        participant_b: row.get(2)?,
        product_id: row.get(3)?,
        accommodation_id: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    };
    let counterpart_id: String = row.get(7)?;
    let counterpart_name = row
        .get::<_, Option<String>>(8)?
        .unwrap_or_else(|| "unknown".to_string());
    let last_message = match row.get::<_, Option<String>>(9)? {
        Some(id) => Some(MessageRow {
            id,
            chat_id: chat.id.clone(),
            sender_id: row.get(10)?,
            sender_name: row
                .get::<_, Option<String>>(11)?
                .unwrap_or_else(|| "unknown".to_string()),
            body: row.get(12)?,
            is_read: row.get(13)?,
            created_at: row.get(14)?,
        }),
        None => None,
    };
    Ok(ThreadRow {
        chat,
        counterpart_id,
        counterpart_name,
        last_message,
    })
}

fn query_threads(
    conn: &Connection,
    user_id: &str,
    chat_id: Option<&str>,
) -> Result<Vec<ThreadRow>, ChatError> {
    let mut sql = String::from(
        "SELECT c.id, c.participant_a, c.participant_b, c.product_id, c.accommodation_id,
                c.created_at, c.updated_at,
                CASE WHEN c.participant_a = ?1 THEN c.participant_b ELSE c.participant_a END,
                cu.display_name,
                m.id, m.sender_id, su.display_name, m.body, m.is_read, m.created_at
         FROM chats c
         LEFT JOIN users cu
             ON cu.id = CASE WHEN c.participant_a = ?1 THEN c.participant_b ELSE c.participant_a END
         LEFT JOIN messages m ON m.rowid = (
             SELECT m2.rowid FROM messages m2 WHERE m2.chat_id = c.id
             ORDER BY m2.created_at DESC, m2.rowid DESC LIMIT 1
         )
         LEFT JOIN users su ON su.id = m.sender_id
         WHERE (c.participant_a = ?1 OR c.participant_b = ?1)",
    );
    if chat_id.is_some() {
        sql.push_str(" AND c.id = ?2");
    }
    sql.push_str(" ORDER BY c.updated_at DESC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = match chat_id {
        Some(cid) => stmt
            .query_map(params![user_id, cid], map_thread_row)?
            .collect::<Result<Vec<_>, _>>()?,
        None => stmt
            .query_map([user_id], map_thread_row)?
            .collect::<Result<Vec<_>, _>>()?,
    };
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn seed_user(db: &Database, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(id, name, "argon2-hash", name).unwrap();
        id
    }

    fn seed_product(db: &Database, owner: Uuid) -> Uuid {
        let id = Uuid::new_v4();
        db.insert_product(id, owner, "used thermodynamics textbook", 350)
            .unwrap();
        id
    }

    #[test]
    fn get_or_create_is_idempotent_and_pair_is_unordered() {
        let db = test_db();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let carol = seed_user(&db, "carol");
        let product = seed_product(&db, carol);

        let first = db
            .get_or_create_chat(alice, Some(bob), ListingRef::Product(product))
            .unwrap();
        let again = db
            .get_or_create_chat(alice, Some(bob), ListingRef::Product(product))
            .unwrap();
        assert_eq!(first.id, again.id);

        let reversed = db
            .get_or_create_chat(bob, Some(alice), ListingRef::Product(product))
            .unwrap();
        assert_eq!(first.id, reversed.id);

        // Same pair, no listing context: a distinct thread.
        let general = db
            .get_or_create_chat(alice, Some(bob), ListingRef::None)
            .unwrap();
        assert_ne!(first.id, general.id);
        assert_eq!(db.list_threads_for(alice).unwrap().len(), 2);
    }

    #[test]
    fn listing_owner_becomes_the_counterparty() {
        let db = test_db();
        let buyer = seed_user(&db, "buyer");
        let seller = seed_user(&db, "seller");
        let product = seed_product(&db, seller);

        let chat = db
            .get_or_create_chat(buyer, None, ListingRef::Product(product))
            .unwrap();
        assert_eq!(chat.participant_a, buyer.to_string());
        assert_eq!(chat.participant_b, seller.to_string());
    }

    #[test]
    fn self_chat_is_rejected() {
        let db = test_db();
        let alice = seed_user(&db, "alice");

        let err = db
            .get_or_create_chat(alice, Some(alice), ListingRef::None)
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidRequest(_)));
    }

    #[test]
    fn own_listing_chat_is_rejected() {
        let db = test_db();
        let seller = seed_user(&db, "seller");
        let product = seed_product(&db, seller);

        let err = db
            .get_or_create_chat(seller, None, ListingRef::Product(product))
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidRequest(_)));
    }

    #[test]
    fn unresolved_listing_and_counterparty_are_not_found() {
        let db = test_db();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");

        let err = db
            .get_or_create_chat(alice, Some(bob), ListingRef::Product(Uuid::new_v4()))
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound("listing")));

        let err = db
            .get_or_create_chat(alice, Some(Uuid::new_v4()), ListingRef::None)
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound("user")));
    }

    #[test]
    fn missing_counterparty_for_listingless_chat_is_invalid() {
        let db = test_db();
        let alice = seed_user(&db, "alice");

        let err = db
            .get_or_create_chat(alice, None, ListingRef::None)
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidRequest(_)));
    }

    #[test]
    fn messages_come_back_in_send_order_and_unread() {
        let db = test_db();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let chat_row = db
            .get_or_create_chat(alice, Some(bob), ListingRef::None)
            .unwrap();
        let chat: Uuid = chat_row.id.parse().unwrap();

        db.append_message(chat, alice, "hello").unwrap();
        db.append_message(chat, bob, "hi").unwrap();
        db.append_message(chat, alice, "is the book still available?")
            .unwrap();

        // Thread listing shows the latest message, still unread.
        let threads = db.list_threads_for(alice).unwrap();
        let last = threads[0].last_message.as_ref().unwrap();
        assert_eq!(last.body, "is the book still available?");
        assert!(!last.is_read);

        let history = db.list_and_mark_read(chat, bob).unwrap();
        let bodies: Vec<&str> = history.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["hello", "hi", "is the book still available?"]);
        for pair in history.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
        }
    }

    #[test]
    fn fetching_history_marks_only_the_counterpart_messages_read() {
        let db = test_db();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let chat: Uuid = db
            .get_or_create_chat(alice, Some(bob), ListingRef::None)
            .unwrap()
            .id
            .parse()
            .unwrap();

        db.append_message(chat, alice, "hello").unwrap();
        db.append_message(chat, bob, "hi").unwrap();

        // Bob fetches: alice's message flips, bob's own stays as-is.
        let history = db.list_and_mark_read(chat, bob).unwrap();
        assert!(history[0].is_read);
        assert!(!history[1].is_read);

        // The flip persisted: a second fetch observes the same state.
        let history = db.list_and_mark_read(chat, bob).unwrap();
        assert!(history[0].is_read);
        assert!(!history[1].is_read);
    }

    #[test]
    fn empty_message_body_is_rejected() {
        let db = test_db();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let chat: Uuid = db
            .get_or_create_chat(alice, Some(bob), ListingRef::None)
            .unwrap()
            .id
            .parse()
            .unwrap();

        let err = db.append_message(chat, alice, "   ").unwrap_err();
        assert!(matches!(err, ChatError::InvalidRequest(_)));
        assert!(db.list_and_mark_read(chat, alice).unwrap().is_empty());
    }

    #[test]
    fn append_to_unknown_chat_is_not_found() {
        let db = test_db();
        let alice = seed_user(&db, "alice");

        let err = db
            .append_message(Uuid::new_v4(), alice, "hello")
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound("chat")));
    }

    #[test]
    fn new_message_bumps_the_thread_to_the_top() {
        let db = test_db();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let carol = seed_user(&db, "carol");

        let with_bob: Uuid = db
            .get_or_create_chat(alice, Some(bob), ListingRef::None)
            .unwrap()
            .id
            .parse()
            .unwrap();
        let with_carol = db
            .get_or_create_chat(alice, Some(carol), ListingRef::None)
            .unwrap();

        // The carol thread is newer, until bob's thread gets a message.
        let threads = db.list_threads_for(alice).unwrap();
        assert_eq!(threads[0].chat.id, with_carol.id);

        db.append_message(with_bob, bob, "hey").unwrap();
        let threads = db.list_threads_for(alice).unwrap();
        assert_eq!(threads[0].chat.id, with_bob.to_string());
        assert_eq!(threads[0].counterpart_name, "bob");
    }

    #[test]
    fn assert_participant_gates_outsiders() {
        let db = test_db();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let mallory = seed_user(&db, "mallory");
        let chat: Uuid = db
            .get_or_create_chat(alice, Some(bob), ListingRef::None)
            .unwrap()
            .id
            .parse()
            .unwrap();

        assert!(db.assert_participant(chat, alice).is_ok());
        assert!(db.assert_participant(chat, bob).is_ok());
        assert!(matches!(
            db.assert_participant(chat, mallory).unwrap_err(),
            ChatError::Forbidden
        ));
        assert!(matches!(
            db.assert_participant(Uuid::new_v4(), alice).unwrap_err(),
            ChatError::NotFound("chat")
        ));
    }
}
