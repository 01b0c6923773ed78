use anyhow::{Context as _, anyhow};
use courier_api::{Contact, ConversationView, Direction, Message, User};
use rusqlite::{Connection, OptionalExtension as _, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tokio::sync::oneshot;

/// Store failures the API layer translates to specific status codes.
/// Everything else surfaces as a generic error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreError {
    ContactPhoneConflict,
    ContactNotFound,
    ConversationNotFound,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::ContactPhoneConflict => {
                write!(f, "a contact with that phone already exists")
            }
            StoreError::ContactNotFound => write!(f, "contact not found"),
            StoreError::ConversationNotFound => write!(f, "conversation not found"),
        }
    }
}

impl std::error::Error for StoreError {}

const LATEST_SCHEMA_VERSION: u32 = 1;

const DEFAULT_MESSAGE_PAGE: i64 = 100;
const MAX_MESSAGE_PAGE: i64 = 200;

/// Number sent/received on behalf of the workspace while no real carrier is
/// wired up.
pub const SIMULATED_PHONE: &str = "+1SIMULATED";

const MIGRATIONS: &[(u32, &str)] = &[(
    1,
    include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/migrations/0001_init.sql"
    )),
)];

const CONVERSATION_VIEW_SELECT: &str = "
    SELECT
        c.id,
        c.workspace_id,
        c.contact_id,
        c.phone,
        c.last_message_at,
        c.unread_count,
        c.created_at,
        ct.name AS contact_name,
        (
            SELECT body FROM messages m
            WHERE m.conversation_id = c.id
            ORDER BY m.created_at DESC
            LIMIT 1
        ) AS last_message_body,
        (
            SELECT direction FROM messages m
            WHERE m.conversation_id = c.id
            ORDER BY m.created_at DESC
            LIMIT 1
        ) AS last_message_direction
    FROM conversations c
    LEFT JOIN contacts ct ON c.contact_id = ct.id";

/// Handle to the persistence worker. All SQL runs on one dedicated thread;
/// commands are queued over a channel and answered over oneshot replies, so
/// async callers await without blocking the runtime.
#[derive(Clone)]
pub struct SqliteStore {
    tx: mpsc::Sender<DbCommand>,
}

enum DbCommand {
    FindOrCreateUser {
        workspace_id: String,
        display_name: String,
        reply: oneshot::Sender<anyhow::Result<User>>,
    },
    ListConversations {
        workspace_id: String,
        reply: oneshot::Sender<anyhow::Result<Vec<ConversationView>>>,
    },
    ListMessages {
        workspace_id: String,
        conversation_id: String,
        limit: Option<i64>,
        before: Option<i64>,
        reply: oneshot::Sender<anyhow::Result<Vec<Message>>>,
    },
    MarkRead {
        workspace_id: String,
        conversation_id: String,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    EnsureConversation {
        workspace_id: String,
        phone: String,
        reply: oneshot::Sender<anyhow::Result<(ConversationView, Option<Contact>)>>,
    },
    InsertMessage {
        workspace_id: String,
        conversation_id: String,
        direction: Direction,
        from_phone: String,
        to_phone: String,
        body: String,
        reply: oneshot::Sender<anyhow::Result<Message>>,
    },
    TouchConversation {
        workspace_id: String,
        conversation_id: String,
        last_message_at: i64,
        increment_unread: bool,
        reply: oneshot::Sender<anyhow::Result<ConversationView>>,
    },
    ListContacts {
        workspace_id: String,
        reply: oneshot::Sender<anyhow::Result<Vec<Contact>>>,
    },
    CreateContact {
        workspace_id: String,
        name: String,
        phone: String,
        reply: oneshot::Sender<anyhow::Result<Contact>>,
    },
    UpdateContact {
        workspace_id: String,
        contact_id: String,
        name: String,
        phone: String,
        reply: oneshot::Sender<anyhow::Result<Contact>>,
    },
    DeleteContact {
        workspace_id: String,
        contact_id: String,
        reply: oneshot::Sender<anyhow::Result<Option<Contact>>>,
    },
    LinkConversationByPhone {
        workspace_id: String,
        contact_id: String,
        phone: String,
        reply: oneshot::Sender<anyhow::Result<Option<ConversationView>>>,
    },
}

impl SqliteStore {
    pub fn new(db_path: PathBuf) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel::<DbCommand>();

        std::thread::Builder::new()
            .name("courier-sqlite".to_owned())
            .spawn(move || {
                let mut db = SqliteDatabase::open(&db_path);
                while let Ok(cmd) = rx.recv() {
                    match (&mut db, cmd) {
                        (
                            Ok(db),
                            DbCommand::FindOrCreateUser {
                                workspace_id,
                                display_name,
                                reply,
                            },
                        ) => {
                            let _ = reply.send(db.find_or_create_user(&workspace_id, &display_name));
                        }
                        (
                            Ok(db),
                            DbCommand::ListConversations {
                                workspace_id,
                                reply,
                            },
                        ) => {
                            let _ = reply.send(db.list_conversations(&workspace_id));
                        }
                        (
                            Ok(db),
                            DbCommand::ListMessages {
                                workspace_id,
                                conversation_id,
                                limit,
                                before,
                                reply,
                            },
                        ) => {
                            let _ = reply.send(db.list_messages(
                                &workspace_id,
                                &conversation_id,
                                limit,
                                before,
                            ));
                        }
                        (
                            Ok(db),
                            DbCommand::MarkRead {
                                workspace_id,
                                conversation_id,
                                reply,
                            },
                        ) => {
                            let _ = reply.send(db.mark_read(&workspace_id, &conversation_id));
                        }
                        (
                            Ok(db),
                            DbCommand::EnsureConversation {
                                workspace_id,
                                phone,
                                reply,
                            },
                        ) => {
                            let _ = reply.send(db.ensure_conversation(&workspace_id, &phone));
                        }
                        (
                            Ok(db),
                            DbCommand::InsertMessage {
                                workspace_id,
                                conversation_id,
                                direction,
                                from_phone,
                                to_phone,
                                body,
                                reply,
                            },
                        ) => {
                            let _ = reply.send(db.insert_message(
                                &workspace_id,
                                &conversation_id,
                                direction,
                                &from_phone,
                                &to_phone,
                                &body,
                            ));
                        }
                        (
                            Ok(db),
                            DbCommand::TouchConversation {
                                workspace_id,
                                conversation_id,
                                last_message_at,
                                increment_unread,
                                reply,
                            },
                        ) => {
                            let _ = reply.send(db.touch_conversation(
                                &workspace_id,
                                &conversation_id,
                                last_message_at,
                                increment_unread,
                            ));
                        }
                        (
                            Ok(db),
                            DbCommand::ListContacts {
                                workspace_id,
                                reply,
                            },
                        ) => {
                            let _ = reply.send(db.list_contacts(&workspace_id));
                        }
                        (
                            Ok(db),
                            DbCommand::CreateContact {
                                workspace_id,
                                name,
                                phone,
                                reply,
                            },
                        ) => {
                            let _ = reply.send(db.create_contact(&workspace_id, &name, &phone));
                        }
                        (
                            Ok(db),
                            DbCommand::UpdateContact {
                                workspace_id,
                                contact_id,
                                name,
                                phone,
                                reply,
                            },
                        ) => {
                            let _ = reply.send(db.update_contact(
                                &workspace_id,
                                &contact_id,
                                &name,
                                &phone,
                            ));
                        }
                        (
                            Ok(db),
                            DbCommand::DeleteContact {
                                workspace_id,
                                contact_id,
                                reply,
                            },
                        ) => {
                            let _ = reply.send(db.delete_contact(&workspace_id, &contact_id));
                        }
                        (
                            Ok(db),
                            DbCommand::LinkConversationByPhone {
                                workspace_id,
                                contact_id,
                                phone,
                                reply,
                            },
                        ) => {
                            let _ = reply.send(db.link_conversation_by_phone(
                                &workspace_id,
                                &contact_id,
                                &phone,
                            ));
                        }
                        (Err(open_err), cmd) => respond_db_open_error(open_err, cmd),
                    }
                }
            })
            .context("failed to spawn sqlite worker thread")?;

        Ok(Self { tx })
    }

    fn send(&self, cmd: DbCommand) -> anyhow::Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| anyhow!("sqlite worker terminated"))
    }

    pub async fn find_or_create_user(
        &self,
        workspace_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> anyhow::Result<User> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(DbCommand::FindOrCreateUser {
            workspace_id: workspace_id.into(),
            display_name: display_name.into(),
            reply,
        })?;
        reply_rx.await.context("sqlite worker terminated")?
    }

    pub async fn list_conversations(
        &self,
        workspace_id: impl Into<String>,
    ) -> anyhow::Result<Vec<ConversationView>> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(DbCommand::ListConversations {
            workspace_id: workspace_id.into(),
            reply,
        })?;
        reply_rx.await.context("sqlite worker terminated")?
    }

    /// Newest-first internally, clamped to [1, 200] (default 100), optionally
    /// bounded by `created_at < before`, then reversed so the returned page is
    /// oldest to newest.
    pub async fn list_messages(
        &self,
        workspace_id: impl Into<String>,
        conversation_id: impl Into<String>,
        limit: Option<i64>,
        before: Option<i64>,
    ) -> anyhow::Result<Vec<Message>> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(DbCommand::ListMessages {
            workspace_id: workspace_id.into(),
            conversation_id: conversation_id.into(),
            limit,
            before,
            reply,
        })?;
        reply_rx.await.context("sqlite worker terminated")?
    }

    pub async fn mark_read(
        &self,
        workspace_id: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> anyhow::Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(DbCommand::MarkRead {
            workspace_id: workspace_id.into(),
            conversation_id: conversation_id.into(),
            reply,
        })?;
        reply_rx.await.context("sqlite worker terminated")?
    }

    /// Find or lazily create the single conversation for (workspace, phone),
    /// linking it to the matching contact when one exists. Creation races are
    /// resolved by the unique index plus refetch; re-entry is idempotent.
    pub async fn ensure_conversation(
        &self,
        workspace_id: impl Into<String>,
        phone: impl Into<String>,
    ) -> anyhow::Result<(ConversationView, Option<Contact>)> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(DbCommand::EnsureConversation {
            workspace_id: workspace_id.into(),
            phone: phone.into(),
            reply,
        })?;
        reply_rx.await.context("sqlite worker terminated")?
    }

    pub async fn insert_message(
        &self,
        workspace_id: impl Into<String>,
        conversation_id: impl Into<String>,
        direction: Direction,
        from_phone: impl Into<String>,
        to_phone: impl Into<String>,
        body: impl Into<String>,
    ) -> anyhow::Result<Message> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(DbCommand::InsertMessage {
            workspace_id: workspace_id.into(),
            conversation_id: conversation_id.into(),
            direction,
            from_phone: from_phone.into(),
            to_phone: to_phone.into(),
            body: body.into(),
            reply,
        })?;
        reply_rx.await.context("sqlite worker terminated")?
    }

    /// Bump `last_message_at` (and `unread_count` for inbound messages) and
    /// return the refreshed denormalized view.
    pub async fn touch_conversation(
        &self,
        workspace_id: impl Into<String>,
        conversation_id: impl Into<String>,
        last_message_at: i64,
        increment_unread: bool,
    ) -> anyhow::Result<ConversationView> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(DbCommand::TouchConversation {
            workspace_id: workspace_id.into(),
            conversation_id: conversation_id.into(),
            last_message_at,
            increment_unread,
            reply,
        })?;
        reply_rx.await.context("sqlite worker terminated")?
    }

    pub async fn list_contacts(
        &self,
        workspace_id: impl Into<String>,
    ) -> anyhow::Result<Vec<Contact>> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(DbCommand::ListContacts {
            workspace_id: workspace_id.into(),
            reply,
        })?;
        reply_rx.await.context("sqlite worker terminated")?
    }

    pub async fn create_contact(
        &self,
        workspace_id: impl Into<String>,
        name: impl Into<String>,
        phone: impl Into<String>,
    ) -> anyhow::Result<Contact> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(DbCommand::CreateContact {
            workspace_id: workspace_id.into(),
            name: name.into(),
            phone: phone.into(),
            reply,
        })?;
        reply_rx.await.context("sqlite worker terminated")?
    }

    pub async fn update_contact(
        &self,
        workspace_id: impl Into<String>,
        contact_id: impl Into<String>,
        name: impl Into<String>,
        phone: impl Into<String>,
    ) -> anyhow::Result<Contact> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(DbCommand::UpdateContact {
            workspace_id: workspace_id.into(),
            contact_id: contact_id.into(),
            name: name.into(),
            phone: phone.into(),
            reply,
        })?;
        reply_rx.await.context("sqlite worker terminated")?
    }

    /// Delete a contact and detach (not delete) its conversation. Returns the
    /// deleted contact, or `None` when the id was unknown.
    pub async fn delete_contact(
        &self,
        workspace_id: impl Into<String>,
        contact_id: impl Into<String>,
    ) -> anyhow::Result<Option<Contact>> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(DbCommand::DeleteContact {
            workspace_id: workspace_id.into(),
            contact_id: contact_id.into(),
            reply,
        })?;
        reply_rx.await.context("sqlite worker terminated")?
    }

    /// Point the conversation with this phone (if any) at the contact and
    /// return its refreshed view.
    pub async fn link_conversation_by_phone(
        &self,
        workspace_id: impl Into<String>,
        contact: &Contact,
    ) -> anyhow::Result<Option<ConversationView>> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(DbCommand::LinkConversationByPhone {
            workspace_id: workspace_id.into(),
            contact_id: contact.id.clone(),
            phone: contact.phone.clone(),
            reply,
        })?;
        reply_rx.await.context("sqlite worker terminated")?
    }
}

fn respond_db_open_error(err: &anyhow::Error, cmd: DbCommand) {
    let message = format!("{err:#}");
    match cmd {
        DbCommand::FindOrCreateUser { reply, .. } => {
            let _ = reply.send(Err(anyhow!(message)));
        }
        DbCommand::ListConversations { reply, .. } => {
            let _ = reply.send(Err(anyhow!(message)));
        }
        DbCommand::ListMessages { reply, .. } => {
            let _ = reply.send(Err(anyhow!(message)));
        }
        DbCommand::MarkRead { reply, .. } => {
            let _ = reply.send(Err(anyhow!(message)));
        }
        DbCommand::EnsureConversation { reply, .. } => {
            let _ = reply.send(Err(anyhow!(message)));
        }
        DbCommand::InsertMessage { reply, .. } => {
            let _ = reply.send(Err(anyhow!(message)));
        }
        DbCommand::TouchConversation { reply, .. } => {
            let _ = reply.send(Err(anyhow!(message)));
        }
        DbCommand::ListContacts { reply, .. } => {
            let _ = reply.send(Err(anyhow!(message)));
        }
        DbCommand::CreateContact { reply, .. } => {
            let _ = reply.send(Err(anyhow!(message)));
        }
        DbCommand::UpdateContact { reply, .. } => {
            let _ = reply.send(Err(anyhow!(message)));
        }
        DbCommand::DeleteContact { reply, .. } => {
            let _ = reply.send(Err(anyhow!(message)));
        }
        DbCommand::LinkConversationByPhone { reply, .. } => {
            let _ = reply.send(Err(anyhow!(message)));
        }
    }
}

struct SqliteDatabase {
    conn: Connection,
    // Message timestamps are strictly increasing per worker so that
    // created_at pagination stays stable even within one millisecond.
    last_message_at: i64,
}

impl SqliteDatabase {
    fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut conn = Connection::open(db_path)
            .with_context(|| format!("failed to open sqlite db {}", db_path.display()))?;

        configure_connection(&mut conn).context("failed to configure sqlite connection")?;
        apply_migrations(&mut conn).context("failed to apply sqlite migrations")?;

        Ok(Self {
            conn,
            last_message_at: 0,
        })
    }

    fn next_message_timestamp(&mut self) -> i64 {
        let now = crate::time::unix_epoch_millis_now();
        self.last_message_at = now.max(self.last_message_at + 1);
        self.last_message_at
    }

    fn find_or_create_user(
        &mut self,
        workspace_id: &str,
        display_name: &str,
    ) -> anyhow::Result<User> {
        let existing = self
            .conn
            .query_row(
                "SELECT id, workspace_id, display_name, created_at FROM users
                 WHERE workspace_id = ?1 AND display_name = ?2",
                params![workspace_id, display_name],
                user_from_row,
            )
            .optional()
            .context("failed to look up user")?;

        if let Some(user) = existing {
            return Ok(user);
        }

        let user = User {
            id: new_id(),
            workspace_id: workspace_id.to_owned(),
            display_name: display_name.to_owned(),
            created_at: crate::time::unix_epoch_millis_now(),
        };
        self.conn
            .execute(
                "INSERT INTO users (id, workspace_id, display_name, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user.id, user.workspace_id, user.display_name, user.created_at],
            )
            .context("failed to insert user")?;
        Ok(user)
    }

    fn list_conversations(&mut self, workspace_id: &str) -> anyhow::Result<Vec<ConversationView>> {
        let sql = format!(
            "{CONVERSATION_VIEW_SELECT}
             WHERE c.workspace_id = ?1
             ORDER BY c.last_message_at IS NULL, c.last_message_at DESC, c.created_at DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![workspace_id], conversation_view_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to read conversation row")?);
        }
        Ok(out)
    }

    fn list_messages(
        &mut self,
        workspace_id: &str,
        conversation_id: &str,
        limit: Option<i64>,
        before: Option<i64>,
    ) -> anyhow::Result<Vec<Message>> {
        let limit = limit
            .unwrap_or(DEFAULT_MESSAGE_PAGE)
            .clamp(1, MAX_MESSAGE_PAGE);

        let mut messages = match before {
            Some(before) => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, workspace_id, conversation_id, direction, from_phone, to_phone,
                            body, created_at, provider_message_id, status
                     FROM messages
                     WHERE workspace_id = ?1 AND conversation_id = ?2 AND created_at < ?3
                     ORDER BY created_at DESC
                     LIMIT ?4",
                )?;
                let rows = stmt.query_map(
                    params![workspace_id, conversation_id, before, limit],
                    message_from_row,
                )?;
                collect_messages(rows)?
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT id, workspace_id, conversation_id, direction, from_phone, to_phone,
                            body, created_at, provider_message_id, status
                     FROM messages
                     WHERE workspace_id = ?1 AND conversation_id = ?2
                     ORDER BY created_at DESC
                     LIMIT ?3",
                )?;
                let rows = stmt.query_map(
                    params![workspace_id, conversation_id, limit],
                    message_from_row,
                )?;
                collect_messages(rows)?
            }
        };

        // Queried newest-first; callers consume oldest-first.
        messages.reverse();
        Ok(messages)
    }

    fn mark_read(&mut self, workspace_id: &str, conversation_id: &str) -> anyhow::Result<()> {
        self.conn
            .execute(
                "UPDATE conversations SET unread_count = 0
                 WHERE id = ?1 AND workspace_id = ?2",
                params![conversation_id, workspace_id],
            )
            .context("failed to mark conversation read")?;
        Ok(())
    }

    fn ensure_conversation(
        &mut self,
        workspace_id: &str,
        phone: &str,
    ) -> anyhow::Result<(ConversationView, Option<Contact>)> {
        let contact = self
            .conn
            .query_row(
                "SELECT id, workspace_id, name, phone, created_at FROM contacts
                 WHERE workspace_id = ?1 AND phone = ?2",
                params![workspace_id, phone],
                contact_from_row,
            )
            .optional()
            .context("failed to look up contact by phone")?;

        let existing = self.conversation_view_by_phone(workspace_id, phone)?;

        let conversation = match existing {
            Some(conversation) => {
                if let Some(contact) = &contact
                    && conversation.contact_id.as_deref() != Some(contact.id.as_str())
                {
                    self.conn
                        .execute(
                            "UPDATE conversations SET contact_id = ?1 WHERE id = ?2",
                            params![contact.id, conversation.id],
                        )
                        .context("failed to relink conversation contact")?;
                    ConversationView {
                        contact_id: Some(contact.id.clone()),
                        contact_name: Some(contact.name.clone()),
                        ..conversation
                    }
                } else {
                    conversation
                }
            }
            None => {
                let created_at = crate::time::unix_epoch_millis_now();
                // A concurrent insert for the same phone loses the race here
                // and falls through to the refetch below.
                self.conn
                    .execute(
                        "INSERT INTO conversations
                             (id, workspace_id, contact_id, phone, last_message_at, unread_count, created_at)
                         VALUES (?1, ?2, ?3, ?4, NULL, 0, ?5)
                         ON CONFLICT (workspace_id, phone) DO NOTHING",
                        params![
                            new_id(),
                            workspace_id,
                            contact.as_ref().map(|c| c.id.as_str()),
                            phone,
                            created_at
                        ],
                    )
                    .context("failed to insert conversation")?;
                self.conversation_view_by_phone(workspace_id, phone)?
                    .ok_or(StoreError::ConversationNotFound)
                    .context("conversation missing after insert")?
            }
        };

        Ok((conversation, contact))
    }

    fn insert_message(
        &mut self,
        workspace_id: &str,
        conversation_id: &str,
        direction: Direction,
        from_phone: &str,
        to_phone: &str,
        body: &str,
    ) -> anyhow::Result<Message> {
        let message = Message {
            id: new_id(),
            workspace_id: workspace_id.to_owned(),
            conversation_id: conversation_id.to_owned(),
            direction,
            from_phone: from_phone.to_owned(),
            to_phone: to_phone.to_owned(),
            body: body.to_owned(),
            created_at: self.next_message_timestamp(),
            provider_message_id: Some(new_id()),
            status: "sent".to_owned(),
        };

        self.conn
            .execute(
                "INSERT INTO messages
                     (id, workspace_id, conversation_id, direction, from_phone, to_phone,
                      body, created_at, provider_message_id, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    message.id,
                    message.workspace_id,
                    message.conversation_id,
                    message.direction.as_str(),
                    message.from_phone,
                    message.to_phone,
                    message.body,
                    message.created_at,
                    message.provider_message_id,
                    message.status
                ],
            )
            .context("failed to insert message")?;

        Ok(message)
    }

    fn touch_conversation(
        &mut self,
        workspace_id: &str,
        conversation_id: &str,
        last_message_at: i64,
        increment_unread: bool,
    ) -> anyhow::Result<ConversationView> {
        // Update and refetch under one transaction so a concurrent send
        // cannot interleave between the write and the denormalized read.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin touch transaction")?;

        tx.execute(
            "UPDATE conversations
             SET last_message_at = ?1,
                 unread_count = CASE WHEN ?2 THEN unread_count + 1 ELSE unread_count END
             WHERE id = ?3 AND workspace_id = ?4",
            params![last_message_at, increment_unread, conversation_id, workspace_id],
        )
        .context("failed to touch conversation")?;

        let sql = format!("{CONVERSATION_VIEW_SELECT} WHERE c.id = ?1 AND c.workspace_id = ?2");
        let conversation = tx
            .query_row(
                &sql,
                params![conversation_id, workspace_id],
                conversation_view_from_row,
            )
            .optional()
            .context("failed to reload conversation")?
            .ok_or(StoreError::ConversationNotFound)?;

        tx.commit().context("failed to commit touch transaction")?;
        Ok(conversation)
    }

    fn list_contacts(&mut self, workspace_id: &str) -> anyhow::Result<Vec<Contact>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, workspace_id, name, phone, created_at FROM contacts
             WHERE workspace_id = ?1
             ORDER BY name ASC",
        )?;
        let rows = stmt.query_map(params![workspace_id], contact_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to read contact row")?);
        }
        Ok(out)
    }

    fn create_contact(
        &mut self,
        workspace_id: &str,
        name: &str,
        phone: &str,
    ) -> anyhow::Result<Contact> {
        let contact = Contact {
            id: new_id(),
            workspace_id: workspace_id.to_owned(),
            name: name.to_owned(),
            phone: phone.to_owned(),
            created_at: crate::time::unix_epoch_millis_now(),
        };

        let inserted = self.conn.execute(
            "INSERT INTO contacts (id, workspace_id, name, phone, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                contact.id,
                contact.workspace_id,
                contact.name,
                contact.phone,
                contact.created_at
            ],
        );

        match inserted {
            Ok(_) => Ok(contact),
            Err(err) if is_unique_violation(&err) => Err(StoreError::ContactPhoneConflict.into()),
            Err(err) => Err(err).context("failed to insert contact"),
        }
    }

    fn update_contact(
        &mut self,
        workspace_id: &str,
        contact_id: &str,
        name: &str,
        phone: &str,
    ) -> anyhow::Result<Contact> {
        let updated = self.conn.execute(
            "UPDATE contacts SET name = ?1, phone = ?2
             WHERE id = ?3 AND workspace_id = ?4",
            params![name, phone, contact_id, workspace_id],
        );

        match updated {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StoreError::ContactPhoneConflict.into());
            }
            Err(err) => return Err(err).context("failed to update contact"),
        }

        self.conn
            .query_row(
                "SELECT id, workspace_id, name, phone, created_at FROM contacts
                 WHERE id = ?1 AND workspace_id = ?2",
                params![contact_id, workspace_id],
                contact_from_row,
            )
            .optional()
            .context("failed to reload contact")?
            .ok_or_else(|| StoreError::ContactNotFound.into())
    }

    fn delete_contact(
        &mut self,
        workspace_id: &str,
        contact_id: &str,
    ) -> anyhow::Result<Option<Contact>> {
        let contact = self
            .conn
            .query_row(
                "SELECT id, workspace_id, name, phone, created_at FROM contacts
                 WHERE id = ?1 AND workspace_id = ?2",
                params![contact_id, workspace_id],
                contact_from_row,
            )
            .optional()
            .context("failed to look up contact")?;

        self.conn
            .execute(
                "DELETE FROM contacts WHERE id = ?1 AND workspace_id = ?2",
                params![contact_id, workspace_id],
            )
            .context("failed to delete contact")?;

        if let Some(contact) = &contact {
            self.conn
                .execute(
                    "UPDATE conversations SET contact_id = NULL
                     WHERE workspace_id = ?1 AND phone = ?2",
                    params![workspace_id, contact.phone],
                )
                .context("failed to detach conversation contact")?;
        }

        Ok(contact)
    }

    fn link_conversation_by_phone(
        &mut self,
        workspace_id: &str,
        contact_id: &str,
        phone: &str,
    ) -> anyhow::Result<Option<ConversationView>> {
        self.conn
            .execute(
                "UPDATE conversations SET contact_id = ?1
                 WHERE workspace_id = ?2 AND phone = ?3",
                params![contact_id, workspace_id, phone],
            )
            .context("failed to link conversation contact")?;

        self.conversation_view_by_phone(workspace_id, phone)
    }

    fn conversation_view_by_phone(
        &self,
        workspace_id: &str,
        phone: &str,
    ) -> anyhow::Result<Option<ConversationView>> {
        let sql = format!("{CONVERSATION_VIEW_SELECT} WHERE c.workspace_id = ?1 AND c.phone = ?2");
        self.conn
            .query_row(&sql, params![workspace_id, phone], conversation_view_from_row)
            .optional()
            .context("failed to load conversation by phone")
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn collect_messages(
    rows: impl Iterator<Item = rusqlite::Result<Message>>,
) -> anyhow::Result<Vec<Message>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to read message row")?);
    }
    Ok(out)
}

fn parse_direction(raw: &str) -> rusqlite::Result<Direction> {
    Direction::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("invalid message direction: {raw}").into(),
        )
    })
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        display_name: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn contact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        phone: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let direction: String = row.get(3)?;
    Ok(Message {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        conversation_id: row.get(2)?,
        direction: parse_direction(&direction)?,
        from_phone: row.get(4)?,
        to_phone: row.get(5)?,
        body: row.get(6)?,
        created_at: row.get(7)?,
        provider_message_id: row.get(8)?,
        status: row.get(9)?,
    })
}

fn conversation_view_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationView> {
    let last_message_direction: Option<String> = row.get(9)?;
    Ok(ConversationView {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        contact_id: row.get(2)?,
        phone: row.get(3)?,
        last_message_at: row.get(4)?,
        unread_count: row.get(5)?,
        created_at: row.get(6)?,
        contact_name: row.get(7)?,
        last_message_body: row.get(8)?,
        last_message_direction: last_message_direction
            .as_deref()
            .map(parse_direction)
            .transpose()?,
    })
}

fn configure_connection(conn: &mut Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to apply sqlite PRAGMAs")?;
    Ok(())
}

fn apply_migrations(conn: &mut Connection) -> anyhow::Result<()> {
    let mut current: u32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))
        .context("failed to read user_version")? as u32;

    if current > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "sqlite schema version is newer than this build: db={}, app={}",
            current,
            LATEST_SCHEMA_VERSION
        ));
    }

    if current == LATEST_SCHEMA_VERSION {
        return Ok(());
    }

    conn.execute_batch("BEGIN IMMEDIATE;")
        .context("failed to begin migration transaction")?;

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        conn.execute_batch(sql)
            .with_context(|| format!("failed to apply migration v{version:04}"))?;
        conn.pragma_update(None, "user_version", *version as i64)
            .context("failed to update user_version")?;
        current = *version;
    }

    conn.execute_batch("COMMIT;")
        .context("failed to commit migration transaction")?;
    Ok(())
}
