use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// SQLite primary result codes that indicate another process holds the database.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_CANTOPEN: i32 = 14;

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process has locked the database
    #[error(
        "Another gator process appears to be using the database. \
         Please close it and try again."
    )]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// The requested row does not exist
    #[error("Not found: {0}")]
    NotFound(&'static str),

    /// A uniqueness constraint rejected the write
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Classify a sqlx error by its SQLite result code.
    ///
    /// Extended result codes carry the primary code in their low byte, so
    /// `SQLITE_BUSY_SNAPSHOT` (517) still reads as busy.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let primary = db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            if matches!(
                primary,
                Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) | Some(SQLITE_CANTOPEN)
            ) {
                return DatabaseError::InstanceLocked;
            }
        }

        DatabaseError::Other(err)
    }

    /// Map a unique-constraint violation to `AlreadyExists`, anything else
    /// through [`DatabaseError::from_sqlx`].
    pub(crate) fn from_insert(err: sqlx::Error, what: impl Into<String>) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return DatabaseError::AlreadyExists(what.into());
            }
        }
        Self::from_sqlx(err)
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A subscribed RSS source.
///
/// `url` is globally unique. `last_fetched_at_ms` is Unix milliseconds and
/// `None` until the feed is first claimed or fetched.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub user_id: i64,
    pub last_fetched_at_ms: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Feed listing row joined with the name of the user who added it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeedWithOwner {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub owner_name: String,
}

/// A user's subscription to a feed, with both names resolved for display.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FeedFollow {
    pub id: i64,
    pub user_id: i64,
    pub feed_id: i64,
    pub user_name: String,
    pub feed_name: String,
}

/// One ingested item. Unique per `(feed_id, url)` and never updated.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Post {
    pub id: i64,
    pub feed_id: i64,
    pub title: String,
    pub url: String,
    pub description: String,
    pub published_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Post fields supplied by the ingestion pipeline.
#[derive(Debug, Clone, Copy)]
pub struct NewPost<'a> {
    pub feed_id: i64,
    pub url: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    pub published_at: Option<i64>,
}

/// Result of [`insert_post_if_absent`](crate::storage::Database::insert_post_if_absent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was written with this id.
    Created(i64),
    /// A post with the same `(feed_id, url)` already exists; nothing was written.
    Conflict,
}
