use async_trait::async_trait;

use super::schema::Database;
use super::types::{DatabaseError, Feed, InsertOutcome, NewPost};

/// The storage operations the poller depends on.
///
/// [`Database`] is the production implementation. Each call must be atomic
/// on its own; the poller holds no lock across calls.
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Select the least-recently-fetched feed and stamp it in one step.
    ///
    /// `now_ms` is Unix milliseconds. Returns [`DatabaseError::NotFound`]
    /// when there are no feeds.
    async fn claim_next_feed(&self, now_ms: i64) -> Result<Feed, DatabaseError>;

    /// Set a feed's `last_fetched_at_ms`.
    async fn mark_feed_fetched(&self, feed_id: i64, fetched_at_ms: i64)
        -> Result<(), DatabaseError>;

    /// Store a post unless `(feed_id, url)` is already present.
    async fn insert_post_if_absent(&self, post: &NewPost<'_>)
        -> Result<InsertOutcome, DatabaseError>;
}

#[async_trait]
impl FeedStore for Database {
    async fn claim_next_feed(&self, now_ms: i64) -> Result<Feed, DatabaseError> {
        Database::claim_next_feed(self, now_ms).await
    }

    async fn mark_feed_fetched(
        &self,
        feed_id: i64,
        fetched_at_ms: i64,
    ) -> Result<(), DatabaseError> {
        Database::mark_feed_fetched(self, feed_id, fetched_at_ms).await
    }

    async fn insert_post_if_absent(
        &self,
        post: &NewPost<'_>,
    ) -> Result<InsertOutcome, DatabaseError> {
        Database::insert_post_if_absent(self, post).await
    }
}

#[async_trait]
impl<S: FeedStore + ?Sized> FeedStore for std::sync::Arc<S> {
    async fn claim_next_feed(&self, now_ms: i64) -> Result<Feed, DatabaseError> {
        (**self).claim_next_feed(now_ms).await
    }

    async fn mark_feed_fetched(
        &self,
        feed_id: i64,
        fetched_at_ms: i64,
    ) -> Result<(), DatabaseError> {
        (**self).mark_feed_fetched(feed_id, fetched_at_ms).await
    }

    async fn insert_post_if_absent(
        &self,
        post: &NewPost<'_>,
    ) -> Result<InsertOutcome, DatabaseError> {
        (**self).insert_post_if_absent(post).await
    }
}
