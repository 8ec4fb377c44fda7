use anyhow::Result;

use super::schema::Database;
use super::types::{DatabaseError, InsertOutcome, NewPost, Post};

/// Maximum number of posts returned by `posts_for_user`
const MAX_BROWSE_LIMIT: i64 = 1000;

impl Database {
    // ========================================================================
    // Post Operations
    // ========================================================================

    /// Insert a post unless one with the same `(feed_id, url)` already exists.
    ///
    /// `ON CONFLICT ... DO NOTHING RETURNING id` yields no row for a duplicate,
    /// which is reported as [`InsertOutcome::Conflict`]. Existing posts are
    /// never modified.
    pub async fn insert_post_if_absent(
        &self,
        post: &NewPost<'_>,
    ) -> Result<InsertOutcome, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO posts
                (feed_id, title, url, description, published_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(feed_id, url) DO NOTHING
            RETURNING id
        "#,
        )
        .bind(post.feed_id)
        .bind(post.title)
        .bind(post.url)
        .bind(post.description)
        .bind(post.published_at)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(match row {
            Some((id,)) => InsertOutcome::Created(id),
            None => InsertOutcome::Conflict,
        })
    }

    /// Newest posts from the feeds `user_id` follows.
    ///
    /// Posts without a publish date sort after dated ones.
    pub async fn posts_for_user(&self, user_id: i64, limit: i64) -> Result<Vec<Post>> {
        let limit = limit.clamp(0, MAX_BROWSE_LIMIT);
        let posts = sqlx::query_as::<_, Post>(
            r#"
            SELECT p.id, p.feed_id, p.title, p.url, p.description, p.published_at,
                   p.created_at, p.updated_at
            FROM posts p
            JOIN feed_follows ff ON ff.feed_id = p.feed_id
            WHERE ff.user_id = ?
            ORDER BY p.published_at DESC NULLS LAST, p.created_at DESC, p.id DESC
            LIMIT ?
        "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(posts)
    }

    /// All posts stored for one feed, in insertion order.
    pub async fn posts_for_feed(&self, feed_id: i64) -> Result<Vec<Post>> {
        let posts = sqlx::query_as::<_, Post>(
            r#"
            SELECT id, feed_id, title, url, description, published_at, created_at, updated_at
            FROM posts
            WHERE feed_id = ?
            ORDER BY id
        "#,
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(posts)
    }
}
