use anyhow::Result;

use super::schema::Database;
use super::types::{DatabaseError, Feed, FeedWithOwner};

const FEED_COLUMNS: &str = "id, name, url, user_id, last_fetched_at_ms, created_at, updated_at";

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Add a feed owned by `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::AlreadyExists`] if another feed already uses `url`.
    pub async fn create_feed(
        &self,
        name: &str,
        url: &str,
        user_id: i64,
    ) -> Result<Feed, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query_as::<_, Feed>(&format!(
            r#"
            INSERT INTO feeds (name, url, user_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING {FEED_COLUMNS}
        "#
        ))
        .bind(name)
        .bind(url)
        .bind(user_id)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DatabaseError::from_insert(e, format!("feed '{}'", url)))
    }

    /// Look up a feed by its id.
    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"
        ))
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(feed)
    }

    /// Look up a feed by its (unique) URL.
    pub async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE url = ?"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(feed)
    }

    /// All feeds with the name of the user who added each one.
    pub async fn list_feeds_with_owner(&self) -> Result<Vec<FeedWithOwner>> {
        let feeds = sqlx::query_as::<_, FeedWithOwner>(
            r#"
            SELECT f.id, f.name, f.url, u.name AS owner_name
            FROM feeds f
            JOIN users u ON u.id = f.user_id
            ORDER BY f.name, f.id
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(feeds)
    }

    // ========================================================================
    // Poller Operations
    // ========================================================================

    /// Claim the least-recently-fetched feed and stamp it with `now_ms`.
    ///
    /// Never-fetched feeds (NULL `last_fetched_at_ms`) come first, ties break
    /// on id. Selection and stamping happen in one `UPDATE ... RETURNING`
    /// statement, so two pollers sharing the database cannot claim the same
    /// feed for the same turn. The returned row carries the new stamp.
    ///
    /// The stamp is `now_ms`, or one past the newest stamp in the table when
    /// the clock has not moved past it. Every claim therefore sorts after all
    /// earlier ones and N consecutive claims visit N distinct feeds.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::NotFound`] when there are no feeds.
    pub async fn claim_next_feed(&self, now_ms: i64) -> Result<Feed, DatabaseError> {
        sqlx::query_as::<_, Feed>(&format!(
            r#"
            UPDATE feeds
            SET last_fetched_at_ms = MAX(
                    ?1,
                    COALESCE((SELECT MAX(last_fetched_at_ms) FROM feeds) + 1, ?1)
                ),
                updated_at = ?2
            WHERE id = (
                SELECT id FROM feeds
                ORDER BY last_fetched_at_ms ASC NULLS FIRST, id ASC
                LIMIT 1
            )
            RETURNING {FEED_COLUMNS}
        "#
        ))
        .bind(now_ms)
        .bind(now_ms.div_euclid(1000))
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .ok_or(DatabaseError::NotFound("feed"))
    }

    /// Record that `feed_id` was fetched at `fetched_at_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::NotFound`] if the feed does not exist.
    pub async fn mark_feed_fetched(
        &self,
        feed_id: i64,
        fetched_at_ms: i64,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE feeds SET last_fetched_at_ms = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(fetched_at_ms)
        .bind(fetched_at_ms.div_euclid(1000))
        .bind(feed_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound("feed"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, DatabaseError};

    async fn test_db() -> (Database, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let user = db.create_user("alice").await.unwrap();
        (db, user.id)
    }

    #[tokio::test]
    async fn test_create_feed_and_lookup() {
        let (db, user_id) = test_db().await;
        let feed = db
            .create_feed("Example", "https://example.com/rss", user_id)
            .await
            .unwrap();

        assert_eq!(feed.name, "Example");
        assert_eq!(feed.user_id, user_id);
        assert!(feed.last_fetched_at_ms.is_none());

        let by_url = db.get_feed_by_url("https://example.com/rss").await.unwrap();
        assert_eq!(by_url.as_ref(), Some(&feed));
        let by_id = db.get_feed(feed.id).await.unwrap();
        assert_eq!(by_id, Some(feed));
    }

    #[tokio::test]
    async fn test_create_feed_duplicate_url_rejected() {
        let (db, user_id) = test_db().await;
        db.create_feed("One", "https://example.com/rss", user_id)
            .await
            .unwrap();

        let err = db
            .create_feed("Two", "https://example.com/rss", user_id)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::AlreadyExists(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_list_feeds_with_owner() {
        let (db, alice) = test_db().await;
        let bob = db.create_user("bob").await.unwrap().id;
        db.create_feed("Zeta", "https://z.example.com/rss", alice)
            .await
            .unwrap();
        db.create_feed("Alpha", "https://a.example.com/rss", bob)
            .await
            .unwrap();

        let feeds = db.list_feeds_with_owner().await.unwrap();
        assert_eq!(feeds.len(), 2);
        assert_eq!(feeds[0].name, "Alpha");
        assert_eq!(feeds[0].owner_name, "bob");
        assert_eq!(feeds[1].name, "Zeta");
        assert_eq!(feeds[1].owner_name, "alice");
    }

    #[tokio::test]
    async fn test_claim_next_feed_empty_is_not_found() {
        let (db, _) = test_db().await;
        let err = db.claim_next_feed(1_700_000_000).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_claim_marks_feed_fetched() {
        let (db, user_id) = test_db().await;
        let feed = db
            .create_feed("Example", "https://example.com/rss", user_id)
            .await
            .unwrap();

        let claimed = db.claim_next_feed(1_700_000_000).await.unwrap();
        assert_eq!(claimed.id, feed.id);
        assert_eq!(claimed.last_fetched_at_ms, Some(1_700_000_000));

        let stored = db.get_feed(feed.id).await.unwrap().unwrap();
        assert_eq!(stored.last_fetched_at_ms, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn test_claim_order_oldest_first_never_fetched_before_all() {
        let (db, user_id) = test_db().await;
        let a = db
            .create_feed("A", "https://a.example.com/rss", user_id)
            .await
            .unwrap();
        let b = db
            .create_feed("B", "https://b.example.com/rss", user_id)
            .await
            .unwrap();
        let c = db
            .create_feed("C", "https://c.example.com/rss", user_id)
            .await
            .unwrap();
        let d = db
            .create_feed("D", "https://d.example.com/rss", user_id)
            .await
            .unwrap();

        // b is oldest, then d, then a; c has never been fetched
        db.mark_feed_fetched(a.id, 1_000_300).await.unwrap();
        db.mark_feed_fetched(b.id, 1_000_100).await.unwrap();
        db.mark_feed_fetched(d.id, 1_000_200).await.unwrap();

        let mut now = 2_000_000;
        let mut order = Vec::new();
        for _ in 0..4 {
            now += 1;
            order.push(db.claim_next_feed(now).await.unwrap().id);
        }

        assert_eq!(order, vec![c.id, b.id, d.id, a.id]);
    }

    #[tokio::test]
    async fn test_claim_rotates_through_all_feeds() {
        let (db, user_id) = test_db().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            let feed = db
                .create_feed(
                    &format!("Feed {i}"),
                    &format!("https://f{i}.example.com/rss"),
                    user_id,
                )
                .await
                .unwrap();
            ids.push(feed.id);
        }

        // Two full rounds: each feed claimed exactly once per round
        let mut now = 1_700_000_000;
        for _ in 0..2 {
            let mut round = Vec::new();
            for _ in 0..ids.len() {
                now += 1;
                round.push(db.claim_next_feed(now).await.unwrap().id);
            }
            assert_eq!(round, ids);
        }
    }

    #[tokio::test]
    async fn test_claims_in_same_millisecond_still_rotate() {
        let (db, user_id) = test_db().await;
        let mut ids = Vec::new();
        for i in 0..3 {
            let feed = db
                .create_feed(
                    &format!("Feed {i}"),
                    &format!("https://f{i}.example.com/rss"),
                    user_id,
                )
                .await
                .unwrap();
            ids.push(feed.id);
        }

        let mut claimed = Vec::new();
        let mut stamps = Vec::new();
        for _ in 0..6 {
            let feed = db.claim_next_feed(1_700_000_000_000).await.unwrap();
            claimed.push(feed.id);
            stamps.push(feed.last_fetched_at_ms.unwrap());
        }

        assert_eq!(claimed, [ids.clone(), ids].concat());
        assert!(stamps.windows(2).all(|w| w[0] < w[1]), "{stamps:?}");
    }

    #[tokio::test]
    async fn test_claim_after_explicit_mark_sorts_last() {
        let (db, user_id) = test_db().await;
        let a = db
            .create_feed("A", "https://a.example.com/rss", user_id)
            .await
            .unwrap();
        let b = db
            .create_feed("B", "https://b.example.com/rss", user_id)
            .await
            .unwrap();

        // A one-shot fetch of b lands in the same millisecond as the claim of a
        db.mark_feed_fetched(b.id, 5_000).await.unwrap();
        let first = db.claim_next_feed(5_000).await.unwrap();
        assert_eq!(first.id, a.id);
        assert_eq!(first.last_fetched_at_ms, Some(5_001));

        let second = db.claim_next_feed(5_000).await.unwrap();
        assert_eq!(second.id, b.id);
    }

    #[tokio::test]
    async fn test_mark_feed_fetched_missing_feed() {
        let (db, _) = test_db().await;
        let err = db.mark_feed_fetched(42, 1_700_000_000).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound(_)), "got {err:?}");
    }
}
