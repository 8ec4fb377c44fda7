use tokio_util::sync::CancellationToken;

use super::fetcher::{FeedFetcher, FetchError};
use super::normalize::{normalize, NormalizedItem};
use crate::storage::{DatabaseError, Feed, FeedStore, InsertOutcome, NewPost};

/// Per-item outcome counts for one ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// New posts written.
    pub created: usize,
    /// Items whose link was already stored for this feed.
    pub duplicates: usize,
    /// Items dropped before storage because they have no link.
    pub skipped: usize,
    /// Items the store rejected for any reason other than a duplicate.
    pub failed: usize,
}

/// Why a one-shot [`Ingestor::refresh`] failed.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("Failed to mark feed fetched: {0}")]
    Mark(#[source] DatabaseError),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl IngestSummary {
    pub fn total(&self) -> usize {
        self.created + self.duplicates + self.skipped + self.failed
    }
}

/// Fetches one feed and stores the items it has not seen before.
pub struct Ingestor<S> {
    store: S,
    fetcher: FeedFetcher,
}

impl<S: FeedStore> Ingestor<S> {
    pub fn new(store: S, fetcher: FeedFetcher) -> Self {
        Self { store, fetcher }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Fetch `feed`, normalize it, and insert every item not yet stored.
    ///
    /// Only a failed fetch is an error. Duplicate items are skipped silently
    /// and any other per-item storage failure is logged and counted, so one
    /// bad item never stops the rest. The feed's `last_fetched_at_ms` is not
    /// touched here; the scheduler claims the feed first and [`Self::refresh`]
    /// marks it.
    pub async fn ingest(
        &self,
        feed: &Feed,
        cancel: &CancellationToken,
    ) -> Result<IngestSummary, FetchError> {
        let raw = self.fetcher.fetch(&feed.url, cancel).await?;
        let doc = normalize(raw);

        let mut summary = IngestSummary::default();
        for item in &doc.items {
            self.persist_item(feed, item, &mut summary).await;
        }

        tracing::info!(
            feed_id = feed.id,
            feed = %feed.name,
            items = summary.total(),
            created = summary.created,
            duplicates = summary.duplicates,
            skipped = summary.skipped,
            failed = summary.failed,
            "Ingested feed"
        );
        Ok(summary)
    }

    /// Mark `feed` fetched at `fetched_at_ms`, then ingest it.
    ///
    /// This is the manual counterpart of a scheduler claim: the feed moves to
    /// the back of the rotation even when the fetch itself fails.
    pub async fn refresh(
        &self,
        feed: &Feed,
        fetched_at_ms: i64,
        cancel: &CancellationToken,
    ) -> Result<IngestSummary, RefreshError> {
        self.store
            .mark_feed_fetched(feed.id, fetched_at_ms)
            .await
            .map_err(RefreshError::Mark)?;

        Ok(self.ingest(feed, cancel).await?)
    }

    async fn persist_item(
        &self,
        feed: &Feed,
        item: &NormalizedItem,
        summary: &mut IngestSummary,
    ) {
        let link = item.link.trim();
        if link.is_empty() {
            tracing::warn!(
                feed_id = feed.id,
                title = %item.title,
                "Skipping item without a link"
            );
            summary.skipped += 1;
            return;
        }

        let post = NewPost {
            feed_id: feed.id,
            url: link,
            title: &item.title,
            description: &item.description,
            published_at: item.published_at.map(|dt| dt.timestamp()),
        };

        match self.store.insert_post_if_absent(&post).await {
            Ok(InsertOutcome::Created(_)) => summary.created += 1,
            Ok(InsertOutcome::Conflict) => {
                tracing::debug!(feed_id = feed.id, url = %link, "Post already stored");
                summary.duplicates += 1;
            }
            Err(e) => {
                tracing::warn!(
                    feed_id = feed.id,
                    url = %link,
                    error = %e,
                    "Failed to store post"
                );
                summary.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchConfig;
    use crate::storage::Database;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const THREE_ITEMS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Boot.dev Blog</title>
  <link>https://blog.boot.dev/</link>
  <item>
    <title>One &amp;amp; Only</title>
    <link>https://blog.boot.dev/1</link>
    <pubDate>Mon, 02 Jan 2006 15:04:05 -0700</pubDate>
  </item>
  <item>
    <title>Two</title>
    <link>https://blog.boot.dev/2</link>
    <pubDate>Tue, 03 Jan 2006 15:04:05 MST</pubDate>
  </item>
  <item>
    <title>Three</title>
    <link>https://blog.boot.dev/3</link>
  </item>
</channel></rss>"#;

    async fn serve(body: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rss.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;
        server
    }

    async fn setup(url: &str) -> (Database, Feed) {
        let db = Database::open(":memory:").await.unwrap();
        let user = db.create_user("kahya").await.unwrap();
        let feed = db.create_feed("Boot.dev", url, user.id).await.unwrap();
        (db, feed)
    }

    fn fetcher() -> FeedFetcher {
        FeedFetcher::new(&FetchConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_ingest_stores_all_items() {
        let server = serve(THREE_ITEMS).await;
        let (db, feed) = setup(&format!("{}/rss.xml", server.uri())).await;
        let ingestor = Ingestor::new(db.clone(), fetcher());

        let summary = ingestor.ingest(&feed, &CancellationToken::new()).await.unwrap();

        assert_eq!(
            summary,
            IngestSummary {
                created: 3,
                ..Default::default()
            }
        );
        let posts = db.posts_for_feed(feed.id).await.unwrap();
        assert_eq!(posts.len(), 3);
    }

    #[tokio::test]
    async fn test_ingest_twice_is_idempotent() {
        let server = serve(THREE_ITEMS).await;
        let (db, feed) = setup(&format!("{}/rss.xml", server.uri())).await;
        let ingestor = Ingestor::new(db.clone(), fetcher());
        let cancel = CancellationToken::new();

        ingestor.ingest(&feed, &cancel).await.unwrap();
        let first = db.posts_for_feed(feed.id).await.unwrap();

        let summary = ingestor.ingest(&feed, &cancel).await.unwrap();
        let second = db.posts_for_feed(feed.id).await.unwrap();

        assert_eq!(summary.created, 0);
        assert_eq!(summary.duplicates, 3);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_existing_link_yields_two_new_posts() {
        let server = serve(THREE_ITEMS).await;
        let (db, feed) = setup(&format!("{}/rss.xml", server.uri())).await;
        db.insert_post_if_absent(&NewPost {
            feed_id: feed.id,
            url: "https://blog.boot.dev/2",
            title: "Two (earlier copy)",
            description: "",
            published_at: None,
        })
        .await
        .unwrap();

        let summary = Ingestor::new(db.clone(), fetcher())
            .ingest(&feed, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.created, 2);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(db.posts_for_feed(feed.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_titles_are_unescaped_before_storage() {
        let server = serve(THREE_ITEMS).await;
        let (db, feed) = setup(&format!("{}/rss.xml", server.uri())).await;

        Ingestor::new(db.clone(), fetcher())
            .ingest(&feed, &CancellationToken::new())
            .await
            .unwrap();

        let posts = db.posts_for_feed(feed.id).await.unwrap();
        let first = posts
            .iter()
            .find(|p| p.url == "https://blog.boot.dev/1")
            .unwrap();
        assert_eq!(first.title, "One & Only");
        assert_eq!(first.published_at, Some(1_136_239_445));

        let third = posts
            .iter()
            .find(|p| p.url == "https://blog.boot.dev/3")
            .unwrap();
        assert_eq!(third.published_at, None);
    }

    #[tokio::test]
    async fn test_unreachable_feed_is_fetch_error_and_stores_nothing() {
        let (db, feed) = setup("http://127.0.0.1:1/rss.xml").await;

        let err = Ingestor::new(db.clone(), fetcher())
            .ingest(&feed, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Network(_)), "got {err:?}");
        assert!(db.posts_for_feed(feed.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_marks_then_ingests() {
        let server = serve(THREE_ITEMS).await;
        let (db, feed) = setup(&format!("{}/rss.xml", server.uri())).await;

        let summary = Ingestor::new(db.clone(), fetcher())
            .refresh(&feed, 1_700_000_000_123, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.created, 3);
        let stored = db.get_feed(feed.id).await.unwrap().unwrap();
        assert_eq!(stored.last_fetched_at_ms, Some(1_700_000_000_123));
    }

    #[tokio::test]
    async fn test_refresh_unreachable_feed_still_marked() {
        let (db, feed) = setup("http://127.0.0.1:1/rss.xml").await;

        let err = Ingestor::new(db.clone(), fetcher())
            .refresh(&feed, 42_000, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(
            matches!(err, RefreshError::Fetch(FetchError::Network(_))),
            "got {err:?}"
        );
        let stored = db.get_feed(feed.id).await.unwrap().unwrap();
        assert_eq!(stored.last_fetched_at_ms, Some(42_000));
    }

    #[tokio::test]
    async fn test_refresh_missing_feed_never_fetches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(THREE_ITEMS))
            .expect(0)
            .mount(&server)
            .await;
        let (db, mut feed) = setup(&format!("{}/rss.xml", server.uri())).await;
        feed.id += 100;

        let err = Ingestor::new(db, fetcher())
            .refresh(&feed, 42_000, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(
            matches!(err, RefreshError::Mark(DatabaseError::NotFound(_))),
            "got {err:?}"
        );
    }

    /// Store that rejects one specific link with a non-conflict error.
    struct RejectingStore {
        inner: Database,
        reject: &'static str,
    }

    #[async_trait]
    impl FeedStore for RejectingStore {
        async fn claim_next_feed(&self, now_ms: i64) -> Result<Feed, DatabaseError> {
            self.inner.claim_next_feed(now_ms).await
        }

        async fn mark_feed_fetched(&self, feed_id: i64, at_ms: i64) -> Result<(), DatabaseError> {
            self.inner.mark_feed_fetched(feed_id, at_ms).await
        }

        async fn insert_post_if_absent(
            &self,
            post: &NewPost<'_>,
        ) -> Result<InsertOutcome, DatabaseError> {
            if post.url == self.reject {
                return Err(DatabaseError::Other(sqlx::Error::PoolTimedOut));
            }
            self.inner.insert_post_if_absent(post).await
        }
    }

    #[tokio::test]
    async fn test_bad_items_do_not_abort_the_batch() {
        let body = r#"<rss><channel>
            <item>
                <title>Bad date</title><link>https://ex.com/a</link><pubDate>someday</pubDate>
            </item>
            <item><title>No link</title><pubDate>Mon, 02 Jan 2006 15:04:05 +0000</pubDate></item>
            <item><title>Rejected</title><link>https://ex.com/b</link></item>
            <item><title>Fine</title><link>https://ex.com/c</link></item>
        </channel></rss>"#;
        let server = serve(body).await;
        let (db, feed) = setup(&format!("{}/rss.xml", server.uri())).await;
        let store = RejectingStore {
            inner: db.clone(),
            reject: "https://ex.com/b",
        };

        let summary = Ingestor::new(store, fetcher())
            .ingest(&feed, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            summary,
            IngestSummary {
                created: 2,
                duplicates: 0,
                skipped: 1,
                failed: 1,
            }
        );
        let mut urls: Vec<String> = db
            .posts_for_feed(feed.id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.url)
            .collect();
        urls.sort();
        assert_eq!(urls, vec!["https://ex.com/a", "https://ex.com/c"]);
    }
}
