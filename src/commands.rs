//! Handlers for the `gator` subcommands.
//!
//! Each handler writes its user-facing output to `out` and returns
//! `anyhow::Result`; `main` only parses arguments and dispatches.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{TimeZone, Utc};
use std::io::Write;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::feed::{FeedFetcher, Ingestor};
use crate::scheduler::run_polling_loop;
use crate::storage::{Database, DatabaseError, Feed, Post, User};
use crate::util::validate_feed_url;

/// Everything a command needs: the open database and the loaded config,
/// plus where to write the config back.
pub struct Session {
    pub db: Database,
    pub config: Config,
    pub config_path: PathBuf,
}

impl Session {
    pub fn new(db: Database, config: Config, config_path: PathBuf) -> Self {
        Self {
            db,
            config,
            config_path,
        }
    }

    /// The logged-in user, or an error telling the caller how to log in.
    pub async fn require_user(&self) -> Result<User> {
        let name = self.config.current_user_name.as_deref().ok_or_else(|| {
            anyhow!(
                "No user is logged in. Run `gator register <name>` or `gator login <name>` first."
            )
        })?;

        self.db
            .get_user_by_name(name)
            .await
            .context("Failed to look up current user")?
            .ok_or_else(|| {
                anyhow!(
                    "Current user '{name}' does not exist. \
                     Run `gator register <name>` or `gator login <name>`."
                )
            })
    }

    fn set_current_user(&mut self, name: &str) -> Result<()> {
        self.config.current_user_name = Some(name.to_string());
        self.config.save(&self.config_path).with_context(|| {
            format!("Failed to save config to {}", self.config_path.display())
        })
    }

    async fn feed_by_url(&self, url: &str) -> Result<Feed> {
        // Stored URLs are normalized by `addfeed`; match that form when possible
        let normalized = validate_feed_url(url)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| url.trim().to_string());

        self.db
            .get_feed_by_url(&normalized)
            .await
            .context("Failed to look up feed")?
            .ok_or_else(|| {
                anyhow!("No feed with URL '{url}'. Add it with `gator addfeed <name> <url>`.")
            })
    }
}

// ============================================================================
// Users
// ============================================================================

pub async fn register(session: &mut Session, name: &str, out: &mut impl Write) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        bail!("User name must not be empty");
    }

    let user = match session.db.create_user(name).await {
        Ok(user) => user,
        Err(DatabaseError::AlreadyExists(_)) => bail!("User '{name}' already exists"),
        Err(e) => return Err(e).context("Failed to create user"),
    };
    session.set_current_user(&user.name)?;

    tracing::debug!(user_id = user.id, "Registered user");
    writeln!(out, "User created: {}", user.name)?;
    Ok(())
}

pub async fn login(session: &mut Session, name: &str, out: &mut impl Write) -> Result<()> {
    let name = name.trim();
    let user = session
        .db
        .get_user_by_name(name)
        .await
        .context("Failed to look up user")?
        .ok_or_else(|| anyhow!("User '{name}' does not exist"))?;
    session.set_current_user(&user.name)?;

    writeln!(out, "Logged in as {}", user.name)?;
    Ok(())
}

/// Delete every user and, through cascades, every feed, follow and post.
pub async fn reset(session: &mut Session, out: &mut impl Write) -> Result<()> {
    let deleted = session
        .db
        .delete_all_users()
        .await
        .context("Failed to reset database")?;

    writeln!(out, "Database reset: deleted {deleted} users")?;
    Ok(())
}

pub async fn users(session: &Session, out: &mut impl Write) -> Result<()> {
    let users = session.db.list_users().await.context("Failed to list users")?;
    let current = session.config.current_user_name.as_deref();

    for user in users {
        if Some(user.name.as_str()) == current {
            writeln!(out, "* {} (current)", user.name)?;
        } else {
            writeln!(out, "* {}", user.name)?;
        }
    }
    Ok(())
}

// ============================================================================
// Feeds
// ============================================================================

/// Add a feed owned by the current user and follow it.
pub async fn add_feed(
    session: &Session,
    name: &str,
    url: &str,
    out: &mut impl Write,
) -> Result<()> {
    let user = session.require_user().await?;
    let name = name.trim();
    if name.is_empty() {
        bail!("Feed name must not be empty");
    }
    let url = validate_feed_url(url).with_context(|| format!("Rejected feed URL '{url}'"))?;

    let feed = match session.db.create_feed(name, url.as_str(), user.id).await {
        Ok(feed) => feed,
        Err(DatabaseError::AlreadyExists(_)) => {
            bail!("A feed with URL '{url}' already exists. Use `gator follow {url}` instead.")
        }
        Err(e) => return Err(e).context("Failed to create feed"),
    };
    session
        .db
        .create_feed_follow(user.id, feed.id)
        .await
        .context("Failed to follow new feed")?;

    writeln!(out, "Feed added:")?;
    writeln!(out, " * ID:   {}", feed.id)?;
    writeln!(out, " * Name: {}", feed.name)?;
    writeln!(out, " * URL:  {}", feed.url)?;
    writeln!(out, "{} now follows {}", user.name, feed.name)?;
    Ok(())
}

pub async fn feeds(session: &Session, out: &mut impl Write) -> Result<()> {
    let feeds = session
        .db
        .list_feeds_with_owner()
        .await
        .context("Failed to list feeds")?;

    if feeds.is_empty() {
        writeln!(out, "No feeds found.")?;
        return Ok(());
    }
    for feed in feeds {
        writeln!(out, "* {}", feed.name)?;
        writeln!(out, "  {}", feed.url)?;
        writeln!(out, "  added by {}", feed.owner_name)?;
    }
    Ok(())
}

/// Fetch one feed right now, outside the poll loop.
///
/// The feed is marked fetched before the request, the same as a scheduled
/// claim, so it moves to the back of the rotation either way.
pub async fn fetch(session: &Session, url: &str, out: &mut impl Write) -> Result<()> {
    session.require_user().await?;
    let feed = session.feed_by_url(url).await?;

    let fetcher = FeedFetcher::new(&session.config.fetch)?;
    let summary = Ingestor::new(session.db.clone(), fetcher)
        .refresh(&feed, Utc::now().timestamp_millis(), &CancellationToken::new())
        .await
        .with_context(|| format!("Failed to fetch {}", feed.url))?;

    writeln!(
        out,
        "{}: {} new, {} already seen, {} skipped, {} failed",
        feed.name, summary.created, summary.duplicates, summary.skipped, summary.failed
    )?;
    Ok(())
}

/// Run the poll loop until `cancel` fires.
pub async fn agg(
    session: &Session,
    interval: &str,
    cancel: CancellationToken,
    out: &mut impl Write,
) -> Result<()> {
    let fetcher = FeedFetcher::new(&session.config.fetch)?;
    writeln!(out, "Collecting feeds every {interval}")?;
    out.flush()?;

    run_polling_loop(session.db.clone(), fetcher, interval, cancel).await?;
    Ok(())
}

// ============================================================================
// Follows
// ============================================================================

pub async fn follow(session: &Session, url: &str, out: &mut impl Write) -> Result<()> {
    let user = session.require_user().await?;
    let feed = session.feed_by_url(url).await?;

    let follow = match session.db.create_feed_follow(user.id, feed.id).await {
        Ok(follow) => follow,
        Err(DatabaseError::AlreadyExists(_)) => {
            bail!("{} already follows {}", user.name, feed.name)
        }
        Err(e) => return Err(e).context("Failed to follow feed"),
    };

    writeln!(out, "{} now follows {}", follow.user_name, follow.feed_name)?;
    Ok(())
}

pub async fn following(session: &Session, out: &mut impl Write) -> Result<()> {
    let user = session.require_user().await?;
    let follows = session
        .db
        .feed_follows_for_user(user.id)
        .await
        .context("Failed to list follows")?;

    if follows.is_empty() {
        writeln!(out, "{} is not following any feeds.", user.name)?;
        return Ok(());
    }
    for follow in follows {
        writeln!(out, "* {}", follow.feed_name)?;
    }
    Ok(())
}

pub async fn unfollow(session: &Session, url: &str, out: &mut impl Write) -> Result<()> {
    let user = session.require_user().await?;
    let feed = session.feed_by_url(url).await?;

    let removed = session
        .db
        .delete_feed_follow(user.id, feed.id)
        .await
        .context("Failed to unfollow feed")?;
    if !removed {
        bail!("{} does not follow {}", user.name, feed.name);
    }

    writeln!(out, "{} unfollowed {}", user.name, feed.name)?;
    Ok(())
}

// ============================================================================
// Posts
// ============================================================================

/// Print the newest posts from the current user's followed feeds.
pub async fn browse(session: &Session, limit: i64, out: &mut impl Write) -> Result<()> {
    let user = session.require_user().await?;
    let posts = session
        .db
        .posts_for_user(user.id, limit)
        .await
        .context("Failed to load posts")?;

    if posts.is_empty() {
        writeln!(out, "No posts yet. Follow some feeds and run `gator agg`.")?;
        return Ok(());
    }
    for post in &posts {
        write_post(out, post)?;
    }
    Ok(())
}

fn write_post(out: &mut impl Write, post: &Post) -> std::io::Result<()> {
    let date = post
        .published_at
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .map(|dt| dt.format("%a %b %e %Y %H:%M UTC").to_string())
        .unwrap_or_else(|| "unknown date".to_string());

    writeln!(out, "{date} | {}", post.title)?;
    writeln!(out, "  {}", post.url)?;
    let description = post.description.trim();
    if !description.is_empty() {
        writeln!(out, "  {description}")?;
    }
    writeln!(out, "=====================================")
}
