//! Authenticated Reddit API client.
//!
//! Every listing page, tree fetch, stub expansion and token refresh is a
//! deliberate call through the counting transport, gated on the rate-limit
//! oracle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redharvest_core::common::error::{HarvestError, Result};
use redharvest_core::domain::{
    MoreCommentsPolicy, Post, RedditCredentials, SortOrder, SubredditMetadata, TimeFilter,
};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::model::{self, FetchedTree};
use super::rate_limit::RateLimitOracle;
use super::transport::CountingTransport;
use super::RedditApi;

const TOKEN_URL: &str = "https://www.reddit.com/api/v1/access_token";
const OAUTH_BASE: &str = "https://oauth.reddit.com";
const PAGE_SIZE: usize = 100;
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
/// Label under which auth traffic is billed; token refreshes are real
/// requests too.
const AUTH_LABEL: &str = "_auth";

struct Token {
    access_token: String,
    expires_at: Instant,
}

pub struct RedditClient {
    transport: Arc<CountingTransport>,
    oracle: Arc<RateLimitOracle>,
    credentials: RedditCredentials,
    token: tokio::sync::Mutex<Option<Token>>,
}

impl RedditClient {
    pub fn new(
        transport: Arc<CountingTransport>,
        oracle: Arc<RateLimitOracle>,
        credentials: RedditCredentials,
    ) -> Self {
        Self {
            transport,
            oracle,
            credentials,
            token: tokio::sync::Mutex::new(None),
        }
    }

    /// Password-grant token fetch, cached until shortly before expiry.
    async fn bearer(&self) -> Result<String> {
        let mut token = self.token.lock().await;
        if let Some(t) = token.as_ref() {
            if t.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(t.access_token.clone());
            }
        }

        debug!("requesting access token");
        let request = self
            .transport
            .client()
            .post(TOKEN_URL)
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .form(&[
                ("grant_type", "password"),
                ("username", self.credentials.username.as_str()),
                ("password", self.credentials.password.as_str()),
            ]);
        let response = self.transport.execute(request, AUTH_LABEL).await?;
        let body: Value = response.json().await?;

        let access_token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| HarvestError::Auth {
                status: 200,
                message: body
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("token response without access_token")
                    .to_string(),
            })?
            .to_string();
        let expires_in = body.get("expires_in").and_then(Value::as_u64).unwrap_or(3600);

        *token = Some(Token {
            access_token: access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });
        Ok(access_token)
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)], label: &str) -> Result<Value> {
        self.oracle.await_capacity().await;
        let bearer = self.bearer().await?;
        let request = self
            .transport
            .client()
            .get(url)
            .bearer_auth(bearer)
            .query(query);
        let response = self.transport.execute(request, label).await?;
        Ok(response.json::<Value>().await?)
    }

    async fn expand_more_stubs(
        &self,
        subreddit: &str,
        post_id: &str,
        tree: &mut FetchedTree,
        max_depth: u32,
        more: MoreCommentsPolicy,
    ) -> Result<()> {
        let stubs = std::mem::take(&mut tree.more_stubs);
        let budget = match more {
            MoreCommentsPolicy::Skip => {
                if !stubs.is_empty() {
                    debug!(
                        skipped = stubs.len(),
                        post_id, "skipping collapsed comment stubs"
                    );
                    tree.more_stubs = stubs;
                }
                return Ok(());
            }
            MoreCommentsPolicy::Limit(n) => n as usize,
            MoreCommentsPolicy::All => stubs.len(),
        };

        let mut depth_index = tree.depth_index();
        let url = format!("{OAUTH_BASE}/api/morechildren");
        for stub in stubs.iter().take(budget) {
            let children = stub.children.join(",");
            let value = match self
                .get_json(
                    &url,
                    &[
                        ("api_type", "json".to_string()),
                        ("raw_json", "1".to_string()),
                        ("link_id", format!("t3_{post_id}")),
                        ("children", children),
                    ],
                    subreddit,
                )
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    warn!(post_id, "morechildren expansion failed: {e}");
                    continue;
                }
            };
            let fetched = model::parse_more_children(&value, &depth_index, max_depth);
            for c in &fetched {
                depth_index.insert(c.id.clone(), c.depth);
            }
            tree.comments.extend(fetched);
        }
        if stubs.len() > budget {
            debug!(
                skipped = stubs.len() - budget,
                post_id, "stub budget exhausted"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl RedditApi for RedditClient {
    async fn authenticate(&self) -> Result<String> {
        let me = self
            .get_json(&format!("{OAUTH_BASE}/api/v1/me"), &[], AUTH_LABEL)
            .await?;
        let name = me
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(&self.credentials.username)
            .to_string();
        info!(username = %name, "authenticated with Reddit");
        Ok(name)
    }

    async fn fetch_posts(
        &self,
        subreddit: &str,
        sort: SortOrder,
        time_filter: Option<TimeFilter>,
        limit: usize,
    ) -> Result<Vec<Post>> {
        let url = format!("{OAUTH_BASE}/r/{subreddit}/{}", sort.as_str());
        let mut posts: Vec<Post> = Vec::new();
        let mut after: Option<String> = None;

        // Reddit caps pages at 100 items; a 1000-post fetch is 10 calls.
        while posts.len() < limit {
            let page = (limit - posts.len()).min(PAGE_SIZE);
            let mut query: Vec<(&str, String)> = vec![
                ("limit", page.to_string()),
                ("raw_json", "1".to_string()),
            ];
            if let (Some(tf), true) = (time_filter, sort.takes_time_filter()) {
                query.push(("t", tf.as_str().to_string()));
            }
            if let Some(cursor) = &after {
                query.push(("after", cursor.clone()));
            }

            let value = self.get_json(&url, &query, subreddit).await?;
            let (page_posts, next) = model::parse_post_listing(&value, subreddit, sort)?;
            if page_posts.is_empty() {
                break;
            }
            posts.extend(page_posts);
            match next {
                Some(cursor) => after = Some(cursor),
                None => break,
            }
        }

        posts.truncate(limit);
        debug!(
            subreddit,
            sort = sort.as_str(),
            count = posts.len(),
            "fetched listing"
        );
        Ok(posts)
    }

    async fn fetch_comment_tree(
        &self,
        subreddit: &str,
        post_id: &str,
        max_depth: u32,
        more: MoreCommentsPolicy,
    ) -> Result<FetchedTree> {
        let url = format!("{OAUTH_BASE}/r/{subreddit}/comments/{post_id}");
        let value = self
            .get_json(
                &url,
                &[
                    ("raw_json", "1".to_string()),
                    ("limit", "500".to_string()),
                    // Ask one level past the cap so stubs at the boundary
                    // are visible, then trim during parsing.
                    ("depth", (max_depth + 1).to_string()),
                ],
                subreddit,
            )
            .await?;
        let mut tree = model::parse_comment_response(&value, max_depth)?;
        self.expand_more_stubs(subreddit, post_id, &mut tree, max_depth, more)
            .await?;
        Ok(tree)
    }

    async fn fetch_subreddit_about(&self, name: &str) -> Result<SubredditMetadata> {
        let about = self
            .get_json(&format!("{OAUTH_BASE}/r/{name}/about"), &[], name)
            .await?;

        let rules = match self
            .get_json(&format!("{OAUTH_BASE}/r/{name}/about/rules"), &[], name)
            .await
        {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(subreddit = name, "could not fetch rules: {e}");
                None
            }
        };

        let sample_titles = match self
            .fetch_posts(name, SortOrder::Top, Some(TimeFilter::Month), 20)
            .await
        {
            Ok(posts) => posts.into_iter().map(|p| p.title).collect(),
            Err(e) => {
                warn!(subreddit = name, "could not fetch sample posts: {e}");
                Vec::new()
            }
        };

        model::parse_subreddit_about(&about, rules.as_ref(), sample_titles, name)
    }
}
