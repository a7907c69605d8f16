//! Reddit wire-format parsing.
//!
//! Everything the workers consume is parsed here from raw listing JSON.
//! There are no lazy proxies: a listing page is one HTTP call, a
//! "morechildren" expansion is one HTTP call, and nothing fetches behind
//! the caller's back.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use redharvest_core::common::error::{HarvestError, Result};
use redharvest_core::domain::{Post, SortOrder, SubredditMetadata, SubredditRule};
use serde_json::Value;

/// One comment as returned by Reddit, flattened out of the tree with its
/// nesting depth. Conversion to the stored [`redharvest_core::Comment`]
/// happens in the comments worker.
#[derive(Debug, Clone)]
pub struct FetchedComment {
    pub id: String,
    /// None for top-level comments, otherwise the parent comment id.
    pub parent_id: Option<String>,
    pub depth: u32,
    pub author: String,
    pub body: String,
    pub score: i64,
    pub created_utc: f64,
    pub is_submitter: bool,
    pub stickied: bool,
    pub distinguished: Option<String>,
    pub edited: bool,
    pub controversiality: i64,
    pub gilded: i64,
}

/// A collapsed "load more comments" stub.
#[derive(Debug, Clone)]
pub struct MoreStub {
    pub parent_id: Option<String>,
    pub depth: u32,
    pub children: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchedTree {
    pub comments: Vec<FetchedComment>,
    pub more_stubs: Vec<MoreStub>,
}

impl FetchedTree {
    pub fn depth_index(&self) -> HashMap<String, u32> {
        self.comments
            .iter()
            .map(|c| (c.id.clone(), c.depth))
            .collect()
    }
}

fn str_field(data: &Value, key: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn opt_str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn i64_field(data: &Value, key: &str) -> i64 {
    data.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn u64_field(data: &Value, key: &str) -> u64 {
    data.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn f64_field(data: &Value, key: &str) -> f64 {
    data.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

fn bool_field(data: &Value, key: &str) -> bool {
    data.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// `edited` is `false` or an edit timestamp.
fn edited_field(data: &Value) -> bool {
    match data.get("edited") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(_)) => true,
        _ => false,
    }
}

fn author_field(data: &Value) -> String {
    data.get("author")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or("[deleted]")
        .to_string()
}

fn timestamp(created_utc: f64) -> DateTime<Utc> {
    DateTime::from_timestamp(created_utc as i64, 0).unwrap_or_else(Utc::now)
}

/// Parse one listing page of submissions. Returns the posts plus the
/// continuation cursor.
pub fn parse_post_listing(
    value: &Value,
    subreddit: &str,
    sort: SortOrder,
) -> Result<(Vec<Post>, Option<String>)> {
    let data = value
        .get("data")
        .ok_or_else(|| HarvestError::Api {
            status: 200,
            message: "listing response without data".into(),
        })?;
    let after = data
        .get("after")
        .and_then(Value::as_str)
        .map(String::from);
    let children = data
        .get("children")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let now = Utc::now();
    let posts = children
        .iter()
        .filter(|thing| thing.get("kind").and_then(Value::as_str) == Some("t3"))
        .filter_map(|thing| thing.get("data"))
        .filter_map(|d| {
            let post_id = opt_str_field(d, "id")?;
            let created_utc = f64_field(d, "created_utc");
            Some(Post {
                post_id,
                subreddit: subreddit.to_string(),
                title: str_field(d, "title"),
                url: str_field(d, "url"),
                permalink: str_field(d, "permalink"),
                author: author_field(d),
                selftext: str_field(d, "selftext"),
                score: i64_field(d, "score"),
                upvote_ratio: f64_field(d, "upvote_ratio"),
                num_comments: u64_field(d, "num_comments"),
                is_self: bool_field(d, "is_self"),
                over_18: bool_field(d, "over_18"),
                spoiler: bool_field(d, "spoiler"),
                stickied: bool_field(d, "stickied"),
                locked: bool_field(d, "locked"),
                distinguished: opt_str_field(d, "distinguished"),
                created_utc,
                created_at: timestamp(created_utc),
                sort_method: sort.as_str().to_string(),
                scraped_at: now,
                comments_scraped: false,
                initial_comments_scraped: false,
                last_comment_fetch_time: None,
                comments_scraped_at: None,
            })
        })
        .collect();

    Ok((posts, after))
}

/// Parse the two-element response of the comments endpoint. Only levels
/// `0..=max_depth` are retained; replies below the cap are neither kept
/// nor descended into.
pub fn parse_comment_response(value: &Value, max_depth: u32) -> Result<FetchedTree> {
    let listings = value.as_array().ok_or_else(|| HarvestError::Api {
        status: 200,
        message: "comments response is not a listing pair".into(),
    })?;
    let comment_listing = listings.get(1).ok_or_else(|| HarvestError::Api {
        status: 200,
        message: "comments response missing comment listing".into(),
    })?;

    let mut tree = FetchedTree::default();
    let children = comment_listing
        .pointer("/data/children")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    walk_comment_children(&children, 0, None, max_depth, &mut tree);
    Ok(tree)
}

fn walk_comment_children(
    children: &[Value],
    depth: u32,
    parent_id: Option<&str>,
    max_depth: u32,
    out: &mut FetchedTree,
) {
    if depth > max_depth {
        return;
    }
    for thing in children {
        let kind = thing.get("kind").and_then(Value::as_str).unwrap_or("");
        let Some(data) = thing.get("data") else {
            continue;
        };
        match kind {
            "t1" => {
                let Some(id) = opt_str_field(data, "id") else {
                    continue;
                };
                out.comments.push(FetchedComment {
                    id: id.clone(),
                    parent_id: parent_id.map(String::from),
                    depth,
                    author: author_field(data),
                    body: str_field(data, "body"),
                    score: i64_field(data, "score"),
                    created_utc: f64_field(data, "created_utc"),
                    is_submitter: bool_field(data, "is_submitter"),
                    stickied: bool_field(data, "stickied"),
                    distinguished: opt_str_field(data, "distinguished"),
                    edited: edited_field(data),
                    controversiality: i64_field(data, "controversiality"),
                    gilded: i64_field(data, "gilded"),
                });
                if depth < max_depth {
                    if let Some(replies) = data
                        .get("replies")
                        .filter(|r| r.is_object())
                        .and_then(|r| r.pointer("/data/children"))
                        .and_then(Value::as_array)
                    {
                        walk_comment_children(replies, depth + 1, Some(&id), max_depth, out);
                    }
                }
            }
            "more" => {
                let ids: Vec<String> = data
                    .get("children")
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(Value::as_str)
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default();
                if !ids.is_empty() {
                    out.more_stubs.push(MoreStub {
                        parent_id: parent_id.map(String::from),
                        depth,
                        children: ids,
                    });
                }
            }
            _ => {}
        }
    }
}

/// Parse the `things` of a morechildren expansion. The response is flat;
/// depth is recovered from the already-fetched tree via `depth_by_id`.
pub fn parse_more_children(
    value: &Value,
    depth_by_id: &HashMap<String, u32>,
    max_depth: u32,
) -> Vec<FetchedComment> {
    let things = value
        .pointer("/json/data/things")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut out = Vec::new();
    let mut local_depths = depth_by_id.clone();
    for thing in &things {
        if thing.get("kind").and_then(Value::as_str) != Some("t1") {
            continue;
        }
        let Some(data) = thing.get("data") else {
            continue;
        };
        let Some(id) = opt_str_field(data, "id") else {
            continue;
        };
        let raw_parent = str_field(data, "parent_id");
        let (parent_id, depth) = match raw_parent.strip_prefix("t1_") {
            Some(parent) => {
                let parent_depth = local_depths.get(parent).copied();
                match parent_depth {
                    Some(pd) => (Some(parent.to_string()), pd + 1),
                    // Parent beyond the cap or unknown: drop the orphan.
                    None => continue,
                }
            }
            None => (None, 0),
        };
        if depth > max_depth {
            continue;
        }
        local_depths.insert(id.clone(), depth);
        out.push(FetchedComment {
            id: id.clone(),
            parent_id,
            depth,
            author: author_field(data),
            body: str_field(data, "body"),
            score: i64_field(data, "score"),
            created_utc: f64_field(data, "created_utc"),
            is_submitter: bool_field(data, "is_submitter"),
            stickied: bool_field(data, "stickied"),
            distinguished: opt_str_field(data, "distinguished"),
            edited: edited_field(data),
            controversiality: i64_field(data, "controversiality"),
            gilded: i64_field(data, "gilded"),
        });
    }
    out
}

/// Build community metadata from the `about`, `about/rules` and sample-post
/// responses.
pub fn parse_subreddit_about(
    about: &Value,
    rules: Option<&Value>,
    sample_titles: Vec<String>,
    name: &str,
) -> Result<SubredditMetadata> {
    let d = about.pointer("/data").ok_or_else(|| HarvestError::Api {
        status: 200,
        message: "about response without data".into(),
    })?;

    let parsed_rules: Vec<SubredditRule> = rules
        .and_then(|r| r.get("rules"))
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .map(|rule| SubredditRule {
                    short_name: str_field(rule, "short_name"),
                    description: str_field(rule, "description"),
                    kind: str_field(rule, "kind"),
                })
                .collect()
        })
        .unwrap_or_default();
    let rules_text = parsed_rules
        .iter()
        .map(|r| format!("{}: {}", r.short_name, r.description))
        .collect::<Vec<_>>()
        .join(" | ");

    let now = Utc::now();
    Ok(SubredditMetadata {
        subreddit_name: name.to_string(),
        title: str_field(d, "title"),
        public_description: str_field(d, "public_description"),
        description: str_field(d, "description"),
        subscribers: u64_field(d, "subscribers"),
        active_user_count: d.get("active_user_count").and_then(Value::as_u64),
        over_18: bool_field(d, "over18"),
        lang: str_field(d, "lang"),
        created_utc: f64_field(d, "created_utc"),
        subreddit_type: str_field(d, "subreddit_type"),
        advertiser_category: opt_str_field(d, "advertiser_category"),
        icon_img: opt_str_field(d, "icon_img"),
        banner_img: opt_str_field(d, "banner_img"),
        rules: parsed_rules,
        rules_text,
        sample_post_titles: sample_titles.join(" | "),
        embedding_status: redharvest_core::domain::EmbeddingStatus::Pending,
        scraped_at: now,
        last_updated: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_post_listing_with_cursor() {
        let value = json!({
            "kind": "Listing",
            "data": {
                "after": "t3_abc",
                "children": [
                    {"kind": "t3", "data": {
                        "id": "p1", "title": "hello", "url": "https://example.com",
                        "permalink": "/r/rust/comments/p1/hello/",
                        "author": "alice", "score": 42, "num_comments": 7,
                        "created_utc": 1700000000.0, "upvote_ratio": 0.97,
                        "is_self": false, "selftext": ""
                    }},
                    {"kind": "t3", "data": {
                        "id": "p2", "title": "deleted author", "author": null,
                        "created_utc": 1700000100.0
                    }}
                ]
            }
        });
        let (posts, after) = parse_post_listing(&value, "rust", SortOrder::New).unwrap();
        assert_eq!(after.as_deref(), Some("t3_abc"));
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].post_id, "p1");
        assert_eq!(posts[0].num_comments, 7);
        assert!(!posts[0].comments_scraped);
        assert_eq!(posts[1].author, "[deleted]");
        assert_eq!(posts[1].sort_method, "new");
    }

    fn comment(id: &str, replies: Value) -> Value {
        json!({"kind": "t1", "data": {
            "id": id, "author": "bob", "body": format!("body {id}"),
            "score": 1, "created_utc": 1700000000.0, "edited": false,
            "replies": replies
        }})
    }

    #[test]
    fn parses_nested_comment_tree_with_depths() {
        let leaf = comment("c3", json!(""));
        let mid = comment(
            "c2",
            json!({"kind": "Listing", "data": {"children": [leaf]}}),
        );
        let top = comment(
            "c1",
            json!({"kind": "Listing", "data": {"children": [mid]}}),
        );
        let response = json!([
            {"kind": "Listing", "data": {"children": []}},
            {"kind": "Listing", "data": {"children": [top]}}
        ]);

        let tree = parse_comment_response(&response, 3).unwrap();
        assert_eq!(tree.comments.len(), 3);
        let depths: Vec<(String, u32, Option<String>)> = tree
            .comments
            .iter()
            .map(|c| (c.id.clone(), c.depth, c.parent_id.clone()))
            .collect();
        assert_eq!(depths[0], ("c1".into(), 0, None));
        assert_eq!(depths[1], ("c2".into(), 1, Some("c1".into())));
        assert_eq!(depths[2], ("c3".into(), 2, Some("c2".into())));
    }

    #[test]
    fn depth_cap_drops_deep_replies() {
        // c1 -> c2 -> c3 with a cap of 1 keeps only two levels.
        let leaf = comment("c3", json!(""));
        let mid = comment(
            "c2",
            json!({"kind": "Listing", "data": {"children": [leaf]}}),
        );
        let top = comment(
            "c1",
            json!({"kind": "Listing", "data": {"children": [mid]}}),
        );
        let response = json!([
            {"kind": "Listing", "data": {"children": []}},
            {"kind": "Listing", "data": {"children": [top]}}
        ]);

        let tree = parse_comment_response(&response, 1).unwrap();
        let ids: Vec<&str> = tree.comments.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[test]
    fn collects_more_stubs_without_expanding() {
        let response = json!([
            {"kind": "Listing", "data": {"children": []}},
            {"kind": "Listing", "data": {"children": [
                comment("c1", json!("")),
                {"kind": "more", "data": {"children": ["x1", "x2", "x3"]}}
            ]}}
        ]);
        let tree = parse_comment_response(&response, 3).unwrap();
        assert_eq!(tree.comments.len(), 1);
        assert_eq!(tree.more_stubs.len(), 1);
        assert_eq!(tree.more_stubs[0].children.len(), 3);
    }

    #[test]
    fn edited_timestamp_counts_as_edited() {
        let response = json!([
            {"kind": "Listing", "data": {"children": []}},
            {"kind": "Listing", "data": {"children": [
                {"kind": "t1", "data": {"id": "c1", "body": "x", "edited": 1700000500.0}}
            ]}}
        ]);
        let tree = parse_comment_response(&response, 3).unwrap();
        assert!(tree.comments[0].edited);
    }

    #[test]
    fn more_children_depths_follow_parents() {
        let mut known = HashMap::new();
        known.insert("c1".to_string(), 0u32);
        let response = json!({"json": {"data": {"things": [
            {"kind": "t1", "data": {"id": "m1", "parent_id": "t1_c1", "body": "a"}},
            {"kind": "t1", "data": {"id": "m2", "parent_id": "t1_m1", "body": "b"}},
            {"kind": "t1", "data": {"id": "m3", "parent_id": "t3_post", "body": "c"}}
        ]}}});
        let fetched = parse_more_children(&response, &known, 3);
        assert_eq!(fetched.len(), 3);
        assert_eq!(fetched[0].depth, 1);
        assert_eq!(fetched[1].depth, 2);
        assert_eq!(fetched[2].depth, 0);
        assert_eq!(fetched[2].parent_id, None);
    }

    #[test]
    fn subreddit_about_builds_rules_text() {
        let about = json!({"data": {
            "title": "Rust", "public_description": "systems language",
            "description": "long text", "subscribers": 300000,
            "over18": false, "lang": "en", "created_utc": 1201243765.0,
            "subreddit_type": "public"
        }});
        let rules = json!({"rules": [
            {"short_name": "Be kind", "description": "No abuse", "kind": "all"}
        ]});
        let meta = parse_subreddit_about(
            &about,
            Some(&rules),
            vec!["post one".into(), "post two".into()],
            "rust",
        )
        .unwrap();
        assert_eq!(meta.subscribers, 300000);
        assert_eq!(meta.rules.len(), 1);
        assert_eq!(meta.rules_text, "Be kind: No abuse");
        assert_eq!(meta.sample_post_titles, "post one | post two");
    }
}
