use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{HeaderMap, AUTHORIZATION, USER_AGENT};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::model::{
    Action, Author, Cursor, Engagement, FeedDescriptor, Flags, Item, ListSummary, StreamScope,
};
use crate::transport::{
    Activity, FetchParams, StreamEvent, StreamHandle, StreamSender, Transport, TransportError,
};

pub const DEFAULT_API_BASE: &str = "https://api.twitter.com/1.1/";
pub const DEFAULT_USER_STREAM_URL: &str = "https://userstream.twitter.com/1.1/user.json";
pub const DEFAULT_FILTER_STREAM_URL: &str = "https://stream.twitter.com/1.1/statuses/filter.json";

const CREATED_AT_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Result<String, TransportError>;
}

/// A bearer token handed over by whatever performed the sign-in.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Result<String, TransportError> {
        if self.0.trim().is_empty() {
            return Err(TransportError::Config("bearer token is empty".into()));
        }
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub api_base: Option<String>,
    pub user_stream_url: Option<String>,
    pub filter_stream_url: Option<String>,
    pub http_client: Option<HttpClient>,
}

#[derive(Debug, Clone, Default)]
pub struct RateLimit {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: Option<SystemTime>,
}

pub struct Client {
    token_provider: Arc<dyn TokenProvider>,
    http: HttpClient,
    stream_http: HttpClient,
    user_agent: String,
    api_base: Url,
    user_stream_url: Url,
    filter_stream_url: Url,
    rate: RwLock<RateLimit>,
}

impl Client {
    pub fn new(
        token_provider: Arc<dyn TokenProvider>,
        config: ClientConfig,
    ) -> Result<Self, TransportError> {
        if config.user_agent.trim().is_empty() {
            return Err(TransportError::Config("user agent required".into()));
        }
        let api_base = parse_url(config.api_base.as_deref().unwrap_or(DEFAULT_API_BASE))?;
        let user_stream_url = parse_url(
            config
                .user_stream_url
                .as_deref()
                .unwrap_or(DEFAULT_USER_STREAM_URL),
        )?;
        let filter_stream_url = parse_url(
            config
                .filter_stream_url
                .as_deref()
                .unwrap_or(DEFAULT_FILTER_STREAM_URL),
        )?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(Duration::from_secs(20))
                .build()?,
        };
        // streams stay open indefinitely; only bound the connect
        let stream_http = HttpClient::builder()
            .connect_timeout(Duration::from_secs(20))
            .timeout(Option::<Duration>::None)
            .build()?;

        Ok(Client {
            token_provider,
            http,
            stream_http,
            user_agent: config.user_agent,
            api_base,
            user_stream_url,
            filter_stream_url,
            rate: RwLock::new(RateLimit::default()),
        })
    }

    pub fn rate_limit(&self) -> RateLimit {
        self.rate.read().clone()
    }

    fn timeline(
        &self,
        feed: &FeedDescriptor,
        since: Option<&Cursor>,
        params: FetchParams,
    ) -> Result<Vec<Item>, TransportError> {
        let mut query = vec![
            ("count".to_string(), params.count.to_string()),
            ("tweet_mode".to_string(), "extended".to_string()),
        ];
        if let Some(cursor) = since {
            query.push(("since_id".into(), cursor.id.clone()));
        }
        let tweets: Vec<Tweet> = match feed {
            FeedDescriptor::Home => self.get_json("statuses/home_timeline.json", &query)?,
            FeedDescriptor::Notifications => {
                self.get_json("statuses/mentions_timeline.json", &query)?
            }
            FeedDescriptor::List { id, .. } => {
                query.push(("list_id".into(), id.clone()));
                self.get_json("lists/statuses.json", &query)?
            }
            FeedDescriptor::Search { query: q } => {
                query.push(("q".into(), q.clone()));
                let envelope: SearchEnvelope = self.get_json("search/tweets.json", &query)?;
                envelope.statuses
            }
        };
        into_items(tweets)
    }

    fn get_json<T>(&self, path: &str, params: &[(String, String)]) -> Result<T, TransportError>
    where
        T: DeserializeOwned,
    {
        let resp = self.request(Method::GET, path, params)?;
        Ok(resp.json()?)
    }

    fn post_json<T>(&self, path: &str, params: &[(String, String)]) -> Result<T, TransportError>
    where
        T: DeserializeOwned,
    {
        let resp = self.request(Method::POST, path, params)?;
        Ok(resp.json()?)
    }

    fn post(&self, path: &str, params: &[(String, String)]) -> Result<(), TransportError> {
        self.request(Method::POST, path, params)?;
        Ok(())
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Response, TransportError> {
        let mut url = self
            .api_base
            .join(path)
            .map_err(|err| TransportError::Config(format!("endpoint {path}: {err}")))?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in params {
                pairs.append_pair(k, v);
            }
        }
        let req = self.authorize(self.http.request(method, url))?;
        let resp = req.send()?;
        self.capture_rate(resp.headers());
        check_status(resp)
    }

    fn authorize(&self, req: RequestBuilder) -> Result<RequestBuilder, TransportError> {
        let token = self.token_provider.token()?;
        Ok(req
            .header(USER_AGENT, self.user_agent.clone())
            .header(AUTHORIZATION, format!("Bearer {token}")))
    }

    fn stream_request(&self, scope: &StreamScope) -> Result<RequestBuilder, TransportError> {
        let req = match scope {
            StreamScope::User { replies_all } => {
                let mut url = self.user_stream_url.clone();
                if *replies_all {
                    url.query_pairs_mut().append_pair("replies", "all");
                }
                self.stream_http.get(url)
            }
            StreamScope::Filter { track } => self
                .stream_http
                .post(self.filter_stream_url.clone())
                .form(&[("track", track.as_str())]),
        };
        self.authorize(req)
    }

    fn capture_rate(&self, headers: &HeaderMap) {
        let limit = header_u64(headers, "x-rate-limit-limit");
        let remaining = header_u64(headers, "x-rate-limit-remaining");
        let reset = header_u64(headers, "x-rate-limit-reset");
        if limit == 0 && remaining == 0 && reset == 0 {
            return;
        }
        let mut rate = self.rate.write();
        rate.limit = limit;
        rate.remaining = remaining;
        rate.reset_at = SystemTime::UNIX_EPOCH.checked_add(Duration::from_secs(reset));
    }
}

impl Transport for Client {
    fn fetch_bulk(
        &self,
        feed: &FeedDescriptor,
        params: FetchParams,
    ) -> Result<Vec<Item>, TransportError> {
        self.timeline(feed, None, params)
    }

    fn fetch_incremental(
        &self,
        feed: &FeedDescriptor,
        since: Option<&Cursor>,
        params: FetchParams,
    ) -> Result<Vec<Item>, TransportError> {
        self.timeline(feed, since, params)
    }

    fn open_stream(&self, scope: &StreamScope) -> Result<StreamHandle, TransportError> {
        let request = self.stream_request(scope)?;
        let (sender, handle) = StreamHandle::channel();
        let scope = scope.clone();
        thread::spawn(move || read_stream(scope, request, sender));
        Ok(handle)
    }

    fn mutate(&self, action: Action, target: &Item) -> Result<(), TransportError> {
        let by_id = |key: &str, value: &str| vec![(key.to_string(), value.to_string())];
        match action {
            Action::Follow => self.post("friendships/create.json", &by_id("user_id", &target.author.id)),
            Action::Unfollow => {
                self.post("friendships/destroy.json", &by_id("user_id", &target.author.id))
            }
            Action::Repost => self.post(&format!("statuses/retweet/{}.json", target.id), &[]),
            Action::Unrepost => self.post(&format!("statuses/unretweet/{}.json", target.id), &[]),
            Action::Favorite => self.post("favorites/create.json", &by_id("id", &target.id)),
            Action::Unfavorite => self.post("favorites/destroy.json", &by_id("id", &target.id)),
        }
    }

    fn fetch_reposts_of_viewer(
        &self,
        since: Option<&Cursor>,
        params: FetchParams,
    ) -> Result<Vec<Item>, TransportError> {
        let mut query = vec![("count".to_string(), params.count.to_string())];
        if let Some(cursor) = since {
            query.push(("since_id".into(), cursor.id.clone()));
        }
        into_items(self.get_json("statuses/retweets_of_me.json", &query)?)
    }

    fn fetch_reposters(
        &self,
        item_id: &str,
        params: FetchParams,
    ) -> Result<Vec<Item>, TransportError> {
        let query = vec![("count".to_string(), params.count.to_string())];
        into_items(self.get_json(&format!("statuses/retweets/{item_id}.json"), &query)?)
    }

    fn post_status(&self, text: &str) -> Result<Item, TransportError> {
        let params = vec![("status".to_string(), text.to_string())];
        let tweet: Tweet = self.post_json("statuses/update.json", &params)?;
        tweet.into_item()
    }

    fn fetch_lists(&self, owner_id: Option<&str>) -> Result<Vec<ListSummary>, TransportError> {
        let mut query = Vec::new();
        if let Some(id) = owner_id {
            query.push(("user_id".to_string(), id.to_string()));
        }
        let lists: Vec<List> = self.get_json("lists/list.json", &query)?;
        Ok(lists.into_iter().map(List::into_summary).collect())
    }
}

fn read_stream(scope: StreamScope, request: RequestBuilder, sender: StreamSender) {
    let response = match request.send().map_err(TransportError::from).and_then(check_status) {
        Ok(response) => response,
        Err(err) => {
            warn!(?scope, error = %err, "stream connect failed");
            sender.send(StreamEvent::Error(err.to_string()));
            return;
        }
    };
    debug!(?scope, "stream connected");
    for line in BufReader::new(response).lines() {
        if sender.is_stopped() {
            break;
        }
        match line {
            Ok(line) => {
                let Some(event) = parse_stream_line(&line) else {
                    continue;
                };
                if !sender.send(event) {
                    break;
                }
            }
            Err(err) => {
                sender.send(StreamEvent::Error(err.to_string()));
                break;
            }
        }
    }
    debug!(?scope, "stream reader exiting");
}

/// Classify one line of a push stream. Keep-alives and message kinds the
/// feed does not use yield `None`.
pub(crate) fn parse_stream_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let message: StreamMessage = match serde_json::from_str(line) {
        Ok(message) => message,
        Err(err) => return Some(StreamEvent::Error(format!("undecodable stream message: {err}"))),
    };
    match message {
        StreamMessage::Event(event) => event.into_activity().map(StreamEvent::Activity),
        StreamMessage::Tweet(tweet) => Some(match tweet.into_item() {
            Ok(item) => StreamEvent::Item(item),
            Err(err) => StreamEvent::Error(err.to_string()),
        }),
        StreamMessage::Other(_) => None,
    }
}

fn check_status(resp: Response) -> Result<Response, TransportError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().unwrap_or_default();
    match status.as_u16() {
        401 => Err(TransportError::Unauthorized),
        403 => Err(TransportError::Forbidden(body)),
        420 | 429 => Err(TransportError::RateLimited(body)),
        code => Err(TransportError::Api { status: code, body }),
    }
}

fn parse_url(raw: &str) -> Result<Url, TransportError> {
    Url::parse(raw).map_err(|err| TransportError::Config(format!("invalid url {raw}: {err}")))
}

fn header_u64(headers: &HeaderMap, key: &str) -> u64 {
    headers
        .get(key)
        .and_then(|value| value.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0)
}

fn into_items(tweets: Vec<Tweet>) -> Result<Vec<Item>, TransportError> {
    tweets.into_iter().map(Tweet::into_item).collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id_str: String,
    pub screen_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub following: Option<bool>,
}

impl User {
    fn into_author(self) -> Author {
        Author {
            id: self.id_str,
            screen_name: self.screen_name,
            name: self.name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tweet {
    pub id_str: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub full_text: Option<String>,
    pub user: User,
    #[serde(default)]
    pub retweeted_status: Option<Box<Tweet>>,
    #[serde(default)]
    pub retweet_count: Option<u64>,
    #[serde(default)]
    pub favorite_count: Option<u64>,
    #[serde(default)]
    pub retweeted: bool,
    #[serde(default)]
    pub favorited: bool,
}

impl Tweet {
    pub fn into_item(self) -> Result<Item, TransportError> {
        let key = self
            .id_str
            .parse::<u64>()
            .map_err(|_| TransportError::Malformed(format!("non-numeric id {:?}", self.id_str)))?;
        let reposted = match self.retweeted_status {
            Some(original) => {
                let mut original = original.into_item()?;
                original.reposted = None;
                Some(Box::new(original))
            }
            None => None,
        };
        let created_at = self.created_at.as_deref().and_then(parse_created_at);
        let followed = self.user.following.unwrap_or(false);
        Ok(Item {
            id: self.id_str,
            key,
            created_at,
            text: self.full_text.or(self.text).unwrap_or_default(),
            author: self.user.into_author(),
            reposted,
            engagement: Engagement {
                repost_count: self.retweet_count.unwrap_or(0),
                favorite_count: self.favorite_count.unwrap_or(0),
            },
            flags: Flags {
                followed,
                reposted: self.retweeted,
                favorited: self.favorited,
            },
        })
    }
}

fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, CREATED_AT_FORMAT)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone, Deserialize)]
pub struct List {
    pub id_str: String,
    pub name: String,
    #[serde(default)]
    pub member_count: u64,
}

impl List {
    fn into_summary(self) -> ListSummary {
        ListSummary {
            id: self.id_str,
            name: self.name,
            member_count: self.member_count,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    #[serde(default)]
    statuses: Vec<Tweet>,
}

#[derive(Debug, Deserialize)]
struct ActivityEvent {
    event: String,
    source: User,
    #[serde(default)]
    target: Option<User>,
    #[serde(default)]
    target_object: Option<Tweet>,
}

impl ActivityEvent {
    fn into_activity(self) -> Option<Activity> {
        match self.event.as_str() {
            "favorite" => {
                let target = self.target_object?.into_item().ok()?;
                Some(Activity::Favorite {
                    source: self.source.into_author(),
                    target,
                })
            }
            "follow" => Some(Activity::Follow {
                source: self.source.into_author(),
                target: self.target?.into_author(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StreamMessage {
    Event(ActivityEvent),
    Tweet(Tweet),
    Other(serde_json::Value),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TWEET: &str = r#"{
        "id_str": "1050118621198921728",
        "created_at": "Wed Oct 10 20:19:24 +0000 2018",
        "text": "hello world",
        "user": {"id_str": "6253282", "screen_name": "TwitterAPI", "name": "Twitter API", "following": true},
        "retweet_count": 3,
        "favorite_count": null,
        "favorited": true
    }"#;

    #[test]
    fn tweet_converts_to_item() {
        let tweet: Tweet = serde_json::from_str(TWEET).unwrap();
        let item = tweet.into_item().unwrap();
        assert_eq!(item.id, "1050118621198921728");
        assert_eq!(item.key, 1050118621198921728);
        assert_eq!(item.text, "hello world");
        assert_eq!(item.author.screen_name, "TwitterAPI");
        assert_eq!(
            item.created_at,
            Some(Utc.with_ymd_and_hms(2018, 10, 10, 20, 19, 24).unwrap())
        );
        assert_eq!(item.engagement.repost_count, 3);
        assert_eq!(item.engagement.favorite_count, 0);
        assert!(item.flags.followed);
        assert!(item.flags.favorited);
        assert!(!item.flags.reposted);
    }

    #[test]
    fn retweet_keeps_original_one_level_deep() {
        let raw = format!(
            r#"{{"id_str": "2", "full_text": "RT @TwitterAPI: hello", "user": {{"id_str": "9", "screen_name": "fan"}}, "retweeted_status": {}}}"#,
            TWEET
        );
        let item = serde_json::from_str::<Tweet>(&raw)
            .unwrap()
            .into_item()
            .unwrap();
        assert_eq!(item.text, "RT @TwitterAPI: hello");
        let original = item.reposted.as_deref().unwrap();
        assert_eq!(original.id, "1050118621198921728");
        assert_eq!(item.target().engagement.repost_count, 3);
    }

    #[test]
    fn non_numeric_ids_are_rejected() {
        let raw = r#"{"id_str": "abc", "user": {"id_str": "1", "screen_name": "x"}}"#;
        let tweet: Tweet = serde_json::from_str(raw).unwrap();
        assert!(matches!(tweet.into_item(), Err(TransportError::Malformed(_))));
    }

    #[test]
    fn stream_lines_classify() {
        assert_eq!(parse_stream_line(""), None);
        assert_eq!(parse_stream_line("\r"), None);
        assert_eq!(parse_stream_line(r#"{"friends": [1, 2, 3]}"#), None);
        assert_eq!(parse_stream_line(r#"{"delete": {"status": {"id_str": "1"}}}"#), None);

        match parse_stream_line(TWEET) {
            Some(StreamEvent::Item(item)) => assert_eq!(item.id, "1050118621198921728"),
            other => panic!("expected item, got {other:?}"),
        }
        assert!(matches!(
            parse_stream_line("{not json"),
            Some(StreamEvent::Error(_))
        ));
    }

    #[test]
    fn stream_activity_events() {
        let follow = r#"{"event": "follow",
            "source": {"id_str": "9", "screen_name": "crab"},
            "target": {"id_str": "42", "screen_name": "ferris"}}"#;
        match parse_stream_line(follow) {
            Some(StreamEvent::Activity(Activity::Follow { source, target })) => {
                assert_eq!(source.screen_name, "crab");
                assert_eq!(target.id, "42");
            }
            other => panic!("expected follow, got {other:?}"),
        }

        let favorite = format!(
            r#"{{"event": "favorite", "source": {{"id_str": "9", "screen_name": "crab"}}, "target_object": {}}}"#,
            TWEET
        );
        assert!(matches!(
            parse_stream_line(&favorite),
            Some(StreamEvent::Activity(Activity::Favorite { .. }))
        ));

        let unfollow = r#"{"event": "unfollow", "source": {"id_str": "9", "screen_name": "crab"}}"#;
        assert_eq!(parse_stream_line(unfollow), None);
    }

    #[test]
    fn lists_convert_to_summaries() {
        let raw = r#"[
            {"id_str": "715919216927322112", "name": "rustaceans", "member_count": 12, "mode": "public"},
            {"id_str": "8", "name": "quiet"}
        ]"#;
        let lists: Vec<List> = serde_json::from_str(raw).unwrap();
        let summaries: Vec<ListSummary> = lists.into_iter().map(List::into_summary).collect();
        assert_eq!(summaries[0].id, "715919216927322112");
        assert_eq!(summaries[0].member_count, 12);
        assert_eq!(
            summaries[1].descriptor(),
            FeedDescriptor::list("8", "quiet")
        );
    }

    #[test]
    fn empty_token_is_a_config_error() {
        assert!(matches!(
            StaticToken::new("  ").token(),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn client_requires_user_agent() {
        let result = Client::new(Arc::new(StaticToken::new("t")), ClientConfig::default());
        assert!(matches!(result, Err(TransportError::Config(_))));
    }
}
