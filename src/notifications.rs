use std::collections::HashSet;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::feed::{closed_status, PollTimer};
use crate::model::{Author, Cursor, Item, StreamScope};
use crate::transport::{Activity, FetchParams, StreamEvent, StreamHandle, Transport, TransportError};

pub const RECONNECT_HINT: &str = "notification stream closed; reselect Notifications to reconnect";

#[derive(Debug, Clone)]
pub struct Settings {
    pub poll_interval: Duration,
    pub reposts_count: u32,
    pub reposters_count: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            reposts_count: 2,
            reposters_count: 100,
        }
    }
}

impl Settings {
    pub fn reposts_params(&self) -> FetchParams {
        FetchParams::count(self.reposts_count)
    }

    pub fn reposters_params(&self) -> FetchParams {
        FetchParams::count(self.reposters_count)
    }
}

/// The signed-in account notifications are collected for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub id: String,
    pub screen_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Mention(Item),
    Reposted { item: Item, reposters: Vec<Author> },
    Favorited { by: Author, item: Item },
    Followed { by: Author },
}

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("invalid screen name pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("open notification stream: {0}")]
    Stream(#[from] TransportError),
}

#[derive(Debug, Default)]
pub struct WatcherUpdate {
    pub changed: bool,
    /// Mentions first seen in this drain, in arrival order.
    pub mentions: Vec<Item>,
}

/// Long-lived collector for mentions, reposts and activity aimed at the
/// viewer. Survives feed switches.
#[derive(Debug)]
pub struct NotificationWatcher {
    generation: u64,
    viewer: Viewer,
    mention: Regex,
    stream: Option<StreamHandle>,
    timer: Option<PollTimer>,
    kickoff: bool,
    since: Option<Cursor>,
    notifications: Vec<Notification>,
    seen_mentions: HashSet<String>,
    stream_error: Option<String>,
    status: Option<String>,
}

impl NotificationWatcher {
    pub fn start(
        generation: u64,
        viewer: Viewer,
        transport: &dyn Transport,
        settings: &Settings,
    ) -> Result<Self, WatcherError> {
        let mention = mention_pattern(&viewer.screen_name)?;
        let stream = open_mention_stream(transport)?;
        info!(generation, viewer = %viewer.screen_name, "notification watcher started");
        Ok(Self {
            generation,
            viewer,
            mention,
            stream: Some(stream),
            timer: Some(PollTimer::start(settings.poll_interval)),
            kickoff: true,
            since: None,
            notifications: Vec::new(),
            seen_mentions: HashSet::new(),
            stream_error: None,
            status: None,
        })
    }

    /// Reopen the mention stream after it closed. A no-op while it is live.
    pub fn reconnect(&mut self, transport: &dyn Transport) -> Result<(), WatcherError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = open_mention_stream(transport).map_err(|err| {
            self.status = Some(closed_status(RECONNECT_HINT, Some(err.to_string())));
            err
        })?;
        self.stream = Some(stream);
        self.stream_error = None;
        self.status = None;
        info!(generation = self.generation, "notification stream reopened");
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some() || self.timer.is_some()
    }

    pub fn has_stream(&self) -> bool {
        self.stream.is_some()
    }

    /// Why the mention stream is down, if it is.
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn mentions_viewer(&self, item: &Item) -> bool {
        item.reposted.is_none()
            && !item.author.screen_name.eq_ignore_ascii_case(&self.viewer.screen_name)
            && self.mention.is_match(&item.text)
    }

    pub fn drain_stream(&mut self) -> WatcherUpdate {
        let mut update = WatcherUpdate::default();
        loop {
            let Some(handle) = self.stream.as_mut() else {
                return update;
            };
            let Some(event) = handle.try_next() else {
                return update;
            };
            match event {
                StreamEvent::Item(item) => {
                    self.stream_error = None;
                    if self.mentions_viewer(&item) && self.seen_mentions.insert(item.id.clone()) {
                        debug!(id = %item.id, "mention");
                        self.notifications.push(Notification::Mention(item.clone()));
                        update.mentions.push(item);
                        update.changed = true;
                    }
                }
                StreamEvent::Activity(activity) => {
                    if let Some(notification) = self.activity_notification(activity) {
                        self.notifications.push(notification);
                        update.changed = true;
                    }
                }
                StreamEvent::Error(message) => {
                    warn!(error = %message, "notification stream error");
                    self.stream_error = Some(message);
                }
                StreamEvent::Closed => {
                    warn!("notification stream closed; repost polling continues");
                    self.stream = None;
                    self.status = Some(closed_status(RECONNECT_HINT, self.stream_error.take()));
                    update.changed = true;
                    return update;
                }
            }
        }
    }

    fn activity_notification(&self, activity: Activity) -> Option<Notification> {
        match activity {
            Activity::Favorite { source, target } => {
                if source.id == self.viewer.id {
                    return None;
                }
                Some(Notification::Favorited {
                    by: source,
                    item: target,
                })
            }
            Activity::Follow { source, target } => {
                if target.id != self.viewer.id {
                    return None;
                }
                Some(Notification::Followed { by: source })
            }
        }
    }

    /// The reposts-of-viewer lookup to run now, if any. The first one runs
    /// straight away; after that the timer paces them.
    pub fn poll_due(&mut self) -> Option<Option<Cursor>> {
        let timer = self.timer.as_mut()?;
        if self.kickoff {
            self.kickoff = false;
            timer.begin();
            return Some(self.since.clone());
        }
        if timer.take_due() {
            Some(self.since.clone())
        } else {
            None
        }
    }

    /// Land a reposts-of-viewer page. Returns the items whose reposters
    /// should be looked up next.
    pub fn complete_reposts(&mut self, result: Result<Vec<Item>, TransportError>) -> Vec<Item> {
        if let Some(timer) = self.timer.as_mut() {
            timer.settle();
        }
        let mut items = match result {
            Ok(items) => items,
            Err(err) => {
                debug!(error = %err, "reposts-of-viewer lookup failed");
                return Vec::new();
            }
        };
        if let Some(newest) = items.iter().max_by_key(|item| item.key) {
            if self.since.as_ref().map_or(true, |since| newest.key > since.key) {
                self.since = Some(newest.cursor());
            }
        }
        items.retain(|item| item.engagement.repost_count > 0);
        items.sort_by_key(|item| item.key);
        items
    }

    /// Pair a reposted item with the accounts that reposted it. A repeat
    /// lookup for the same item replaces the earlier entry.
    pub fn complete_reposters(
        &mut self,
        item: Item,
        result: Result<Vec<Item>, TransportError>,
    ) -> bool {
        let statuses = match result {
            Ok(statuses) => statuses,
            Err(err) => {
                debug!(id = %item.id, error = %err, "reposter lookup failed");
                return false;
            }
        };
        let mut seen = HashSet::new();
        let reposters: Vec<Author> = statuses
            .into_iter()
            .map(|status| status.author)
            .filter(|author| seen.insert(author.id.clone()))
            .collect();
        if reposters.is_empty() {
            return false;
        }

        let existing = self.notifications.iter_mut().find(|entry| {
            matches!(entry, Notification::Reposted { item: known, .. } if known.id == item.id)
        });
        match existing {
            Some(entry) => *entry = Notification::Reposted { item, reposters },
            None => self.notifications.push(Notification::Reposted { item, reposters }),
        }
        true
    }

    pub fn teardown(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
        }
        if let Some(mut timer) = self.timer.take() {
            timer.clear();
        }
        debug!(generation = self.generation, "notification watcher stopped");
    }
}

impl Drop for NotificationWatcher {
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
        }
    }
}

fn open_mention_stream(transport: &dyn Transport) -> Result<StreamHandle, TransportError> {
    transport.open_stream(&StreamScope::User { replies_all: true })
}

fn mention_pattern(screen_name: &str) -> Result<Regex, regex::Error> {
    let handle = screen_name.trim().trim_start_matches('@');
    Regex::new(&format!(
        r"(?i)(?:^|[^A-Za-z0-9_])@{}(?:[^A-Za-z0-9_]|$)",
        regex::escape(handle)
    ))
}
