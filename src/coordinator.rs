use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, trace, warn};

use crate::feed::{self, check_generation, FeedSession, PollRequest, SessionState};
use crate::model::{Action, Cursor, FeedDescriptor, Item, ListSummary};
use crate::notifications::{self, Notification, NotificationWatcher, Viewer};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, Default)]
pub struct Options {
    pub feeds: feed::Settings,
    pub notifications: notifications::Settings,
    /// Needed for the notification watcher; without it notifications stay off.
    pub viewer: Option<Viewer>,
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("no feed is active")]
    NoActiveFeed,
    #[error("item {0} is not in the current feed")]
    UnknownItem(String),
    #[error("status text is empty")]
    EmptyStatus,
    #[error("{action} rejected: {source}")]
    Rejected {
        action: Action,
        #[source]
        source: TransportError,
    },
}

/// A finished request the caller asked for, collected by `take_outcomes`.
#[derive(Debug)]
pub enum Outcome {
    Action {
        action: Action,
        item_id: String,
        result: Result<(), ActionError>,
    },
    Posted(Result<Item, TransportError>),
    Lists(Result<Vec<ListSummary>, TransportError>),
}

enum Response {
    Fetched {
        generation: u64,
        result: Result<Vec<Item>, TransportError>,
    },
    Polled {
        generation: u64,
        result: Result<Vec<Item>, TransportError>,
    },
    Reposts {
        generation: u64,
        result: Result<Vec<Item>, TransportError>,
    },
    Reposters {
        generation: u64,
        item: Item,
        result: Result<Vec<Item>, TransportError>,
    },
    Mutated {
        generation: u64,
        action: Action,
        item_id: String,
        result: Result<(), TransportError>,
    },
    Posted(Result<Item, TransportError>),
    Lists(Result<Vec<ListSummary>, TransportError>),
}

/// The live sessions: at most one feed and at most one watcher.
#[derive(Debug, Default)]
pub struct Registry {
    active: Option<FeedSession>,
    watcher: Option<NotificationWatcher>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&FeedSession> {
        self.active.as_ref()
    }

    pub fn watcher(&self) -> Option<&NotificationWatcher> {
        self.watcher.as_ref()
    }

    /// Tear down whatever feed is live, then install `session`.
    fn replace(&mut self, session: FeedSession) {
        self.retire_active();
        self.active = Some(session);
    }

    fn retire_active(&mut self) {
        if let Some(mut previous) = self.active.take() {
            debug!(
                generation = previous.generation(),
                feed = %previous.descriptor(),
                state = ?previous.state(),
                "tearing down feed session"
            );
            previous.teardown();
        }
    }

    fn retire_watcher(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.teardown();
        }
    }
}

/// Drives the active feed and the notification watcher. Every state change
/// happens on the thread calling into the coordinator; network calls run on
/// worker threads and report back through a single response queue.
pub struct Coordinator {
    transport: Arc<dyn Transport>,
    options: Options,
    registry: Registry,
    response_tx: Sender<Response>,
    response_rx: Receiver<Response>,
    next_generation: u64,
    label: String,
    outcomes: Vec<Outcome>,
}

impl Coordinator {
    pub fn new(transport: Arc<dyn Transport>, options: Options) -> Self {
        let (response_tx, response_rx) = unbounded();
        Self {
            transport,
            options,
            registry: Registry::new(),
            response_tx,
            response_rx,
            next_generation: 1,
            label: String::new(),
            outcomes: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn items(&self) -> &[Item] {
        self.registry
            .active
            .as_ref()
            .map(FeedSession::items)
            .unwrap_or(&[])
    }

    pub fn state(&self) -> Option<SessionState> {
        self.registry.active.as_ref().map(FeedSession::state)
    }

    /// Last failure or hint for the active feed. A notifications feed also
    /// reports a lost mention stream here.
    pub fn status(&self) -> Option<&str> {
        let session = self.registry.active.as_ref()?;
        session.error().or_else(|| {
            if session.state() == SessionState::Watching {
                self.notifications_status()
            } else {
                None
            }
        })
    }

    pub fn notifications_status(&self) -> Option<&str> {
        self.registry
            .watcher
            .as_ref()
            .and_then(NotificationWatcher::status)
    }

    pub fn notifications(&self) -> &[Notification] {
        self.registry
            .watcher
            .as_ref()
            .map(NotificationWatcher::notifications)
            .unwrap_or(&[])
    }

    /// Update mechanisms held by the feed session: 0 or 1.
    pub fn feed_mechanisms(&self) -> usize {
        usize::from(
            self.registry
                .active
                .as_ref()
                .is_some_and(FeedSession::has_mechanism),
        )
    }

    /// Replace the active feed. The old session is torn down before the new
    /// one issues its first request.
    pub fn switch_feed(&mut self, descriptor: FeedDescriptor) {
        let generation = self.bump_generation();
        info!(generation, feed = %descriptor, "switching feed");
        self.label = descriptor.label();
        self.registry
            .replace(FeedSession::new(generation, descriptor.clone()));
        self.dispatch_fetch(generation, descriptor);
    }

    /// Start the notification watcher if it is not already running. A
    /// running watcher whose mention stream closed gets it reopened.
    pub fn start_notifications(&mut self) -> bool {
        if let Some(watcher) = self.registry.watcher.as_mut() {
            if watcher.is_running() {
                return match watcher.reconnect(self.transport.as_ref()) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(error = %err, "failed to reopen notification stream");
                        false
                    }
                };
            }
        }
        let Some(viewer) = self.options.viewer.clone() else {
            warn!("no viewer configured; notifications disabled");
            return false;
        };
        self.registry.retire_watcher();
        let generation = self.bump_generation();
        match NotificationWatcher::start(
            generation,
            viewer,
            self.transport.as_ref(),
            &self.options.notifications,
        ) {
            Ok(watcher) => {
                self.registry.watcher = Some(watcher);
                self.pump_watcher();
                true
            }
            Err(err) => {
                warn!(error = %err, "failed to start notification watcher");
                false
            }
        }
    }

    pub fn stop_notifications(&mut self) {
        self.registry.retire_watcher();
    }

    /// Send an engagement action to the platform. The target item changes
    /// only once the platform accepts, on a later `pump`, and only if the
    /// feed is still the one the action was issued against. The result is
    /// reported as an `Outcome::Action`.
    pub fn apply_action(&mut self, action: Action, item_id: &str) -> Result<(), ActionError> {
        let session = self
            .registry
            .active
            .as_ref()
            .ok_or(ActionError::NoActiveFeed)?;
        let target = session
            .timeline()
            .action_target(item_id)
            .cloned()
            .ok_or_else(|| ActionError::UnknownItem(item_id.to_string()))?;
        debug!(%action, id = item_id, target = %target.id, "dispatching action");
        self.dispatch_mutation(session.generation(), action, item_id.to_string(), target);
        Ok(())
    }

    /// Publish a status. Reported as `Outcome::Posted`.
    pub fn post_status(&mut self, text: &str) -> Result<(), ActionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ActionError::EmptyStatus);
        }
        let transport = Arc::clone(&self.transport);
        let tx = self.response_tx.clone();
        let text = text.to_string();
        thread::spawn(move || {
            let _ = tx.send(Response::Posted(transport.post_status(&text)));
        });
        Ok(())
    }

    /// Look up the viewer's lists. Reported as `Outcome::Lists`.
    pub fn request_lists(&mut self) {
        let transport = Arc::clone(&self.transport);
        let tx = self.response_tx.clone();
        let owner = self.options.viewer.as_ref().map(|viewer| viewer.id.clone());
        thread::spawn(move || {
            let _ = tx.send(Response::Lists(transport.fetch_lists(owner.as_deref())));
        });
    }

    /// Everything that finished since the last call, oldest first.
    pub fn take_outcomes(&mut self) -> Vec<Outcome> {
        std::mem::take(&mut self.outcomes)
    }

    /// Apply everything that arrived since the last call. Returns whether
    /// anything visible changed.
    pub fn pump(&mut self) -> bool {
        let mut changed = false;
        while let Ok(response) = self.response_rx.try_recv() {
            changed |= self.handle_response(response);
        }
        changed |= self.pump_feed();
        changed |= self.pump_watcher();
        changed
    }

    /// Tear everything down. Also runs on drop.
    pub fn shutdown(&mut self) {
        self.registry.retire_active();
        self.registry.retire_watcher();
    }

    fn bump_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn handle_response(&mut self, response: Response) -> bool {
        match response {
            Response::Fetched { generation, result } => self.land_fetch(generation, result),
            Response::Polled { generation, result } => {
                let Some(session) = self.registry.active.as_mut() else {
                    return false;
                };
                if let Err(err) = check_generation(session.generation(), generation) {
                    trace!(%err, "discarding poll result");
                    return false;
                }
                session.complete_poll(result)
            }
            Response::Reposts { generation, result } => {
                let Some(watcher) = self.registry.watcher.as_mut() else {
                    return false;
                };
                if let Err(err) = check_generation(watcher.generation(), generation) {
                    trace!(%err, "discarding reposts result");
                    return false;
                }
                for item in watcher.complete_reposts(result) {
                    self.dispatch_reposters(generation, item);
                }
                false
            }
            Response::Reposters {
                generation,
                item,
                result,
            } => {
                let Some(watcher) = self.registry.watcher.as_mut() else {
                    return false;
                };
                if let Err(err) = check_generation(watcher.generation(), generation) {
                    trace!(%err, "discarding reposters result");
                    return false;
                }
                watcher.complete_reposters(item, result)
            }
            Response::Mutated {
                generation,
                action,
                item_id,
                result,
            } => self.land_mutation(generation, action, item_id, result),
            Response::Posted(result) => {
                if let Err(err) = &result {
                    warn!(error = %err, "post failed");
                }
                self.outcomes.push(Outcome::Posted(result));
                true
            }
            Response::Lists(result) => {
                self.outcomes.push(Outcome::Lists(result));
                true
            }
        }
    }

    fn land_mutation(
        &mut self,
        generation: u64,
        action: Action,
        item_id: String,
        result: Result<(), TransportError>,
    ) -> bool {
        let result = result.map_err(|source| ActionError::Rejected { action, source });
        if result.is_ok() {
            match self.registry.active.as_mut() {
                Some(session) => match check_generation(session.generation(), generation) {
                    Ok(()) => {
                        session.apply_confirmed(action, &item_id);
                    }
                    Err(err) => trace!(%err, %action, "action landed after feed switch"),
                },
                None => trace!(generation, %action, "action landed with no active feed"),
            }
        }
        self.outcomes.push(Outcome::Action {
            action,
            item_id,
            result,
        });
        true
    }

    fn land_fetch(&mut self, generation: u64, result: Result<Vec<Item>, TransportError>) -> bool {
        let Some(session) = self.registry.active.as_mut() else {
            trace!(generation, "bulk result with no active feed");
            return false;
        };
        if let Err(err) = check_generation(session.generation(), generation) {
            trace!(%err, "discarding bulk result");
            return false;
        }
        if let Err(err) =
            session.complete_fetch(result, self.transport.as_ref(), &self.options.feeds)
        {
            warn!(%err, "feed did not start");
        }
        if session.state() == SessionState::Watching {
            self.start_notifications();
            self.mirror_mentions();
        }
        true
    }

    /// Copy mentions the watcher already holds into a notifications feed.
    fn mirror_mentions(&mut self) {
        let (Some(session), Some(watcher)) =
            (self.registry.active.as_mut(), self.registry.watcher.as_ref())
        else {
            return;
        };
        for notification in watcher.notifications() {
            if let Notification::Mention(item) = notification {
                session.merge_live(item.clone());
            }
        }
    }

    fn pump_feed(&mut self) -> bool {
        let (changed, request) = {
            let Some(session) = self.registry.active.as_mut() else {
                return false;
            };
            let changed = session.drain_stream();
            let request = session
                .poll_due()
                .map(|request| (session.generation(), request));
            (changed, request)
        };
        if let Some((generation, request)) = request {
            self.dispatch_poll(generation, request);
        }
        changed
    }

    fn pump_watcher(&mut self) -> bool {
        let (update, request) = {
            let Some(watcher) = self.registry.watcher.as_mut() else {
                return false;
            };
            let update = watcher.drain_stream();
            let request = watcher
                .poll_due()
                .map(|since| (watcher.generation(), since));
            (update, request)
        };
        if let Some((generation, since)) = request {
            self.dispatch_reposts(generation, since);
        }

        let mut changed = update.changed;
        if let Some(session) = self.registry.active.as_mut() {
            if session.state() == SessionState::Watching {
                for item in update.mentions {
                    session.merge_live(item);
                    changed = true;
                }
            }
        }
        changed
    }

    fn dispatch_fetch(&self, generation: u64, descriptor: FeedDescriptor) {
        let transport = Arc::clone(&self.transport);
        let tx = self.response_tx.clone();
        let params = self.options.feeds.bulk_params(&descriptor);
        thread::spawn(move || {
            let result = transport.fetch_bulk(&descriptor, params);
            let _ = tx.send(Response::Fetched { generation, result });
        });
    }

    fn dispatch_poll(&self, generation: u64, request: PollRequest) {
        let transport = Arc::clone(&self.transport);
        let tx = self.response_tx.clone();
        let params = self.options.feeds.poll_params();
        thread::spawn(move || {
            let result = transport.fetch_incremental(&request.feed, request.since.as_ref(), params);
            let _ = tx.send(Response::Polled { generation, result });
        });
    }

    fn dispatch_reposts(&self, generation: u64, since: Option<Cursor>) {
        let transport = Arc::clone(&self.transport);
        let tx = self.response_tx.clone();
        let params = self.options.notifications.reposts_params();
        thread::spawn(move || {
            let result = transport.fetch_reposts_of_viewer(since.as_ref(), params);
            let _ = tx.send(Response::Reposts { generation, result });
        });
    }

    fn dispatch_mutation(&self, generation: u64, action: Action, item_id: String, target: Item) {
        let transport = Arc::clone(&self.transport);
        let tx = self.response_tx.clone();
        thread::spawn(move || {
            let result = transport.mutate(action, &target);
            let _ = tx.send(Response::Mutated {
                generation,
                action,
                item_id,
                result,
            });
        });
    }

    fn dispatch_reposters(&self, generation: u64, item: Item) {
        let transport = Arc::clone(&self.transport);
        let tx = self.response_tx.clone();
        let params = self.options.notifications.reposters_params();
        thread::spawn(move || {
            let result = transport.fetch_reposters(&item.id, params);
            let _ = tx.send(Response::Reposters {
                generation,
                item,
                result,
            });
        });
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::model::{Author, ListSummary, StreamScope};
    use crate::transport::scripted::ScriptedTransport;
    use crate::transport::StreamEvent;

    fn options() -> Options {
        Options {
            feeds: feed::Settings {
                list_poll_interval: Duration::from_millis(5),
                ..feed::Settings::default()
            },
            notifications: notifications::Settings {
                poll_interval: Duration::from_secs(60),
                ..notifications::Settings::default()
            },
            viewer: Some(Viewer {
                id: "42".into(),
                screen_name: "ferris".into(),
            }),
        }
    }

    fn coordinator(transport: &Arc<ScriptedTransport>) -> Coordinator {
        let transport: Arc<dyn Transport> = transport.clone();
        Coordinator::new(transport, options())
    }

    fn pump_until(coordinator: &mut Coordinator, what: &str, done: impl Fn(&Coordinator) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            coordinator.pump();
            if done(coordinator) {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("timed out waiting for {what}");
    }

    fn wait_for_outcome(coordinator: &mut Coordinator) -> Outcome {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            coordinator.pump();
            if let Some(outcome) = coordinator.take_outcomes().into_iter().next() {
                return outcome;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("timed out waiting for an outcome");
    }

    fn ids(coordinator: &Coordinator) -> Vec<&str> {
        coordinator.items().iter().map(|item| item.id.as_str()).collect()
    }

    fn items(ids: &[(&str, u64)]) -> Vec<Item> {
        ids.iter().map(|(id, key)| Item::new(*id, *key)).collect()
    }

    #[test]
    fn search_stream_merges_and_updates_in_place() {
        let transport = ScriptedTransport::new();
        let search = FeedDescriptor::search("cats");
        transport.script_bulk(search.clone(), items(&[("c", 3), ("b", 2), ("a", 1)]));
        let mut coordinator = coordinator(&transport);

        coordinator.switch_feed(search);
        assert_eq!(coordinator.label(), "Search: cats");
        assert!(coordinator.items().is_empty());
        pump_until(&mut coordinator, "streaming", |c| {
            c.state() == Some(SessionState::Streaming)
        });
        assert_eq!(ids(&coordinator), ["a", "b", "c"]);

        let stream = transport.stream(&StreamScope::Filter {
            track: "cats".into(),
        });
        stream.send(StreamEvent::Item(Item::new("d", 4)));
        pump_until(&mut coordinator, "d", |c| c.items().len() == 4);
        assert_eq!(ids(&coordinator), ["a", "b", "c", "d"]);

        stream.send(StreamEvent::Item(Item::new("b", 2).with_engagement(9, 0)));
        pump_until(&mut coordinator, "b update", |c| {
            c.items()[1].engagement.repost_count == 9
        });
        assert_eq!(ids(&coordinator), ["a", "b", "c", "d"]);
    }

    #[test]
    fn list_polls_advance_cursor_only_on_new_items() {
        let transport = ScriptedTransport::new();
        let list = FeedDescriptor::list("7", "friends");
        transport.script_bulk(list.clone(), items(&[("b", 20), ("a", 10)]));
        transport.script_poll(Ok(Vec::new()));
        transport.script_poll(Ok(items(&[("d", 40), ("c", 30)])));
        let mut coordinator = coordinator(&transport);

        coordinator.switch_feed(list);
        assert_eq!(coordinator.label(), "friends");
        pump_until(&mut coordinator, "two polls", |c| c.items().len() == 4);

        assert_eq!(ids(&coordinator), ["a", "b", "c", "d"]);
        let calls = transport.poll_calls();
        assert_eq!(calls[0].as_ref().unwrap().id, "b");
        assert_eq!(calls[1].as_ref().unwrap().id, "b");
        let cursor = coordinator.registry().active().unwrap().cursor().unwrap();
        assert_eq!(cursor.id, "d");

        pump_until(&mut coordinator, "third poll", |_| transport.poll_calls().len() >= 3);
        assert_eq!(transport.poll_calls()[2].as_ref().unwrap().id, "d");
    }

    #[test]
    fn late_bulk_result_from_superseded_feed_is_discarded() {
        let transport = ScriptedTransport::new();
        let release_home =
            transport.script_bulk_gated(FeedDescriptor::Home, items(&[("h1", 1), ("h2", 2)]));
        let search = FeedDescriptor::search("x");
        transport.script_bulk(search.clone(), items(&[("s1", 5)]));
        let mut coordinator = coordinator(&transport);

        coordinator.switch_feed(FeedDescriptor::Home);
        coordinator.switch_feed(search);
        pump_until(&mut coordinator, "search results", |c| {
            c.state() == Some(SessionState::Streaming)
        });

        release_home.send(()).unwrap();
        thread::sleep(Duration::from_millis(50));
        coordinator.pump();

        assert_eq!(coordinator.label(), "Search: x");
        assert_eq!(ids(&coordinator), ["s1"]);
        let home_scope = StreamScope::User { replies_all: false };
        assert_eq!(transport.live_streams(Some(&home_scope)), 0);
    }

    #[test]
    fn switching_never_leaves_two_mechanisms() {
        let transport = ScriptedTransport::new();
        let feeds = [
            FeedDescriptor::Home,
            FeedDescriptor::search("a"),
            FeedDescriptor::list("1", "one"),
            FeedDescriptor::search("b"),
            FeedDescriptor::Home,
        ];
        let mut coordinator = coordinator(&transport);

        for feed in feeds {
            coordinator.switch_feed(feed);
            assert_eq!(coordinator.feed_mechanisms(), 0);
            pump_until(&mut coordinator, "incremental phase", |c| {
                c.feed_mechanisms() == 1
            });
            assert!(transport.live_streams(None) <= 1);
        }
        coordinator.shutdown();
        assert_eq!(transport.live_streams(None), 0);
        assert_eq!(coordinator.feed_mechanisms(), 0);
    }

    #[test]
    fn old_stream_cannot_reach_new_feed() {
        let transport = ScriptedTransport::new();
        let mut coordinator = coordinator(&transport);
        coordinator.switch_feed(FeedDescriptor::Home);
        pump_until(&mut coordinator, "home stream", |c| {
            c.state() == Some(SessionState::Streaming)
        });
        let home = transport.stream(&StreamScope::User { replies_all: false });

        coordinator.switch_feed(FeedDescriptor::search("x"));
        assert!(!home.send(StreamEvent::Item(Item::new("ghost", 99))));
        pump_until(&mut coordinator, "search stream", |c| {
            c.state() == Some(SessionState::Streaming)
        });
        assert!(coordinator.items().is_empty());
    }

    #[test]
    fn failed_fetch_parks_session_until_reselected() {
        let transport = ScriptedTransport::new();
        transport.script_bulk_error(FeedDescriptor::Home);
        transport.script_bulk(FeedDescriptor::Home, items(&[("a", 1)]));
        let mut coordinator = coordinator(&transport);

        coordinator.switch_feed(FeedDescriptor::Home);
        pump_until(&mut coordinator, "failure", |c| c.status().is_some());
        assert_eq!(coordinator.state(), Some(SessionState::Fetching));
        assert!(coordinator.items().is_empty());
        assert_eq!(transport.streams_opened(), 0);

        coordinator.switch_feed(FeedDescriptor::Home);
        pump_until(&mut coordinator, "retry", |c| {
            c.state() == Some(SessionState::Streaming)
        });
        assert_eq!(ids(&coordinator), ["a"]);
        assert!(coordinator.status().is_none());
    }

    #[test]
    fn actions_commit_only_after_success() {
        let transport = ScriptedTransport::new();
        let wrapper = Item::new("rt", 2).reposting(Item::new("orig", 1).with_engagement(1, 1));
        transport.script_bulk(FeedDescriptor::Home, vec![wrapper, Item::new("plain", 3)]);
        let mut coordinator = coordinator(&transport);
        coordinator.switch_feed(FeedDescriptor::Home);
        pump_until(&mut coordinator, "home", |c| c.items().len() == 2);

        coordinator.apply_action(Action::Favorite, "rt").unwrap();
        match wait_for_outcome(&mut coordinator) {
            Outcome::Action {
                action: Action::Favorite,
                item_id,
                result: Ok(()),
            } => assert_eq!(item_id, "rt"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(transport.mutations(), vec![(Action::Favorite, "orig".to_string())]);
        let original = coordinator.items()[0].reposted.as_deref().unwrap();
        assert_eq!(original.engagement.favorite_count, 2);
        assert!(original.flags.favorited);

        assert!(matches!(
            coordinator.apply_action(Action::Repost, "nope"),
            Err(ActionError::UnknownItem(_))
        ));

        transport.reject_mutations();
        coordinator.apply_action(Action::Repost, "plain").unwrap();
        match wait_for_outcome(&mut coordinator) {
            Outcome::Action {
                result: Err(ActionError::Rejected { action, .. }),
                ..
            } => assert_eq!(action, Action::Repost),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(coordinator.items()[1].engagement.repost_count, 0);
        assert_eq!(ids(&coordinator), ["rt", "plain"]);
    }

    #[test]
    fn pending_action_does_not_hold_up_the_feed() {
        let transport = ScriptedTransport::new();
        transport.script_bulk(FeedDescriptor::Home, items(&[("a", 1)]));
        let mut coordinator = coordinator(&transport);
        coordinator.switch_feed(FeedDescriptor::Home);
        pump_until(&mut coordinator, "home stream", |c| {
            c.state() == Some(SessionState::Streaming)
        });
        let release = transport.gate_mutations();

        let started = Instant::now();
        coordinator.apply_action(Action::Favorite, "a").unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(coordinator.items()[0].engagement.favorite_count, 0);

        let stream = transport.stream(&StreamScope::User { replies_all: false });
        stream.send(StreamEvent::Item(Item::new("b", 2)));
        pump_until(&mut coordinator, "live item", |c| c.items().len() == 2);
        assert!(coordinator.take_outcomes().is_empty());
        assert_eq!(coordinator.items()[0].engagement.favorite_count, 0);

        release.send(()).unwrap();
        pump_until(&mut coordinator, "favorite", |c| {
            c.items()[0].engagement.favorite_count == 1
        });
        assert!(coordinator.items()[0].flags.favorited);
    }

    #[test]
    fn action_landing_after_switch_leaves_new_feed_alone() {
        let transport = ScriptedTransport::new();
        transport.script_bulk(FeedDescriptor::Home, items(&[("a", 1)]));
        let search = FeedDescriptor::search("x");
        transport.script_bulk(search.clone(), items(&[("a", 1)]));
        let mut coordinator = coordinator(&transport);
        coordinator.switch_feed(FeedDescriptor::Home);
        pump_until(&mut coordinator, "home", |c| c.items().len() == 1);

        let release = transport.gate_mutations();
        coordinator.apply_action(Action::Favorite, "a").unwrap();
        coordinator.switch_feed(search);
        pump_until(&mut coordinator, "search", |c| c.items().len() == 1);

        release.send(()).unwrap();
        assert!(matches!(
            wait_for_outcome(&mut coordinator),
            Outcome::Action { result: Ok(()), .. }
        ));
        assert_eq!(coordinator.items()[0].engagement.favorite_count, 0);
        assert!(!coordinator.items()[0].flags.favorited);
    }

    #[test]
    fn posts_and_lists_report_outcomes() {
        let transport = ScriptedTransport::new();
        transport.script_lists(vec![ListSummary {
            id: "7".into(),
            name: "friends".into(),
            member_count: 3,
        }]);
        let mut coordinator = coordinator(&transport);

        assert!(matches!(
            coordinator.post_status("   "),
            Err(ActionError::EmptyStatus)
        ));
        coordinator.post_status(" hello world ").unwrap();
        match wait_for_outcome(&mut coordinator) {
            Outcome::Posted(Ok(item)) => assert_eq!(item.text, "hello world"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(transport.posts(), vec!["hello world".to_string()]);

        coordinator.request_lists();
        match wait_for_outcome(&mut coordinator) {
            Outcome::Lists(Ok(lists)) => {
                assert_eq!(lists.len(), 1);
                assert_eq!(lists[0].descriptor(), FeedDescriptor::list("7", "friends"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(transport.list_owners(), vec![Some("42".to_string())]);
    }

    #[test]
    fn stale_poll_result_is_discarded() {
        let transport = ScriptedTransport::new();
        let first = FeedDescriptor::list("1", "first");
        let second = FeedDescriptor::list("2", "second");
        transport.script_bulk(first.clone(), items(&[("a1", 10)]));
        transport.script_bulk(second.clone(), items(&[("b1", 5)]));
        let release = transport.script_poll_gated(items(&[("ghost", 99)]));
        let mut coordinator = coordinator(&transport);

        coordinator.switch_feed(first);
        pump_until(&mut coordinator, "first poll", |_| !transport.poll_calls().is_empty());
        coordinator.switch_feed(second);
        pump_until(&mut coordinator, "second list", |c| {
            c.state() == Some(SessionState::Polling)
        });

        release.send(()).unwrap();
        thread::sleep(Duration::from_millis(50));
        coordinator.pump();

        assert_eq!(ids(&coordinator), ["b1"]);
        let cursor = coordinator.registry().active().unwrap().cursor().unwrap();
        assert_eq!(cursor.id, "b1");
    }

    #[test]
    fn reposts_from_a_stopped_watcher_are_discarded() {
        let transport = ScriptedTransport::new();
        let release = transport.script_reposts_gated(vec![Item::new("mine", 10).with_engagement(1, 0)]);
        transport.script_reposters("mine", vec![Item::new("rt1", 11)]);
        let mut coordinator = coordinator(&transport);

        assert!(coordinator.start_notifications());
        pump_until(&mut coordinator, "first lookup", |_| transport.reposts_calls() >= 1);
        coordinator.stop_notifications();
        assert!(coordinator.start_notifications());
        pump_until(&mut coordinator, "second lookup", |_| transport.reposts_calls() >= 2);

        release.send(()).unwrap();
        thread::sleep(Duration::from_millis(50));
        coordinator.pump();
        coordinator.pump();

        assert!(coordinator.notifications().is_empty());
        assert!(transport.reposters_calls().is_empty());
    }

    #[test]
    fn closed_notification_stream_reopens_on_reselect() {
        let transport = ScriptedTransport::new();
        let scope = StreamScope::User { replies_all: true };
        transport.close_stream_on_open(scope.clone(), None);
        transport.close_stream_on_open(scope.clone(), Some("stream rejected"));
        let mut coordinator = coordinator(&transport);

        assert!(coordinator.start_notifications());
        pump_until(&mut coordinator, "watcher stream lost", |c| {
            c.notifications_status().is_some()
        });

        coordinator.switch_feed(FeedDescriptor::Notifications);
        pump_until(&mut coordinator, "lost again", |c| {
            c.state() == Some(SessionState::Watching) && c.status().is_some()
        });
        assert_eq!(transport.streams_opened(), 2);
        let status = coordinator.status().unwrap();
        assert!(status.starts_with("stream rejected"));
        assert!(status.ends_with(notifications::RECONNECT_HINT));

        coordinator.switch_feed(FeedDescriptor::Notifications);
        pump_until(&mut coordinator, "reconnected", |c| {
            c.state() == Some(SessionState::Watching)
        });
        assert_eq!(transport.streams_opened(), 3);
        assert_eq!(coordinator.status(), None);
        assert_eq!(transport.live_streams(Some(&scope)), 1);

        let mention = Item::new("m", 5)
            .with_author(Author {
                id: "9".into(),
                screen_name: "crab".into(),
                name: String::new(),
            })
            .with_text("@ferris back again");
        transport.stream(&scope).send(StreamEvent::Item(mention));
        pump_until(&mut coordinator, "mention", |c| c.items().len() == 1);
    }

    #[test]
    fn action_without_feed_is_rejected() {
        let transport = ScriptedTransport::new();
        let mut coordinator = coordinator(&transport);
        assert!(matches!(
            coordinator.apply_action(Action::Follow, "a"),
            Err(ActionError::NoActiveFeed)
        ));
    }

    #[test]
    fn notifications_feed_mirrors_live_mentions() {
        let transport = ScriptedTransport::new();
        transport.script_bulk(FeedDescriptor::Notifications, items(&[("old", 1)]));
        let mut coordinator = coordinator(&transport);

        coordinator.switch_feed(FeedDescriptor::Notifications);
        pump_until(&mut coordinator, "watching", |c| {
            c.state() == Some(SessionState::Watching)
        });
        assert!(coordinator.registry().watcher().is_some());
        assert_eq!(coordinator.feed_mechanisms(), 0);

        let stream = transport.stream(&StreamScope::User { replies_all: true });
        let mention = Item::new("m", 5)
            .with_author(Author {
                id: "9".into(),
                screen_name: "crab".into(),
                name: String::new(),
            })
            .with_text("@ferris look");
        stream.send(StreamEvent::Item(mention));
        pump_until(&mut coordinator, "mention", |c| c.items().len() == 2);
        assert_eq!(ids(&coordinator), ["old", "m"]);
        assert_eq!(coordinator.notifications().len(), 1);
    }

    #[test]
    fn watcher_survives_feed_switches() {
        let transport = ScriptedTransport::new();
        let mut coordinator = coordinator(&transport);
        assert!(coordinator.start_notifications());
        assert!(coordinator.start_notifications());
        let scope = StreamScope::User { replies_all: true };
        assert_eq!(transport.live_streams(Some(&scope)), 1);

        coordinator.switch_feed(FeedDescriptor::Home);
        coordinator.switch_feed(FeedDescriptor::search("x"));
        assert_eq!(transport.live_streams(Some(&scope)), 1);

        coordinator.stop_notifications();
        assert_eq!(transport.live_streams(Some(&scope)), 0);
    }

    #[test]
    fn reposts_of_viewer_surface_with_reposters() {
        let transport = ScriptedTransport::new();
        transport.script_reposts(vec![Item::new("mine", 10).with_engagement(1, 0)]);
        transport.script_reposters(
            "mine",
            vec![Item::new("rt1", 11).with_author(Author {
                id: "7".into(),
                screen_name: "fan".into(),
                name: "Fan".into(),
            })],
        );
        let mut coordinator = coordinator(&transport);
        coordinator.start_notifications();

        pump_until(&mut coordinator, "repost notification", |c| {
            !c.notifications().is_empty()
        });
        match &coordinator.notifications()[0] {
            Notification::Reposted { item, reposters } => {
                assert_eq!(item.id, "mine");
                assert_eq!(reposters[0].screen_name, "fan");
            }
            other => panic!("unexpected notification {other:?}"),
        }
    }

    #[test]
    fn notifications_need_a_viewer() {
        let transport = ScriptedTransport::new();
        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let mut coordinator = Coordinator::new(
            dyn_transport,
            Options {
                viewer: None,
                ..options()
            },
        );
        assert!(!coordinator.start_notifications());
        assert_eq!(transport.streams_opened(), 0);
    }
}
