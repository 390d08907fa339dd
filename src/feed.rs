use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::model::{Action, Cursor, FeedDescriptor, Item};
use crate::timeline::{Merged, Timeline};
use crate::transport::{FetchParams, StreamEvent, StreamHandle, Transport, TransportError};

pub const RECONNECT_HINT: &str = "stream closed; reselect the feed to reconnect";

/// Request sizes and cadence for feed sessions.
#[derive(Debug, Clone)]
pub struct Settings {
    pub home_count: u32,
    pub search_count: u32,
    pub list_count: u32,
    pub mentions_count: u32,
    pub list_poll_count: u32,
    pub list_poll_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            home_count: 20,
            search_count: 100,
            list_count: 500,
            mentions_count: 20,
            list_poll_count: 10,
            list_poll_interval: Duration::from_secs(10),
        }
    }
}

impl Settings {
    pub fn bulk_params(&self, feed: &FeedDescriptor) -> FetchParams {
        let count = match feed {
            FeedDescriptor::Home => self.home_count,
            FeedDescriptor::Search { .. } => self.search_count,
            FeedDescriptor::List { .. } => self.list_count,
            FeedDescriptor::Notifications => self.mentions_count,
        };
        FetchParams::count(count)
    }

    pub fn poll_params(&self) -> FetchParams {
        FetchParams::count(self.list_poll_count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Fetching,
    Streaming,
    Polling,
    /// Notifications feed: live entries come from the watcher.
    Watching,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("failed to load {feed}: {source}")]
    Fetch {
        feed: String,
        #[source]
        source: TransportError,
    },
    #[error("failed to open stream for {feed}: {source}")]
    Stream {
        feed: String,
        #[source]
        source: TransportError,
    },
    #[error("stale result from generation {got}, active is {active}")]
    StaleResult { active: u64, got: u64 },
    #[error("bulk result arrived while session was {0:?}")]
    NotFetching(SessionState),
}

pub(crate) fn check_generation(active: u64, got: u64) -> Result<(), FeedError> {
    if active == got {
        Ok(())
    } else {
        Err(FeedError::StaleResult { active, got })
    }
}

/// Recurring tick source. At most one request rides on it at a time.
#[derive(Debug)]
pub struct PollTimer {
    ticks: Receiver<Instant>,
    in_flight: bool,
}

impl PollTimer {
    pub fn start(interval: Duration) -> Self {
        Self {
            ticks: crossbeam_channel::tick(interval),
            in_flight: false,
        }
    }

    /// True when a tick fired and nothing is outstanding. Marks the request
    /// as in flight. Ticks that pile up behind a slow request collapse.
    pub(crate) fn take_due(&mut self) -> bool {
        let mut fired = false;
        while self.ticks.try_recv().is_ok() {
            fired = true;
        }
        if !fired || self.in_flight {
            return false;
        }
        self.in_flight = true;
        true
    }

    /// Mark a request as in flight without waiting for a tick.
    pub(crate) fn begin(&mut self) {
        self.in_flight = true;
    }

    pub(crate) fn settle(&mut self) {
        self.in_flight = false;
    }

    /// Stop ticking. Nothing becomes due after this.
    pub fn clear(&mut self) {
        self.ticks = crossbeam_channel::never();
        self.in_flight = false;
    }
}

#[derive(Debug)]
pub enum UpdateMechanism {
    Stream(StreamHandle),
    Timer(PollTimer),
}

impl UpdateMechanism {
    pub fn release(self) {
        match self {
            UpdateMechanism::Stream(mut handle) => handle.stop(),
            UpdateMechanism::Timer(mut timer) => timer.clear(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollRequest {
    pub feed: FeedDescriptor,
    pub since: Option<Cursor>,
}

/// One feed from bulk fetch to teardown.
#[derive(Debug)]
pub struct FeedSession {
    generation: u64,
    descriptor: FeedDescriptor,
    timeline: Timeline,
    cursor: Option<Cursor>,
    state: SessionState,
    mechanism: Option<UpdateMechanism>,
    error: Option<String>,
    /// Most recent stream error since the last delivered item.
    stream_error: Option<String>,
}

impl FeedSession {
    pub fn new(generation: u64, descriptor: FeedDescriptor) -> Self {
        Self {
            generation,
            descriptor,
            timeline: Timeline::new(),
            cursor: None,
            state: SessionState::Fetching,
            mechanism: None,
            error: None,
            stream_error: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn descriptor(&self) -> &FeedDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn items(&self) -> &[Item] {
        self.timeline.items()
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn has_mechanism(&self) -> bool {
        self.mechanism.is_some()
    }

    /// Land the bulk fetch and move on to the incremental phase. A failed
    /// fetch leaves the session in `Fetching`.
    pub fn complete_fetch(
        &mut self,
        result: Result<Vec<Item>, TransportError>,
        transport: &dyn Transport,
        settings: &Settings,
    ) -> Result<usize, FeedError> {
        if self.state != SessionState::Fetching {
            return Err(FeedError::NotFetching(self.state));
        }
        let items = match result {
            Ok(items) => items,
            Err(source) => {
                let err = FeedError::Fetch {
                    feed: self.descriptor.label(),
                    source,
                };
                self.error = Some(err.to_string());
                return Err(err);
            }
        };
        self.error = None;
        let merged = self.timeline.merge_batch(items);
        self.advance_cursor();
        info!(
            generation = self.generation,
            feed = %self.descriptor,
            merged,
            "bulk fetch landed"
        );

        if let Some(scope) = self.descriptor.stream_scope() {
            match transport.open_stream(&scope) {
                Ok(handle) => {
                    self.mechanism = Some(UpdateMechanism::Stream(handle));
                    self.state = SessionState::Streaming;
                }
                Err(source) => {
                    let err = FeedError::Stream {
                        feed: self.descriptor.label(),
                        source,
                    };
                    self.error = Some(err.to_string());
                    self.state = SessionState::Stopped;
                    return Err(err);
                }
            }
        } else if matches!(self.descriptor, FeedDescriptor::List { .. }) {
            self.mechanism = Some(UpdateMechanism::Timer(PollTimer::start(
                settings.list_poll_interval,
            )));
            self.state = SessionState::Polling;
        } else {
            self.state = SessionState::Watching;
        }
        Ok(merged)
    }

    /// Drain pending stream events. Returns whether anything visible changed.
    pub fn drain_stream(&mut self) -> bool {
        let mut changed = false;
        loop {
            let Some(UpdateMechanism::Stream(handle)) = self.mechanism.as_mut() else {
                return changed;
            };
            let Some(event) = handle.try_next() else {
                return changed;
            };
            match event {
                StreamEvent::Item(item) => {
                    self.timeline.merge_one(item);
                    self.advance_cursor();
                    self.stream_error = None;
                    changed = true;
                }
                StreamEvent::Activity(_) => {}
                StreamEvent::Error(message) => {
                    warn!(feed = %self.descriptor, error = %message, "stream error");
                    self.stream_error = Some(message);
                }
                StreamEvent::Closed => {
                    warn!(feed = %self.descriptor, "stream closed");
                    self.release_mechanism();
                    self.state = SessionState::Stopped;
                    self.error = Some(closed_status(RECONNECT_HINT, self.stream_error.take()));
                    return true;
                }
            }
        }
    }

    /// Claim the next poll if the timer says one is due.
    pub fn poll_due(&mut self) -> Option<PollRequest> {
        let Some(UpdateMechanism::Timer(timer)) = self.mechanism.as_mut() else {
            return None;
        };
        if !timer.take_due() {
            return None;
        }
        Some(PollRequest {
            feed: self.descriptor.clone(),
            since: self.cursor.clone(),
        })
    }

    /// Land a poll. Failures are skipped; the next tick tries again.
    pub fn complete_poll(&mut self, result: Result<Vec<Item>, TransportError>) -> bool {
        let Some(UpdateMechanism::Timer(timer)) = self.mechanism.as_mut() else {
            return false;
        };
        timer.settle();
        match result {
            Ok(items) if items.is_empty() => false,
            Ok(items) => {
                let merged = self.timeline.merge_batch(items);
                self.advance_cursor();
                debug!(feed = %self.descriptor, merged, "poll merged");
                true
            }
            Err(err) => {
                debug!(feed = %self.descriptor, error = %err, "poll failed, waiting for next tick");
                false
            }
        }
    }

    /// Merge an item that arrived through someone else's stream, such as a
    /// live mention while this session shows notifications.
    pub fn merge_live(&mut self, item: Item) -> Merged {
        let outcome = self.timeline.merge_one(item);
        self.advance_cursor();
        outcome
    }

    pub(crate) fn apply_confirmed(&mut self, action: Action, id: &str) -> bool {
        self.timeline.apply(action, id)
    }

    /// Release the update mechanism and stop for good. Safe in any state.
    pub fn teardown(&mut self) {
        self.release_mechanism();
        if self.state != SessionState::Stopped {
            debug!(generation = self.generation, feed = %self.descriptor, "session stopped");
        }
        self.state = SessionState::Stopped;
    }

    fn release_mechanism(&mut self) {
        if let Some(mechanism) = self.mechanism.take() {
            mechanism.release();
        }
    }

    fn advance_cursor(&mut self) {
        let Some(newest) = self.timeline.cursor() else {
            return;
        };
        let newer = self
            .cursor
            .as_ref()
            .map_or(true, |current| newest.key > current.key);
        if newer {
            self.cursor = Some(newest);
        }
    }
}

/// Status for a stream that went away, led by its last error when known.
pub(crate) fn closed_status(hint: &str, last_error: Option<String>) -> String {
    match last_error {
        Some(cause) => format!("{cause}; {hint}"),
        None => hint.to_string(),
    }
}

impl Drop for FeedSession {
    fn drop(&mut self) {
        self.release_mechanism();
    }
}
