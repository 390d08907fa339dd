use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

use crate::model::{Action, Author, Cursor, FeedDescriptor, Item, ListSummary, StreamScope};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("api error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("config: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchParams {
    pub count: u32,
}

impl FetchParams {
    pub fn count(count: u32) -> Self {
        Self { count }
    }
}

/// Everything the feed core needs from the platform. Calls block; the
/// coordinator runs them off its own thread.
pub trait Transport: Send + Sync {
    fn fetch_bulk(
        &self,
        feed: &FeedDescriptor,
        params: FetchParams,
    ) -> Result<Vec<Item>, TransportError>;

    /// Items strictly newer than `since`. Without a cursor the newest page.
    fn fetch_incremental(
        &self,
        feed: &FeedDescriptor,
        since: Option<&Cursor>,
        params: FetchParams,
    ) -> Result<Vec<Item>, TransportError>;

    fn open_stream(&self, scope: &StreamScope) -> Result<StreamHandle, TransportError>;

    fn mutate(&self, action: Action, target: &Item) -> Result<(), TransportError>;

    fn fetch_reposts_of_viewer(
        &self,
        since: Option<&Cursor>,
        params: FetchParams,
    ) -> Result<Vec<Item>, TransportError>;

    /// Reposting statuses of `item_id`; their authors are the reposters.
    fn fetch_reposters(
        &self,
        item_id: &str,
        params: FetchParams,
    ) -> Result<Vec<Item>, TransportError>;

    /// Publish a status as the viewer and return it as the platform stored it.
    fn post_status(&self, text: &str) -> Result<Item, TransportError>;

    /// Lists owned or followed by `owner_id`, or by the token's account.
    fn fetch_lists(&self, owner_id: Option<&str>) -> Result<Vec<ListSummary>, TransportError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Activity {
    Favorite { source: Author, target: Item },
    Follow { source: Author, target: Author },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Item(Item),
    Activity(Activity),
    Error(String),
    /// The producer went away. Reported once.
    Closed,
}

/// Producer side of a push stream, held by whatever reads the wire.
#[derive(Debug, Clone)]
pub struct StreamSender {
    tx: Sender<StreamEvent>,
    stop: Arc<AtomicBool>,
}

impl StreamSender {
    /// False once the consumer stopped the stream; producers should exit.
    pub fn send(&self, event: StreamEvent) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.tx.send(event).is_ok()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Consumer side of a push stream. Owned by exactly one session; stopping or
/// dropping it disconnects the channel so nothing more is delivered.
#[derive(Debug)]
pub struct StreamHandle {
    events: Receiver<StreamEvent>,
    stop: Arc<AtomicBool>,
    closed: bool,
}

impl StreamHandle {
    pub fn channel() -> (StreamSender, StreamHandle) {
        let (tx, rx) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let sender = StreamSender {
            tx,
            stop: stop.clone(),
        };
        let handle = StreamHandle {
            events: rx,
            stop,
            closed: false,
        };
        (sender, handle)
    }

    pub fn try_next(&mut self) -> Option<StreamEvent> {
        if self.closed {
            return None;
        }
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.closed = true;
                Some(StreamEvent::Closed)
            }
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.closed = true;
        // swap in a receiver that never yields so the old one drops now
        self.events = crossbeam_channel::never();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
