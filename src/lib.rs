#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod config;
pub mod coordinator;
pub mod feed;
pub mod model;
pub mod notifications;
pub mod timeline;
pub mod transport;
pub mod twitter;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
pub use coordinator::{Coordinator, Options, Outcome};
pub use model::{Action, FeedDescriptor, Item, ListSummary};
