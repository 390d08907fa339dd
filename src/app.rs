use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::config;
use crate::coordinator::{Coordinator, Outcome};
use crate::feed::SessionState;
use crate::model::{FeedDescriptor, Item};
use crate::notifications::Notification;
use crate::twitter;

pub const USAGE: &str = "birdfeed - follow a Twitter timeline from the terminal.

Usage:
  birdfeed [home]              Home timeline (streamed)
  birdfeed search <query>      Search results (streamed)
  birdfeed list <id> [name]    List timeline (polled)
  birdfeed notifications       Mentions, reposts, favorites and follows
  birdfeed lists               Show your lists and their ids
  birdfeed post <text>         Publish a status

Options:
  --version, -V        Show version and exit
  --help,    -h        Show this help message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Version,
    Help,
    Run(FeedDescriptor),
    Lists,
    Post(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("{0} requires {1}")]
    MissingArgument(&'static str, &'static str),
    #[error("unexpected argument {0:?}")]
    Unexpected(String),
}

pub fn parse_command<I, S>(args: I) -> Result<Command, UsageError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let args: Vec<String> = args.into_iter().map(Into::into).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        return Ok(Command::Help);
    }
    if args.iter().any(|a| a == "--version" || a == "-V") {
        return Ok(Command::Version);
    }

    let mut rest = args.into_iter();
    let descriptor = match rest.next().as_deref() {
        None | Some("home") => FeedDescriptor::Home,
        Some("notifications") => FeedDescriptor::Notifications,
        Some("lists") => {
            if let Some(extra) = rest.next() {
                return Err(UsageError::Unexpected(extra));
            }
            return Ok(Command::Lists);
        }
        Some("post") => {
            let text = rest.by_ref().collect::<Vec<_>>().join(" ");
            if text.trim().is_empty() {
                return Err(UsageError::MissingArgument("post", "status text"));
            }
            return Ok(Command::Post(text.trim().to_string()));
        }
        Some("search") => {
            let query = rest.by_ref().collect::<Vec<_>>().join(" ");
            if query.trim().is_empty() {
                return Err(UsageError::MissingArgument("search", "a query"));
            }
            return Ok(Command::Run(FeedDescriptor::search(query.trim())));
        }
        Some("list") => {
            let id = rest
                .next()
                .filter(|id| !id.trim().is_empty())
                .ok_or(UsageError::MissingArgument("list", "a list id"))?;
            let name = rest.by_ref().collect::<Vec<_>>().join(" ");
            return Ok(Command::Run(FeedDescriptor::list(id, name)));
        }
        Some(other) => return Err(UsageError::UnknownCommand(other.to_string())),
    };
    if let Some(extra) = rest.next() {
        return Err(UsageError::Unexpected(extra));
    }
    Ok(Command::Run(descriptor))
}

/// `RUST_LOG` wins over the configured filter. Logs go to stderr so they do
/// not interleave with the timeline on stdout.
pub fn init_logging(filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

/// Longest a one-shot request is waited for.
const REQUEST_DEADLINE: Duration = Duration::from_secs(60);

fn connect() -> Result<(config::Config, Coordinator)> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    init_logging(&cfg.log.filter);
    cfg.validate()?;

    let token = Arc::new(twitter::StaticToken::new(cfg.twitter.bearer_token.clone()));
    let client =
        twitter::Client::new(token, cfg.client_config()).context("create twitter client")?;
    let coordinator = Coordinator::new(Arc::new(client), cfg.coordinator_options());
    Ok((cfg, coordinator))
}

fn await_outcome(coordinator: &mut Coordinator, interval: Duration) -> Result<Outcome> {
    let deadline = Instant::now() + REQUEST_DEADLINE;
    loop {
        coordinator.pump();
        if let Some(outcome) = coordinator.take_outcomes().into_iter().next() {
            return Ok(outcome);
        }
        anyhow::ensure!(Instant::now() < deadline, "request timed out");
        thread::sleep(interval);
    }
}

pub fn lists() -> Result<()> {
    let (cfg, mut coordinator) = connect()?;
    coordinator.request_lists();
    let lists = match await_outcome(&mut coordinator, cfg.feeds.pump_interval)? {
        Outcome::Lists(result) => result.context("fetch lists")?,
        other => anyhow::bail!("unexpected reply {other:?}"),
    };
    let mut out = io::stdout().lock();
    if lists.is_empty() {
        writeln!(out, "no lists")?;
    }
    for list in &lists {
        writeln!(out, "{}\t{}\t{} members", list.id, list.name, list.member_count)?;
    }
    Ok(())
}

pub fn post(text: &str) -> Result<()> {
    let (cfg, mut coordinator) = connect()?;
    coordinator.post_status(text)?;
    let item = match await_outcome(&mut coordinator, cfg.feeds.pump_interval)? {
        Outcome::Posted(result) => result.context("post status")?,
        other => anyhow::bail!("unexpected reply {other:?}"),
    };
    println!("posted {}", item.id);
    Ok(())
}

pub fn run(descriptor: FeedDescriptor) -> Result<()> {
    let (cfg, mut coordinator) = connect()?;

    if cfg.notifications.enabled && !coordinator.start_notifications() {
        info!("set twitter.screen_name and twitter.user_id to receive notifications");
    }
    coordinator.switch_feed(descriptor);

    let stdout = io::stdout();
    let mut printer = Printer::new(stdout.lock());
    printer.header(coordinator.label())?;

    loop {
        if coordinator.pump() {
            printer.catch_up(coordinator.items(), coordinator.notifications())?;
            for outcome in coordinator.take_outcomes() {
                debug!(?outcome, "request finished");
            }
        }
        printer.status(
            coordinator
                .status()
                .or_else(|| coordinator.notifications_status()),
        )?;
        match coordinator.state() {
            Some(SessionState::Stopped) => {
                let status = coordinator.status().unwrap_or("feed stopped").to_string();
                coordinator.shutdown();
                anyhow::bail!("{}: {status}", coordinator.label());
            }
            Some(SessionState::Fetching) => {
                if let Some(status) = coordinator.status() {
                    anyhow::bail!("{}: {status}", coordinator.label());
                }
            }
            _ => {}
        }
        thread::sleep(cfg.feeds.pump_interval);
    }
}

/// Writes each item and notification once, in arrival order.
struct Printer<W: Write> {
    out: W,
    seen: HashSet<String>,
    notifications: usize,
    status: Option<String>,
}

impl<W: Write> Printer<W> {
    fn new(out: W) -> Self {
        Self {
            out,
            seen: HashSet::new(),
            notifications: 0,
            status: None,
        }
    }

    /// Print the status line whenever it changes to something new.
    fn status(&mut self, status: Option<&str>) -> io::Result<()> {
        if self.status.as_deref() == status {
            return Ok(());
        }
        self.status = status.map(str::to_string);
        if let Some(status) = status {
            writeln!(self.out, "! {status}")?;
            self.out.flush()?;
        }
        Ok(())
    }

    fn header(&mut self, label: &str) -> io::Result<()> {
        writeln!(self.out, "== {label} ==")?;
        self.out.flush()
    }

    fn catch_up(&mut self, items: &[Item], notifications: &[Notification]) -> io::Result<()> {
        for item in items {
            if self.seen.insert(item.id.clone()) {
                writeln!(self.out, "{}", format_item(item))?;
            }
        }
        if notifications.len() < self.notifications {
            debug!("notification list shrank; resyncing");
            self.notifications = notifications.len();
        }
        for note in &notifications[self.notifications..] {
            writeln!(self.out, "{}", format_notification(note))?;
        }
        self.notifications = notifications.len();
        self.out.flush()
    }
}

fn format_item(item: &Item) -> String {
    let stamp = item
        .created_at
        .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default();
    let body = match item.reposted.as_deref() {
        Some(original) => format!(
            "@{} reposted @{}: {}",
            item.author.screen_name, original.author.screen_name, original.text
        ),
        None => format!("@{}: {}", item.author.screen_name, item.text),
    };
    let engagement = item.target().engagement;
    format!(
        "{stamp} {body} [{} reposts, {} favorites]",
        engagement.repost_count, engagement.favorite_count
    )
    .trim_start()
    .to_string()
}

fn format_notification(note: &Notification) -> String {
    match note {
        Notification::Mention(item) => format!("* mention: {}", format_item(item)),
        Notification::Reposted { item, reposters } => {
            let names: Vec<String> = reposters
                .iter()
                .map(|author| format!("@{}", author.screen_name))
                .collect();
            format!("* reposted by {}: {}", names.join(", "), item.text)
        }
        Notification::Favorited { by, item } => {
            format!("* @{} favorited: {}", by.screen_name, item.text)
        }
        Notification::Followed { by } => format!("* @{} followed you", by.screen_name),
    }
}
