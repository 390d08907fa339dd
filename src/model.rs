use std::fmt;

use chrono::{DateTime, Utc};

/// Which feed a session is showing. Fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FeedDescriptor {
    Home,
    Search { query: String },
    List { id: String, name: String },
    Notifications,
}

impl FeedDescriptor {
    pub fn search(query: impl Into<String>) -> Self {
        FeedDescriptor::Search {
            query: query.into(),
        }
    }

    pub fn list(id: impl Into<String>, name: impl Into<String>) -> Self {
        FeedDescriptor::List {
            id: id.into(),
            name: name.into(),
        }
    }

    pub fn label(&self) -> String {
        match self {
            FeedDescriptor::Home => "HOME".to_string(),
            FeedDescriptor::Search { query } => format!("Search: {query}"),
            FeedDescriptor::List { id, name } => {
                if name.trim().is_empty() {
                    format!("List {id}")
                } else {
                    name.clone()
                }
            }
            FeedDescriptor::Notifications => "Notifications".to_string(),
        }
    }

    /// Stream used once the bulk fetch lands, if the feed is stream-backed.
    pub fn stream_scope(&self) -> Option<StreamScope> {
        match self {
            FeedDescriptor::Home => Some(StreamScope::User { replies_all: false }),
            FeedDescriptor::Search { query } => Some(StreamScope::Filter {
                track: query.clone(),
            }),
            FeedDescriptor::List { .. } | FeedDescriptor::Notifications => None,
        }
    }
}

impl fmt::Display for FeedDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamScope {
    /// The viewer's own stream. `replies_all` widens it to every reply.
    User { replies_all: bool },
    /// Public statuses matching a keyword.
    Filter { track: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Author {
    pub id: String,
    pub screen_name: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Engagement {
    pub repost_count: u64,
    pub favorite_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub followed: bool,
    pub reposted: bool,
    pub favorited: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: String,
    /// Numeric ordering key; newer items always compare greater.
    pub key: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub author: Author,
    pub text: String,
    /// The original when this item is a repost. Never nested further.
    pub reposted: Option<Box<Item>>,
    pub engagement: Engagement,
    pub flags: Flags,
}

impl Item {
    pub fn new(id: impl Into<String>, key: u64) -> Self {
        Self {
            id: id.into(),
            key,
            created_at: None,
            author: Author::default(),
            text: String::new(),
            reposted: None,
            engagement: Engagement::default(),
            flags: Flags::default(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_author(mut self, author: Author) -> Self {
        self.author = author;
        self
    }

    pub fn with_engagement(mut self, repost_count: u64, favorite_count: u64) -> Self {
        self.engagement = Engagement {
            repost_count,
            favorite_count,
        };
        self
    }

    pub fn reposting(mut self, mut original: Item) -> Self {
        original.reposted = None;
        self.reposted = Some(Box::new(original));
        self
    }

    /// The item engagement actions land on: the original for reposts.
    pub fn target(&self) -> &Item {
        self.reposted.as_deref().unwrap_or(self)
    }

    pub fn cursor(&self) -> Cursor {
        Cursor {
            id: self.id.clone(),
            key: self.key,
        }
    }

    /// Copy the fields that change after publication. Identity, text and
    /// position are left alone.
    pub(crate) fn refresh_from(&mut self, newer: &Item) {
        self.engagement = newer.engagement;
        self.flags = newer.flags;
        if let (Some(mine), Some(theirs)) = (self.reposted.as_mut(), newer.reposted.as_ref()) {
            if mine.id == theirs.id {
                mine.engagement = theirs.engagement;
                mine.flags = theirs.flags;
            }
        }
    }
}

/// One of the viewer's lists, as offered when picking a list feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListSummary {
    pub id: String,
    pub name: String,
    pub member_count: u64,
}

impl ListSummary {
    pub fn descriptor(&self) -> FeedDescriptor {
        FeedDescriptor::list(self.id.clone(), self.name.clone())
    }
}

/// Lower bound for incremental fetches: the newest item merged so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub id: String,
    pub key: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Follow,
    Unfollow,
    Repost,
    Unrepost,
    Favorite,
    Unfavorite,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Follow => "follow",
            Action::Unfollow => "unfollow",
            Action::Repost => "repost",
            Action::Unrepost => "unrepost",
            Action::Favorite => "favorite",
            Action::Unfavorite => "unfavorite",
        }
    }

    pub(crate) fn apply_to(self, item: &mut Item) {
        let counters = &mut item.engagement;
        let flags = &mut item.flags;
        match self {
            Action::Follow => flags.followed = true,
            Action::Unfollow => flags.followed = false,
            Action::Repost => {
                counters.repost_count += 1;
                flags.reposted = true;
            }
            Action::Unrepost => {
                counters.repost_count = counters.repost_count.saturating_sub(1);
                flags.reposted = false;
            }
            Action::Favorite => {
                counters.favorite_count += 1;
                flags.favorited = true;
            }
            Action::Unfavorite => {
                counters.favorite_count = counters.favorite_count.saturating_sub(1);
                flags.favorited = false;
            }
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_follow_descriptor() {
        assert_eq!(FeedDescriptor::Home.label(), "HOME");
        assert_eq!(FeedDescriptor::search("cats").label(), "Search: cats");
        assert_eq!(FeedDescriptor::list("7", "rustaceans").label(), "rustaceans");
        assert_eq!(FeedDescriptor::list("7", " ").label(), "List 7");
        assert_eq!(FeedDescriptor::Notifications.label(), "Notifications");
    }

    #[test]
    fn only_home_and_search_stream() {
        assert_eq!(
            FeedDescriptor::search("x").stream_scope(),
            Some(StreamScope::Filter { track: "x".into() })
        );
        assert!(FeedDescriptor::list("1", "l").stream_scope().is_none());
        assert!(FeedDescriptor::Notifications.stream_scope().is_none());
    }

    #[test]
    fn repost_flattens_to_one_level() {
        let inner = Item::new("a", 1).reposting(Item::new("z", 0));
        let wrapper = Item::new("b", 2).reposting(inner);
        let original = wrapper.reposted.as_deref().unwrap();
        assert_eq!(original.id, "a");
        assert!(original.reposted.is_none());
        assert_eq!(wrapper.target().id, "a");
    }

    #[test]
    fn undo_actions_never_underflow() {
        let mut item = Item::new("a", 1);
        Action::Unrepost.apply_to(&mut item);
        Action::Unfavorite.apply_to(&mut item);
        assert_eq!(item.engagement, Engagement::default());
        Action::Favorite.apply_to(&mut item);
        assert_eq!(item.engagement.favorite_count, 1);
        assert!(item.flags.favorited);
    }
}
