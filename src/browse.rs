//! Navigation state for the remote music catalog
//!
//! The device's catalog is stateless and paginated: every listing is a
//! `browse/browse` response for one `(sid, cid, range)` triple. The
//! [`BrowseCache`] remembers, per listing command, the name, image and
//! parent command it was reached from, which is enough to offer "root",
//! "back", "previous" and "next" entries in every [`BrowseView`].

use crate::protocol::{
    AddCriteria, BrowsePage, BrowseParams, Command, PlayAction, VOLATILE_PARAMS,
};
use crate::types::{sources, BrowseItem, SourceInfo};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Breadcrumb for a listing command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrowseCacheEntry {
    pub name: String,
    pub image_url: String,
    /// Normalized command of the listing this one was reached from
    pub parent: Option<String>,
}

/// Breadcrumbs keyed by range-insensitive listing command
#[derive(Debug, Default)]
pub struct BrowseCache {
    entries: HashMap<String, BrowseCacheEntry>,
}

impl BrowseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strip `range`, `count` and `returned` from a command string
    pub fn normalize(command: &str) -> String {
        match Command::parse(command) {
            Ok(parsed) => parsed.without(&VOLATILE_PARAMS).to_string(),
            Err(_) => command.trim().to_string(),
        }
    }

    /// Look up or record the breadcrumb for `command`
    ///
    /// The first entry recorded for a key wins. Entries without a name are
    /// returned but not stored.
    pub fn map(
        &mut self,
        command: &str,
        name: &str,
        image_url: &str,
        parent: Option<&str>,
    ) -> BrowseCacheEntry {
        let key = Self::normalize(command);
        if let Some(existing) = self.entries.get(&key) {
            return existing.clone();
        }

        let entry = BrowseCacheEntry {
            name: name.to_string(),
            image_url: image_url.to_string(),
            parent: parent.map(Self::normalize),
        };
        if !name.is_empty() {
            self.entries.insert(key, entry.clone());
        }
        entry
    }

    pub fn get(&self, command: &str) -> Option<&BrowseCacheEntry> {
        self.entries.get(&Self::normalize(command))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Role of an entry in a browse view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Root,
    Back,
    Previous,
    Next,
    Source,
    Container,
    Media,
}

/// One line of a browse view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrowseEntry {
    pub name: String,
    pub image_url: String,
    pub kind: EntryKind,
    /// Listing to open when the entry is selected
    pub browse: Option<String>,
    /// What to play when the entry is played
    pub play: Option<PlayAction>,
}

impl BrowseEntry {
    fn control(kind: EntryKind, name: &str, browse: String) -> Self {
        Self {
            name: name.to_string(),
            image_url: String::new(),
            kind,
            browse: Some(browse),
            play: None,
        }
    }
}

/// A rendered listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrowseView {
    /// Normalized command of this listing
    pub command: String,
    pub name: String,
    pub image_url: String,
    pub start: u32,
    pub returned: u32,
    pub count: u32,
    pub entries: Vec<BrowseEntry>,
}

/// Command that lists the catalog root
pub fn root_command() -> String {
    Command::get_music_sources().to_string()
}

/// Build the root view from the music source list
pub fn root_view(cache: &mut BrowseCache, sources: &[SourceInfo]) -> BrowseView {
    let root = root_command();
    let entries: Vec<BrowseEntry> = sources
        .iter()
        .filter(|s| s.is_available())
        .map(|source| {
            let browse = Command::browse(&BrowseParams::source(source.sid)).to_string();
            cache.map(&browse, &source.name, &source.image_url, Some(&root));
            BrowseEntry {
                name: source.name.clone(),
                image_url: source.image_url.clone(),
                kind: EntryKind::Source,
                browse: Some(browse),
                play: None,
            }
        })
        .collect();

    let count = entries.len() as u32;
    BrowseView {
        command: root,
        name: "root".to_string(),
        image_url: String::new(),
        start: 0,
        returned: count,
        count,
        entries,
    }
}

/// Build the view for one page of a listing
pub fn page_view(cache: &mut BrowseCache, page: &BrowsePage, page_size: u32) -> BrowseView {
    let page_size = page_size.max(1);
    let current = Command::browse(&page.params()).to_string();
    let crumb = cache.get(&current).cloned();

    let mut entries = vec![BrowseEntry::control(EntryKind::Root, "root", root_command())];

    if let Some(parent) = crumb.as_ref().and_then(|c| c.parent.clone()) {
        entries.push(BrowseEntry::control(EntryKind::Back, "back", parent));
    }

    if page.start > 0 {
        let start = page.start.saturating_sub(page_size);
        let params = page.params().with_range(start, page.start - 1);
        entries.push(BrowseEntry::control(
            EntryKind::Previous,
            "previous",
            Command::browse(&params).to_string(),
        ));
    }

    let next_start = page.start.saturating_add(page.returned);
    if page.returned > 0 && next_start < page.count {
        let next_end = next_start.saturating_add(page_size - 1);
        let params = page.params().with_range(next_start, next_end);
        entries.push(BrowseEntry::control(
            EntryKind::Next,
            "next",
            Command::browse(&params).to_string(),
        ));
    }

    for (i, item) in page.items.iter().enumerate() {
        let entry = match page.sid {
            sources::FAVORITES => preset_entry(item, page.start.saturating_add(i as u32).saturating_add(1)),
            _ => item_entry(page, item),
        };
        if let Some(browse) = &entry.browse {
            cache.map(browse, &entry.name, &entry.image_url, Some(&current));
        }
        entries.push(entry);
    }

    let (name, image_url) = crumb
        .map(|c| (c.name, c.image_url))
        .unwrap_or_default();

    BrowseView {
        command: current,
        name,
        image_url,
        start: page.start,
        returned: page.returned,
        count: page.count,
        entries,
    }
}

fn preset_entry(item: &BrowseItem, preset: u32) -> BrowseEntry {
    BrowseEntry {
        name: item.name.clone(),
        image_url: item.image_url.clone(),
        kind: EntryKind::Media,
        browse: None,
        play: Some(PlayAction::Preset { preset }),
    }
}

fn item_entry(page: &BrowsePage, item: &BrowseItem) -> BrowseEntry {
    let mut entry = BrowseEntry {
        name: item.name.clone(),
        image_url: item.image_url.clone(),
        kind: EntryKind::Media,
        browse: None,
        play: None,
    };

    // Services nested in a source group carry their own sid
    if let (Some(sid), None) = (item.sid, &item.cid) {
        entry.kind = EntryKind::Source;
        entry.browse = Some(Command::browse(&BrowseParams::source(sid)).to_string());
        return entry;
    }

    if item.is_container() {
        if let Some(cid) = &item.cid {
            entry.kind = EntryKind::Container;
            entry.browse = Some(Command::browse(&BrowseParams::container(page.sid, cid)).to_string());
            if item.is_playable() {
                let criteria = if page.sid == sources::PLAYLISTS {
                    AddCriteria::ReplaceAndPlay
                } else {
                    AddCriteria::PlayNow
                };
                entry.play = Some(PlayAction::Queue {
                    sid: page.sid,
                    cid: cid.clone(),
                    mid: None,
                    criteria,
                });
            }
        }
        return entry;
    }

    if let (true, Some(mid)) = (item.is_playable(), &item.mid) {
        entry.play = Some(if mid.starts_with("inputs/") {
            PlayAction::Input { input: mid.clone() }
        } else if item.item_type == "station" {
            PlayAction::Stream {
                sid: page.sid,
                cid: page.cid.clone(),
                mid: mid.clone(),
                name: item.name.clone(),
            }
        } else if let Some(cid) = &page.cid {
            PlayAction::Queue {
                sid: page.sid,
                cid: cid.clone(),
                mid: Some(mid.clone()),
                criteria: AddCriteria::PlayNow,
            }
        } else {
            PlayAction::Stream {
                sid: page.sid,
                cid: None,
                mid: mid.clone(),
                name: item.name.clone(),
            }
        });
    }
    entry
}

/// Listings whose items are mirrored into persisted per-item state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VirtualCatalog {
    Playlists,
    Presets,
}

impl VirtualCatalog {
    pub fn of(page: &BrowsePage) -> Option<Self> {
        match (page.sid, &page.cid) {
            (sources::PLAYLISTS, None) => Some(VirtualCatalog::Playlists),
            (sources::FAVORITES, None) => Some(VirtualCatalog::Presets),
            _ => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            VirtualCatalog::Playlists => crate::store::ids::PLAYLISTS,
            VirtualCatalog::Presets => crate::store::ids::PRESETS,
        }
    }

    /// Per-item state to persist, keyed by playlist cid or preset number
    pub fn items(&self, view: &BrowseView) -> Vec<(String, Value)> {
        view.entries
            .iter()
            .filter_map(|entry| {
                let key = match (self, entry.play.as_ref()?) {
                    (VirtualCatalog::Presets, PlayAction::Preset { preset }) => preset.to_string(),
                    (VirtualCatalog::Playlists, PlayAction::Queue { cid, .. }) => cid.clone(),
                    _ => return None,
                };
                let value = json!({
                    "name": entry.name,
                    "image_url": entry.image_url,
                    "play": entry.play,
                });
                Some((key, value))
            })
            .collect()
    }
}
