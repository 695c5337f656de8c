use crate::sched::cursor::write_atomically;
use crate::sched::floor::Batch;
use crate::sched::paths::{SchedPaths, conversation_file_stem};
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const BINDINGS_FILE: &str = "bindings.json";
const STORE_LOCK_FILE: &str = ".store.lock";
const BOOK_EXTENSION: &str = "jsonl";
const DEFAULT_BOOK_SUFFIX: &str = "-summary";
const SUMMARY_BOOK_HINTS: [&str; 4] = ["summary", "summaries", "总结", "摘要"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub uid: String,
    /// Free-text description; carries the `#start-end` floor marker.
    pub comment: String,
    #[serde(default)]
    pub keys: Vec<String>,
    pub content: String,
    #[serde(default)]
    pub created_at: String,
}

impl ArtifactEntry {
    pub fn for_batch(conversation: &str, batch: Batch, summary: &str) -> Self {
        Self {
            uid: entry_uid(conversation, batch),
            comment: format!("Summary floors {}", batch.marker()),
            keys: vec![format!("floors {}", batch.display_range())],
            content: summary.trim().to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Stable id so re-writing the same range replaces rather than duplicates.
pub fn entry_uid(conversation: &str, batch: Batch) -> String {
    let mut hasher = Sha256::new();
    hasher.update(conversation.as_bytes());
    hasher.update(format!(":{}:{}", batch.start, batch.end).as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// External, eventually consistent record of produced summaries.
pub trait ArtifactStore: Send + Sync {
    fn bound_book(&self, conversation: &str) -> Result<Option<String>>;
    /// Pick and persist a plausible book for an unbound conversation.
    fn auto_bind(&self, conversation: &str) -> Result<Option<String>>;
    fn entries(&self, book: &str) -> Result<Vec<ArtifactEntry>>;
    /// Insert or replace by uid; returns the book written to.
    fn upsert(&self, conversation: &str, entry: ArtifactEntry) -> Result<String>;
}

/// Entries visible to `conversation`, or `None` when no book is (or can be) bound.
pub fn resolve_entries(
    store: &dyn ArtifactStore,
    conversation: &str,
    auto_bind: bool,
) -> Result<Option<(String, Vec<ArtifactEntry>)>> {
    let book = match store.bound_book(conversation)? {
        Some(book) => Some(book),
        None if auto_bind => store.auto_bind(conversation)?,
        None => None,
    };
    let Some(book) = book else {
        return Ok(None);
    };
    let entries = store.entries(&book)?;
    Ok(Some((book, entries)))
}

/// Book floorsum creates when it writes for an unbound conversation.
pub fn default_book_name(conversation: &str) -> String {
    format!("{}{DEFAULT_BOOK_SUFFIX}", conversation_file_stem(conversation))
}

/// `needle` occurs in `haystack` with no letter or digit directly on either side,
/// so `c1` matches `c1-notes` but not `c10-summary`.
fn contains_token(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.match_indices(needle).any(|(idx, _)| {
        let before = haystack[..idx].chars().next_back();
        let after = haystack[idx + needle.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

/// Score a book name as a summary target for `conversation`; 0 means unusable.
pub fn bind_score(book: &str, conversation: &str) -> u8 {
    let book_lower = book.to_lowercase();
    let stem = conversation_file_stem(conversation).to_lowercase();
    if book_lower == stem {
        return 3;
    }
    if contains_token(&book_lower, &stem) {
        return 2;
    }
    if SUMMARY_BOOK_HINTS
        .iter()
        .any(|hint| book_lower.contains(hint))
    {
        return 1;
    }
    0
}

/// Best-scoring book for `conversation`, ignoring `excluded` (books that
/// belong to other conversations).
pub fn pick_bind_candidate(
    books: &[String],
    conversation: &str,
    excluded: &BTreeSet<String>,
) -> Option<String> {
    let mut best: Option<(u8, &String)> = None;
    for book in books {
        if excluded.contains(&book.to_lowercase()) {
            continue;
        }
        let score = bind_score(book, conversation);
        if score == 0 {
            continue;
        }
        match best {
            Some((best_score, best_book))
                if best_score > score || (best_score == score && best_book <= book) => {}
            _ => best = Some((score, book)),
        }
    }
    best.map(|(_, book)| book.clone())
}

/// Held while the bindings file or a book is read-modify-written. The mutex
/// serializes threads, the file lock serializes processes.
struct StoreGuard<'a> {
    _local: MutexGuard<'a, ()>,
    _file: File,
}

#[derive(Debug)]
pub struct FileArtifactStore {
    dir: PathBuf,
    conversations_dir: PathBuf,
    lock: Mutex<()>,
}

impl FileArtifactStore {
    pub fn new(paths: &SchedPaths) -> Self {
        Self {
            dir: paths.artifacts_dir.clone(),
            conversations_dir: paths.conversations_dir.clone(),
            lock: Mutex::new(()),
        }
    }

    pub fn book_path(&self, book: &str) -> PathBuf {
        self.dir.join(format!("{book}.{BOOK_EXTENSION}"))
    }

    fn bindings_path(&self) -> PathBuf {
        self.dir.join(BINDINGS_FILE)
    }

    fn read_bindings(&self) -> Result<BTreeMap<String, String>> {
        let path = self.bindings_path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn write_binding(&self, conversation: &str, book: &str) -> Result<()> {
        let mut bindings = self.read_bindings()?;
        bindings.insert(conversation.to_string(), book.to_string());
        let data = serde_json::to_string_pretty(&bindings)?;
        write_atomically(&self.bindings_path(), &format!("{data}\n"))
    }

    pub fn list_books(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BOOK_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                out.push(stem.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Lowercased names of books other conversations own: their explicit
    /// bindings, and the default book of every conversation with a transcript.
    fn books_owned_elsewhere(
        &self,
        conversation: &str,
        bindings: &BTreeMap<String, String>,
    ) -> Result<BTreeSet<String>> {
        let mut owned: BTreeSet<String> = bindings
            .iter()
            .filter(|(owner, _)| owner.as_str() != conversation)
            .map(|(_, book)| book.to_lowercase())
            .collect();

        let own_default = default_book_name(conversation).to_lowercase();
        if self.conversations_dir.exists() {
            for entry in fs::read_dir(&self.conversations_dir).with_context(|| {
                format!("failed to list {}", self.conversations_dir.display())
            })? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let book = format!("{stem}{DEFAULT_BOOK_SUFFIX}").to_lowercase();
                if book != own_default {
                    owned.insert(book);
                }
            }
        }
        Ok(owned)
    }

    fn guard(&self) -> Result<StoreGuard<'_>> {
        let local = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("artifact store lock poisoned"))?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.dir.join(STORE_LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", path.display()))?;
        Ok(StoreGuard {
            _local: local,
            _file: file,
        })
    }
}

fn read_book(path: &Path) -> Result<Vec<ArtifactEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut out = Vec::new();
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let entry: ArtifactEntry = serde_json::from_str(trimmed)
            .with_context(|| format!("failed to parse artifact line in {}", path.display()))?;
        out.push(entry);
    }
    Ok(out)
}

impl ArtifactStore for FileArtifactStore {
    fn bound_book(&self, conversation: &str) -> Result<Option<String>> {
        let _guard = self.guard()?;
        Ok(self.read_bindings()?.get(conversation).cloned())
    }

    fn auto_bind(&self, conversation: &str) -> Result<Option<String>> {
        let _guard = self.guard()?;
        let bindings = self.read_bindings()?;
        if let Some(book) = bindings.get(conversation) {
            return Ok(Some(book.clone()));
        }
        let excluded = self.books_owned_elsewhere(conversation, &bindings)?;
        let Some(book) = pick_bind_candidate(&self.list_books()?, conversation, &excluded) else {
            return Ok(None);
        };
        self.write_binding(conversation, &book)?;
        Ok(Some(book))
    }

    fn entries(&self, book: &str) -> Result<Vec<ArtifactEntry>> {
        let _guard = self.guard()?;
        read_book(&self.book_path(book))
    }

    fn upsert(&self, conversation: &str, entry: ArtifactEntry) -> Result<String> {
        let _guard = self.guard()?;
        let book = match self.read_bindings()?.get(conversation).cloned() {
            Some(book) => book,
            None => {
                let book = default_book_name(conversation);
                self.write_binding(conversation, &book)?;
                book
            }
        };

        let path = self.book_path(&book);
        let mut entries = read_book(&path)?;
        match entries.iter_mut().find(|existing| existing.uid == entry.uid) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }

        let mut out = String::new();
        for entry in &entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        write_atomically(&path, &out)?;
        Ok(book)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_heuristic_prefers_conversation_named_books() {
        let books = vec![
            "global-summaries".to_string(),
            "lore".to_string(),
            "alice-chat-notes".to_string(),
            "alice-chat".to_string(),
        ];
        let none = BTreeSet::new();
        assert_eq!(
            pick_bind_candidate(&books, "alice-chat", &none).as_deref(),
            Some("alice-chat")
        );
        assert_eq!(
            pick_bind_candidate(&books, "bob", &none).as_deref(),
            Some("global-summaries")
        );
        assert_eq!(pick_bind_candidate(&["lore".to_string()], "bob", &none), None);
    }

    #[test]
    fn bind_heuristic_breaks_ties_lexicographically() {
        let books = vec!["剧情总结".to_string(), "a-summary".to_string()];
        assert_eq!(
            pick_bind_candidate(&books, "bob", &BTreeSet::new()).as_deref(),
            Some("a-summary")
        );
    }

    #[test]
    fn name_match_needs_a_boundary() {
        assert_eq!(bind_score("c1-notes", "c1"), 2);
        assert_eq!(bind_score("notes_c1", "c1"), 2);
        assert_eq!(bind_score("c10-archive", "c1"), 0);
        assert_eq!(bind_score("abc1", "c1"), 0);
        assert_eq!(bind_score("c10-summary", "c1"), 1);

        let excluded = BTreeSet::from(["c10-summary".to_string()]);
        let books = vec!["c10-summary".to_string()];
        assert_eq!(pick_bind_candidate(&books, "c1", &excluded), None);
    }

    #[test]
    fn auto_bind_never_claims_another_conversations_book() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = SchedPaths::rooted_at(tmp.path());
        let store = FileArtifactStore::new(&paths);
        for start in [0, 10, 20, 30] {
            store
                .upsert(
                    "alice",
                    ArtifactEntry::for_batch("alice", Batch::new(start, start + 9), "recap"),
                )
                .expect("upsert");
        }
        // A default book whose owner has a transcript but no binding yet.
        fs::create_dir_all(&paths.conversations_dir).expect("mkdir");
        fs::write(paths.conversations_dir.join("c10.jsonl"), "").expect("transcript");
        fs::write(paths.artifacts_dir.join("c10-summary.jsonl"), "").expect("book");

        assert_eq!(store.auto_bind("bob").expect("bind"), None);
        assert_eq!(store.auto_bind("c1").expect("bind"), None);
        assert!(resolve_entries(&store, "bob", true).expect("resolve").is_none());

        // A shared, unowned book is still a fair candidate.
        fs::write(paths.artifacts_dir.join("story-summaries.jsonl"), "").expect("book");
        assert_eq!(
            store.auto_bind("bob").expect("bind").as_deref(),
            Some("story-summaries")
        );
        assert_eq!(
            store.bound_book("alice").expect("bound").as_deref(),
            Some("alice-summary")
        );
    }

    #[test]
    fn upsert_creates_and_binds_default_book() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = FileArtifactStore::new(&SchedPaths::rooted_at(tmp.path()));
        let entry = ArtifactEntry::for_batch("c1", Batch::new(0, 9), "  the story so far ");

        let book = store.upsert("c1", entry).expect("upsert");
        assert_eq!(book, "c1-summary");
        assert_eq!(store.bound_book("c1").expect("bound").as_deref(), Some("c1-summary"));

        let entries = store.entries(&book).expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].comment, "Summary floors #0-9");
        assert_eq!(entries[0].content, "the story so far");
    }

    #[test]
    fn upsert_replaces_same_range() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = FileArtifactStore::new(&SchedPaths::rooted_at(tmp.path()));
        store
            .upsert("c1", ArtifactEntry::for_batch("c1", Batch::new(0, 9), "first"))
            .expect("upsert");
        store
            .upsert("c1", ArtifactEntry::for_batch("c1", Batch::new(0, 9), "second"))
            .expect("upsert");
        store
            .upsert("c1", ArtifactEntry::for_batch("c1", Batch::new(10, 19), "third"))
            .expect("upsert");

        let entries = store.entries("c1-summary").expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].content, "second");
    }

    #[test]
    fn auto_bind_persists_choice() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = SchedPaths::rooted_at(tmp.path());
        fs::create_dir_all(&paths.artifacts_dir).expect("mkdir");
        fs::write(paths.artifacts_dir.join("c1-archive.jsonl"), "").expect("write book");
        fs::write(paths.artifacts_dir.join("notes.txt"), "").expect("write other");

        let store = FileArtifactStore::new(&paths);
        assert_eq!(store.bound_book("c1").expect("bound"), None);
        let resolved = resolve_entries(&store, "c1", true).expect("resolve");
        assert_eq!(resolved.map(|(book, _)| book).as_deref(), Some("c1-archive"));
        assert_eq!(store.bound_book("c1").expect("bound").as_deref(), Some("c1-archive"));
        assert!(resolve_entries(&store, "c2", false).expect("resolve").is_none());
    }

    #[test]
    fn entry_uid_is_stable_per_range() {
        let a = entry_uid("c1", Batch::new(0, 9));
        assert_eq!(a, entry_uid("c1", Batch::new(0, 9)));
        assert_ne!(a, entry_uid("c1", Batch::new(10, 19)));
        assert_ne!(a, entry_uid("c2", Batch::new(0, 9)));
        assert_eq!(a.len(), 16);
    }
}
