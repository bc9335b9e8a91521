//! Course and book catalog with the library browser's search, filter and
//! pagination rules.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Catalog file name inside the data directory
pub const CATALOG_FILE: &str = "catalog.json";

/// Books shown before "load more"
pub const PAGE_SIZE: usize = 6;

/// Filter value matching every category
pub const ALL: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub code: String,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub title: String,
    pub category: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    pub courses: Vec<Course>,
    pub books: Vec<Book>,
}

impl Catalog {
    /// Categories in order of first appearance
    pub fn categories(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for book in &self.books {
            if !seen.contains(&book.category.as_str()) {
                seen.push(&book.category);
            }
        }
        seen
    }

    /// Courses whose code or name contains `term` (case-insensitive)
    pub fn search_courses(&self, term: &str) -> Vec<&Course> {
        let term = term.trim().to_lowercase();
        self.courses
            .iter()
            .filter(|c| {
                term.is_empty()
                    || c.code.to_lowercase().contains(&term)
                    || c.name.to_lowercase().contains(&term)
            })
            .collect()
    }
}

/// Load `catalog.json` from `data_dir`. A missing file is an empty catalog.
pub fn load_catalog(data_dir: &Path) -> Result<Catalog> {
    let path = data_dir.join(CATALOG_FILE);
    if !path.exists() {
        warn!(path = %path.display(), "No catalog file found");
        return Ok(Catalog::default());
    }

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let catalog: Catalog = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    info!(
        courses = catalog.courses.len(),
        books = catalog.books.len(),
        "Loaded catalog"
    );
    Ok(catalog)
}

/// Browser state of the book gallery.
///
/// The gallery starts collapsed. Any change of search or filter shows the
/// first page again; a non-empty search opens the gallery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LibraryView {
    pub search: String,
    pub filter: String,
    pub expanded: bool,
    pub show_all: bool,
}

impl Default for LibraryView {
    fn default() -> Self {
        Self {
            search: String::new(),
            filter: ALL.to_string(),
            expanded: false,
            show_all: false,
        }
    }
}

fn matches(book: &Book, term: &str, filter: &str) -> bool {
    let matches_text = book.title.to_lowercase().contains(term);
    let matches_category = filter == ALL || book.category == filter;
    matches_text && matches_category
}

impl LibraryView {
    fn term(&self) -> String {
        self.search.trim().to_lowercase()
    }

    pub fn set_search(&mut self, term: &str) {
        self.search = term.to_string();
        if !self.term().is_empty() {
            self.expanded = true;
        }
        self.show_all = false;
    }

    pub fn clear_search(&mut self) {
        self.set_search("");
    }

    /// Select a category (or `all`). Opens the gallery.
    pub fn set_filter(&mut self, filter: &str) {
        self.filter = filter.to_string();
        self.expanded = true;
        self.show_all = false;
    }

    pub fn load_more(&mut self) {
        self.show_all = true;
    }

    /// Open or close the gallery; either way back to the first page.
    pub fn toggle(&mut self) {
        self.expanded = !self.expanded;
        self.show_all = false;
    }

    /// Every book passing the search and the active filter
    pub fn matching<'a>(&self, catalog: &'a Catalog) -> Vec<&'a Book> {
        let term = self.term();
        catalog
            .books
            .iter()
            .filter(|b| matches(b, &term, &self.filter))
            .collect()
    }

    /// Books currently on screen
    pub fn visible<'a>(&self, catalog: &'a Catalog) -> Vec<&'a Book> {
        if !self.expanded {
            return Vec::new();
        }
        let matching = self.matching(catalog);
        if self.show_all {
            matching
        } else {
            matching.into_iter().take(PAGE_SIZE).collect()
        }
    }

    /// Whether the "load more" button shows
    pub fn has_more(&self, catalog: &Catalog) -> bool {
        self.expanded && !self.show_all && self.matching(catalog).len() > PAGE_SIZE
    }

    /// Badge count for every filter button (`all` first), honouring the search.
    pub fn counts(&self, catalog: &Catalog) -> Vec<(String, usize)> {
        let term = self.term();
        std::iter::once(ALL)
            .chain(catalog.categories())
            .map(|filter| {
                let count = catalog
                    .books
                    .iter()
                    .filter(|b| matches(b, &term, filter))
                    .count();
                (filter.to_string(), count)
            })
            .collect()
    }

    pub fn snapshot<'a>(&self, catalog: &'a Catalog) -> LibrarySnapshot<'a> {
        let snapshot = LibrarySnapshot {
            courses: catalog.search_courses(&self.search),
            books: self.visible(catalog),
            counts: self.counts(catalog),
            has_more: self.has_more(catalog),
            expanded: self.expanded,
        };
        debug!(books = snapshot.books.len(), search = %self.search, filter = %self.filter, "library view");
        snapshot
    }
}

/// What the page renders for a given [`LibraryView`]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LibrarySnapshot<'a> {
    pub courses: Vec<&'a Course>,
    pub books: Vec<&'a Book>,
    pub counts: Vec<(String, usize)>,
    pub has_more: bool,
    pub expanded: bool,
}
