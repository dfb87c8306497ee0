use regex::{Regex, RegexBuilder};

use crate::config::ClassifierSettings;
use crate::error::{Error, Result};
use crate::source::{ContentItem, ItemKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedField {
    Title,
    Collection,
    Url,
}

/// The first history entry that tripped the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub full_id: String,
    pub kind: ItemKind,
    pub field: MatchedField,
}

/// Flags authors whose history promotes paid-content sites.
#[derive(Debug, Clone)]
pub struct Classifier {
    pattern: Regex,
}

impl Classifier {
    pub fn new<S: AsRef<str>>(markers: &[S]) -> Result<Self> {
        let alternatives: Vec<String> = markers
            .iter()
            .map(|m| m.as_ref().trim())
            .filter(|m| !m.is_empty())
            .map(regex::escape)
            .collect();

        if alternatives.is_empty() {
            return Err(Error::Config("Classifier needs at least one marker".to_string()));
        }

        let pattern = RegexBuilder::new(&alternatives.join("|"))
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::Config(format!("Invalid classifier markers: {}", e)))?;

        Ok(Self { pattern })
    }

    pub fn from_settings(settings: &ClassifierSettings) -> Result<Self> {
        Self::new(&settings.markers)
    }

    pub fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }

    /// Scan posts first, then comments, stopping at the first hit.
    ///
    /// Title and collection are checked for every entry; the url only for
    /// posts.
    pub fn find_match(&self, posts: &[ContentItem], comments: &[ContentItem]) -> Option<Match> {
        posts
            .iter()
            .chain(comments.iter())
            .find_map(|item| self.inspect(item))
    }

    pub fn is_disqualified(&self, posts: &[ContentItem], comments: &[ContentItem]) -> bool {
        self.find_match(posts, comments).is_some()
    }

    fn inspect(&self, item: &ContentItem) -> Option<Match> {
        let field = if self.matches(&item.title) {
            MatchedField::Title
        } else if self.matches(&item.source_collection) {
            MatchedField::Collection
        } else if item.kind == ItemKind::Post && self.matches(&item.url) {
            MatchedField::Url
        } else {
            return None;
        };

        Some(Match {
            full_id: item.full_id.clone(),
            kind: item.kind,
            field,
        })
    }
}
