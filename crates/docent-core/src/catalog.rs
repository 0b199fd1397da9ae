//! Static image catalogue and the keyword resolver.
//!
//! The catalogue is a structured document of collections; each entry is a
//! concrete, preloadable image descriptor. Resolution is a deterministic
//! scored keyword match; inputs that match nothing fall back to a random
//! sample so a turn never loses its visual entirely.

use std::collections::BTreeMap;
use std::path::Path;

use rand::seq::index::sample;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CoreError, Result};
use crate::timeline::ImageRef;

/// Number of entries sampled when nothing in the catalogue scores above zero.
pub const FALLBACK_SAMPLE_SIZE: usize = 3;

const KEYWORD_TOKEN_WEIGHT: u32 = 10;
const KEYWORD_SUBSTRING_WEIGHT: u32 = 5;
const CATEGORY_TOKEN_WEIGHT: u32 = 3;
const TITLE_SUBSTRING_WEIGHT: u32 = 15;
const ID_SUBSTRING_WEIGHT: u32 = 30;

/// A concrete, preloadable image. What the resolver hands the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageDescriptor {
    pub id: String,
    pub title: String,
    pub cdn_url: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub era: Option<String>,
    #[serde(default)]
    pub category: String,
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    collections: BTreeMap<String, Vec<ImageDescriptor>>,
}

/// Outcome of one resolution. `matched` is false when the descriptor is a
/// random fallback rather than a scored winner.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub descriptor: ImageDescriptor,
    pub matched: bool,
}

/// An immutable catalogue generation. Reloading builds a fresh `Catalog`
/// and swaps the shared handle; in-flight resolutions keep the old one.
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Vec<ImageDescriptor>,
}

impl Catalog {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let document: CatalogDocument = serde_json::from_str(raw)
            .map_err(|err| CoreError::CatalogShape(err.to_string()))?;

        let mut entries = Vec::new();
        for (category, mut items) in document.collections {
            for entry in &mut items {
                if entry.category.is_empty() {
                    entry.category = category.clone();
                }
            }
            entries.extend(items);
        }

        if entries.is_empty() {
            return Err(CoreError::CatalogShape(
                "catalogue contains no entries".to_string(),
            ));
        }

        Ok(Self { entries })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ImageDescriptor] {
        &self.entries
    }

    /// Resolve an abstract image reference to the best-scoring descriptor.
    /// Ties break in catalogue order; a zero-score input yields a random
    /// fallback and a recorded warning.
    pub fn resolve(&self, image: &ImageRef) -> Resolution {
        let search = normalize(&image.search_string());
        let tokens: Vec<&str> = search.split_whitespace().collect();

        let mut best: Option<(u32, &ImageDescriptor)> = None;
        for entry in &self.entries {
            let score = score_entry(entry, &search, &tokens);
            if score > 0 && best.map_or(true, |(top, _)| score > top) {
                best = Some((score, entry));
            }
        }

        match best {
            Some((_, entry)) => Resolution {
                descriptor: entry.clone(),
                matched: true,
            },
            None => {
                warn!(id = %image.id, "no catalogue entry matched, dispatching random fallback");
                Resolution {
                    descriptor: self.random_fallback(),
                    matched: false,
                }
            }
        }
    }

    fn random_fallback(&self) -> ImageDescriptor {
        let count = FALLBACK_SAMPLE_SIZE.min(self.entries.len());
        let mut rng = rand::thread_rng();
        let pool = sample(&mut rng, self.entries.len(), count);
        self.entries[pool.index(0)].clone()
    }
}

fn score_entry(entry: &ImageDescriptor, search: &str, tokens: &[&str]) -> u32 {
    let mut score = 0;

    for keyword in &entry.keywords {
        let keyword = normalize(keyword);
        if keyword.is_empty() {
            continue;
        }
        if tokens.iter().any(|token| *token == keyword) {
            score += KEYWORD_TOKEN_WEIGHT;
        } else if search.contains(&keyword) {
            score += KEYWORD_SUBSTRING_WEIGHT;
        }
    }

    let category = normalize(&entry.category);
    if !category.is_empty() && tokens.iter().any(|token| *token == category) {
        score += CATEGORY_TOKEN_WEIGHT;
    }

    let title = normalize(&entry.title);
    if !title.is_empty() && search.contains(&title) {
        score += TITLE_SUBSTRING_WEIGHT;
    }

    let id = normalize(&entry.id);
    if !id.is_empty() && search.contains(&id) {
        score += ID_SUBSTRING_WEIGHT;
    }

    score
}

/// Lowercase and fold id-style separators into spaces so `mona_lisa`,
/// `mona-lisa` and `Mona Lisa` all tokenize the same way.
fn normalize(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|ch| if ch == '_' || ch == '-' { ' ' } else { ch })
        .collect::<String>()
        .trim()
        .to_string()
}
