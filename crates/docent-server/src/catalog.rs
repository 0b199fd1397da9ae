//! Shared catalogue handle with atomic reload.
//!
//! Each load builds an immutable `Catalog` generation; reload swaps the
//! `Arc` so in-flight resolutions finish against whichever generation they
//! started with.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use tracing::info;

use docent_core::{Catalog, ImageRef, Resolution};

pub struct CatalogHandle {
    path: PathBuf,
    current: RwLock<Arc<Catalog>>,
}

impl CatalogHandle {
    pub fn load(path: PathBuf) -> anyhow::Result<Self> {
        let catalog = Catalog::from_path(&path)
            .with_context(|| format!("Failed to load image catalogue: {}", path.display()))?;
        info!(entries = catalog.len(), path = %path.display(), "image catalogue loaded");
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(catalog)),
        })
    }

    pub fn current(&self) -> Arc<Catalog> {
        self.current.read().unwrap().clone()
    }

    pub fn resolve(&self, image: &ImageRef) -> Resolution {
        self.current().resolve(image)
    }

    /// Re-read the document and swap generations. Failure leaves the old
    /// generation in place.
    pub fn reload(&self) -> anyhow::Result<usize> {
        let catalog = Catalog::from_path(&self.path)
            .with_context(|| format!("Failed to reload image catalogue: {}", self.path.display()))?;
        let entries = catalog.len();
        *self.current.write().unwrap() = Arc::new(catalog);
        info!(entries, "image catalogue reloaded");
        Ok(entries)
    }
}
