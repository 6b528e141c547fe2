//! # Image Catalog
//!
//! Tracks which runnable images exist on the runtime endpoint, so that an
//! admission decision does not need a runtime round-trip.
//!
//! - [`ImageRef`]: validated `name:tag` pair
//! - [`ImageCatalog`]: deduplicated set with copy-out listing
//!
//! The catalog never hands out references to its storage: [`ImageCatalog::list`]
//! returns a snapshot. It can be persisted as a text file (one reference per
//! line) and populated from the runtime's own image list.
//!
//! ## Builds
//!
//! [`ImageCatalog::build`] delegates to the runtime and registers the image
//! only when the build succeeds. A failed build registers nothing and returns
//! the tail of the build log as the diagnostic.

use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::{BUILD_LOG_TAIL_LINES, DEFAULT_IMAGE_TAG, MAX_IMAGE_REF_LEN};
use crate::error::{Error, Result};
use crate::runtime::ContainerRuntime;

// =============================================================================
// Image Reference
// =============================================================================

/// A `name:tag` image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageRef {
    /// Repository name, possibly with registry host (`registry:5000/team/trainer`).
    pub name: String,
    /// Tag.
    pub tag: String,
}

impl ImageRef {
    /// Creates a reference from parts without validation.
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }

    /// Parses and validates `name[:tag]`. A missing tag becomes `latest`.
    ///
    /// The tag is the part after the last `:` that is not followed by a `/`,
    /// so registry ports (`host:5000/img`) are not mistaken for tags.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        let invalid = |reason: &str| Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        if reference.is_empty() {
            return Err(invalid("empty reference"));
        }
        if reference.len() > MAX_IMAGE_REF_LEN {
            return Err(invalid(&format!(
                "longer than {MAX_IMAGE_REF_LEN} bytes"
            )));
        }
        if let Some(c) = reference
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '/' | ':' | '.' | '-' | '_')))
        {
            return Err(invalid(&format!("invalid character '{c}'")));
        }

        let (name, tag) = match reference.rfind(':') {
            Some(idx) if !reference[idx..].contains('/') => {
                (&reference[..idx], &reference[idx + 1..])
            }
            _ => (reference, DEFAULT_IMAGE_TAG),
        };

        if name.is_empty() {
            return Err(invalid("empty name"));
        }
        if tag.is_empty() {
            return Err(invalid("empty tag"));
        }

        Ok(Self::new(name, tag))
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

impl std::str::FromStr for ImageRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// =============================================================================
// Build Report
// =============================================================================

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    /// The image that was built and registered.
    pub image: ImageRef,
    /// Last lines of the build log.
    pub log_tail: Vec<String>,
}

fn tail(log: &[String]) -> Vec<String> {
    let start = log.len().saturating_sub(BUILD_LOG_TAIL_LINES);
    log[start..].to_vec()
}

// =============================================================================
// Catalog
// =============================================================================

/// Set of known runnable images.
#[derive(Debug, Default)]
pub struct ImageCatalog {
    images: RwLock<Vec<ImageRef>>,
}

impl ImageCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a catalog pre-populated with `images` (duplicates dropped).
    pub fn with_images(images: impl IntoIterator<Item = ImageRef>) -> Self {
        let catalog = Self::new();
        for image in images {
            catalog.add(image);
        }
        catalog
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<ImageRef>> {
        self.images
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<ImageRef>> {
        self.images
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Returns true if `image` is registered.
    pub fn exists(&self, image: &ImageRef) -> bool {
        self.read().contains(image)
    }

    /// Registers `image`. Returns false if it was already present.
    pub fn add(&self, image: ImageRef) -> bool {
        let mut images = self.write();
        if images.contains(&image) {
            return false;
        }
        debug!(image = %image, "image registered");
        images.push(image);
        true
    }

    /// Unregisters `image`. Returns false if it was not present.
    pub fn remove(&self, image: &ImageRef) -> bool {
        let mut images = self.write();
        let before = images.len();
        images.retain(|i| i != image);
        images.len() != before
    }

    /// Returns a copy of the registered images, in registration order.
    pub fn list(&self) -> Vec<ImageRef> {
        self.read().clone()
    }

    /// Number of registered images.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns true if no image is registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Writes the catalog to `path`, one reference per line.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let mut contents = String::new();
        for image in self.list() {
            contents.push_str(&image.to_string());
            contents.push('\n');
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    /// Loads references from `path` into the catalog.
    ///
    /// Blank lines are skipped; invalid lines are logged and skipped.
    /// Returns the number of newly registered images.
    pub async fn load(&self, path: &Path) -> Result<usize> {
        let contents = tokio::fs::read_to_string(path).await?;
        let mut added = 0;
        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match ImageRef::parse(line) {
                Ok(image) => {
                    if self.add(image) {
                        added += 1;
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping catalog entry"),
            }
        }
        Ok(added)
    }

    /// Registers every tagged image the runtime reports.
    ///
    /// Returns the number of newly registered images.
    pub async fn sync_from(&self, runtime: &dyn ContainerRuntime) -> Result<usize> {
        let images = runtime.list_images().await?;
        let mut added = 0;
        for image in images {
            if image.name == "<none>" || image.tag == "<none>" {
                continue;
            }
            if self.add(image) {
                added += 1;
            }
        }
        info!(endpoint = runtime.endpoint(), added, "image catalog synced");
        Ok(added)
    }

    // =========================================================================
    // Build
    // =========================================================================

    /// Builds `image` from `context` through the runtime and registers it.
    ///
    /// # Errors
    ///
    /// - [`Error::ImageAlreadyExists`] if the image is already registered
    /// - [`Error::ImageBuildFailed`] with the log tail if the build fails
    pub async fn build(
        &self,
        runtime: &dyn ContainerRuntime,
        image: &ImageRef,
        context: &Path,
    ) -> Result<BuildReport> {
        if self.exists(image) {
            return Err(Error::ImageAlreadyExists(image.to_string()));
        }

        info!(image = %image, context = %context.display(), "building image");
        let output = runtime.build_image(image, context).await?;

        if !output.success {
            warn!(image = %image, "image build failed");
            return Err(Error::ImageBuildFailed {
                reference: image.to_string(),
                log_tail: tail(&output.log),
            });
        }

        self.add(image.clone());
        info!(image = %image, "image built");
        Ok(BuildReport {
            image: image.clone(),
            log_tail: tail(&output.log),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_tag() {
        let image = ImageRef::parse("trainer:v2").unwrap();
        assert_eq!(image.name, "trainer");
        assert_eq!(image.tag, "v2");
        assert_eq!(image.to_string(), "trainer:v2");
    }

    #[test]
    fn test_parse_defaults_tag() {
        let image = ImageRef::parse("pytorch/pytorch").unwrap();
        assert_eq!(image.tag, "latest");
    }

    #[test]
    fn test_parse_registry_port_is_not_tag() {
        let image = ImageRef::parse("registry.local:5000/team/trainer").unwrap();
        assert_eq!(image.name, "registry.local:5000/team/trainer");
        assert_eq!(image.tag, "latest");

        let image = ImageRef::parse("registry.local:5000/team/trainer:1.0").unwrap();
        assert_eq!(image.name, "registry.local:5000/team/trainer");
        assert_eq!(image.tag, "1.0");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("trainer:").is_err());
        assert!(ImageRef::parse(":tag").is_err());
        assert!(ImageRef::parse("bad image").is_err());
        assert!(ImageRef::parse("x;rm -rf").is_err());
        assert!(ImageRef::parse(&"a".repeat(MAX_IMAGE_REF_LEN + 1)).is_err());
    }

    #[test]
    fn test_add_dedups_and_remove() {
        let catalog = ImageCatalog::new();
        let image = ImageRef::new("trainer", "latest");
        assert!(catalog.add(image.clone()));
        assert!(!catalog.add(image.clone()));
        assert_eq!(catalog.len(), 1);
        assert!(catalog.exists(&image));

        assert!(catalog.remove(&image));
        assert!(!catalog.remove(&image));
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_list_is_a_snapshot() {
        let catalog = ImageCatalog::with_images([ImageRef::new("a", "1")]);
        let mut snapshot = catalog.list();
        snapshot.push(ImageRef::new("b", "1"));
        snapshot.clear();
        assert_eq!(catalog.list(), vec![ImageRef::new("a", "1")]);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resources").join("image.txt");

        let catalog = ImageCatalog::with_images([
            ImageRef::new("trainer", "v1"),
            ImageRef::new("predictor", "latest"),
        ]);
        catalog.save(&path).await.unwrap();

        std::fs::write(
            &path,
            format!("{}\n\nnot valid!\ntrainer:v1\n", std::fs::read_to_string(&path).unwrap()),
        )
        .unwrap();

        let loaded = ImageCatalog::new();
        let added = loaded.load(&path).await.unwrap();
        assert_eq!(added, 2);
        assert_eq!(
            loaded.list(),
            vec![ImageRef::new("trainer", "v1"), ImageRef::new("predictor", "latest")]
        );
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        let log: Vec<String> = (0..50).map(|i| format!("step {i}")).collect();
        let t = tail(&log);
        assert_eq!(t.len(), BUILD_LOG_TAIL_LINES);
        assert_eq!(t.last().map(String::as_str), Some("step 49"));
    }
}
