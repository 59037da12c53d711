//! Image descriptors and the image-handling contracts
//!
//! Three image flavors exist: *third-party* images pulled from a remote
//! registry, *custom* images built from the local filesystem, and *image
//! archives* fetched (or found) as tarballs on disk. Clusters declare which
//! of them they need loaded; the orchestrator synthesizes one load node per
//! cluster × image pair.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::job::{Job, RunContext};
use crate::Result;

/// The default tag applied to custom images when none is configured
pub const DEFAULT_CUSTOM_IMAGE_TAG: &str = "kindling-latest";

/// What format an image is exported as
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// Exported as if from `docker save`
    #[default]
    Docker,
    /// Exported as an OCI layout
    Oci,
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageFormat::Docker => f.write_str("docker"),
            ImageFormat::Oci => f.write_str("oci"),
        }
    }
}

/// An externally hosted image to be pulled and loaded into a cluster
#[derive(Clone, Debug, Default)]
pub struct ThirdPartyImage {
    /// The image to pull
    pub name: String,
    /// Re-tag the pulled image as this name before loading into the cluster.
    /// If absent, the image is loaded as `name`.
    pub retag: Option<String>,
    /// Skip the pull, e.g. if the image is produced by another local process
    pub no_pull: bool,
}

impl ThirdPartyImage {
    /// A plain pullable image
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The name this image is known by locally, and loaded into clusters as
    pub fn local_name(&self) -> &str {
        self.retag.as_deref().unwrap_or(&self.name)
    }
}

/// A custom image to be built from the local filesystem and loaded into a
/// cluster
#[derive(Clone, Default)]
pub struct CustomImage {
    /// Registry component of the image name
    pub registry: Option<String>,
    /// Repository component of the image name
    pub repository: String,
    /// Directory to build the image from; defaults to the current directory
    pub context_dir: Option<PathBuf>,
    /// Path to the Dockerfile/Containerfile, relative to `context_dir`
    pub dockerfile: Option<PathBuf>,
    /// `--build-arg` style arguments
    pub build_args: std::collections::BTreeMap<String, String>,
    /// Extra flags for the build command
    pub flags: Vec<String>,
    /// Builder for this image; the suite-level image handler is used when
    /// absent
    pub builder: Option<Arc<dyn Images>>,
}

impl CustomImage {
    /// Render the full image name with the given tag
    pub fn with_tag(&self, tag: &str) -> String {
        let mut image = String::new();
        if let Some(registry) = &self.registry {
            image.push_str(registry);
            image.push('/');
        }
        image.push_str(&self.repository);
        if !tag.is_empty() {
            image.push(':');
            image.push_str(tag);
        }
        image
    }
}

impl std::fmt::Debug for CustomImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomImage")
            .field("registry", &self.registry)
            .field("repository", &self.repository)
            .field("context_dir", &self.context_dir)
            .field("dockerfile", &self.dockerfile)
            .field("build_args", &self.build_args)
            .field("flags", &self.flags)
            .field("builder", &self.builder.as_ref().map(|_| "<custom>"))
            .finish()
    }
}

/// An image tarball on disk, optionally fetched from a remote ref when absent
#[derive(Clone, Debug, Default)]
pub struct ImageArchive {
    /// Remote ref to fetch the archive from when the path does not exist.
    /// When absent, the archive must already be on disk.
    pub name: Option<String>,
    /// Where the archive lives (or is written to) on disk
    pub path: PathBuf,
    /// Format of the archive
    pub format: ImageFormat,
    /// Never fetch, even if the path is missing
    pub no_pull: bool,
}

/// Knows how to handle images
pub trait Images: Send + Sync {
    /// Pull (and, if requested, re-tag) a third-party image
    fn pull(&self, ctx: &RunContext, image: &ThirdPartyImage) -> Job;

    /// Build a local image with one or more tags
    fn build(&self, ctx: &RunContext, image: &CustomImage, tag: &str, extra_tags: &[String])
        -> Job;

    /// Export a set of built images as an archive, indicating the format the
    /// archive will be written in
    fn save(&self, ctx: &RunContext, images: &[String], dest: &Path) -> (Job, ImageFormat);

    /// Remove local copies of a set of images
    fn remove(&self, ctx: &RunContext, images: &[String]) -> Job;
}

/// Content-addressable fetch of a remote image ref into an archive file.
///
/// Used by the image-archive action when the archive is absent on disk; the
/// concrete puller is an external collaborator supplied via suite options.
#[async_trait]
pub trait RegistryPuller: Send + Sync {
    /// Fetch `name` and write it to `dest`
    async fn pull_to_archive(&self, ctx: &RunContext, name: &str, dest: &Path) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_tag_renders_all_parts() {
        let image = CustomImage {
            registry: Some("registry.local".to_string()),
            repository: "team/app".to_string(),
            ..Default::default()
        };
        assert_eq!(image.with_tag("v1"), "registry.local/team/app:v1");
    }

    #[test]
    fn test_with_tag_omits_missing_parts() {
        let image = CustomImage {
            repository: "app".to_string(),
            ..Default::default()
        };
        assert_eq!(image.with_tag("v1"), "app:v1");
        assert_eq!(image.with_tag(""), "app");
    }

    /// Story: a retag renames the image before it reaches the cluster
    #[test]
    fn story_retag_wins_as_local_name() {
        let plain = ThirdPartyImage::new("docker.io/library/postgres:16");
        assert_eq!(plain.local_name(), "docker.io/library/postgres:16");

        let retagged = ThirdPartyImage {
            retag: Some("registry.local/postgres:16".to_string()),
            ..ThirdPartyImage::new("docker.io/library/postgres:16")
        };
        assert_eq!(retagged.local_name(), "registry.local/postgres:16");
    }

    #[test]
    fn test_image_format_display() {
        assert_eq!(ImageFormat::Docker.to_string(), "docker");
        assert_eq!(ImageFormat::Oci.to_string(), "oci");
        assert_eq!(ImageFormat::default(), ImageFormat::Docker);
    }
}
