//! Spec nodes and their kind-specific behavior
//!
//! Action nodes are a closed sum type: pull, build, archive-pull, the three
//! load kinds, cluster create, manifest apply, release install, user action,
//! and the synthetic no-op injected for ancestor ids when a child DAG is
//! built. Setup is skipped (successfully) when the corresponding suite
//! option disables it; cleanup consults the spec-state's effective cleanup
//! gate and any resource-local skip flag.

use std::sync::Arc;

use tracing::info;

use crate::actions::CleanupPolicy;
use crate::cluster::Cluster;
use crate::job::RunContext;
use crate::suite::Kindling;
use crate::{Error, Result};

/// Kind-specific behavior of one node
#[derive(Clone, Debug)]
pub(crate) enum Action {
    PullThirdParty { id: String },
    BuildCustom { id: String },
    PullArchive { id: String },
    LoadThirdParty { cluster: String, image: String, no_cache: bool },
    LoadCustom { cluster: String, image: String, no_cache: bool },
    LoadArchive { cluster: String, archive: String },
    CreateCluster { id: String },
    ApplyManifests { id: String, cluster: String },
    InstallRelease { id: String, cluster: String },
    UserAction { id: String, cluster: String, name: String },
    Noop,
}

/// A unit of work in the DAG
#[derive(Clone, Debug)]
pub(crate) struct SpecNode {
    /// The node's id; for resource nodes this is the resource id itself
    pub(crate) id: String,
    /// Ids this node's setup must wait for
    pub(crate) depends_on: Vec<String>,
    pub(crate) action: Action,
}

fn missing(id: &str, kind: &str) -> Error {
    Error::construction_for(id.to_string(), format!("{} descriptor missing", kind))
}

impl SpecNode {
    /// Whether this node is a synthetic no-op
    pub(crate) fn is_noop(&self) -> bool {
        matches!(self.action, Action::Noop)
    }

    /// Human-readable title for progress tracing; no-ops have none
    pub(crate) fn title(&self, g: &Kindling) -> Option<String> {
        let state = g.spec_state();
        let cluster_name = |id: &str| {
            state
                .cluster(id)
                .map(|c| c.name())
                .unwrap_or_else(|| id.to_string())
        };
        match &self.action {
            Action::PullThirdParty { id } => {
                let name = state
                    .third_party_image(id)
                    .map(|i| i.name)
                    .unwrap_or_else(|| id.clone());
                Some(format!("Pulling image {}", name))
            }
            Action::BuildCustom { id } => {
                let name = state
                    .custom_image(id)
                    .map(|i| i.with_tag(g.options().custom_image_tag()))
                    .unwrap_or_else(|| id.clone());
                Some(format!("Building image {}", name))
            }
            Action::PullArchive { id } => state.image_archive(id).map(|archive| {
                match &archive.name {
                    Some(name) => {
                        format!("Pulling image {} to archive {}", name, archive.path.display())
                    }
                    None => format!("Importing image archive {}", archive.path.display()),
                }
            }),
            Action::LoadThirdParty { cluster, image, .. } => {
                let name = state
                    .third_party_image(image)
                    .map(|i| i.local_name().to_string())
                    .unwrap_or_else(|| image.clone());
                Some(format!("Loading image {} to cluster {}", name, cluster_name(cluster)))
            }
            Action::LoadCustom { cluster, image, .. } => {
                let name = state
                    .custom_image(image)
                    .map(|i| i.with_tag(g.options().custom_image_tag()))
                    .unwrap_or_else(|| image.clone());
                Some(format!("Loading image {} to cluster {}", name, cluster_name(cluster)))
            }
            Action::LoadArchive { cluster, archive } => {
                let name = state
                    .image_archive(archive)
                    .map(|a| a.path.display().to_string())
                    .unwrap_or_else(|| archive.clone());
                Some(format!(
                    "Loading image archive {} to cluster {}",
                    name,
                    cluster_name(cluster)
                ))
            }
            Action::CreateCluster { id } => Some(format!("Creating cluster {}", cluster_name(id))),
            Action::ApplyManifests { id, .. } => {
                let name = state
                    .manifest_set(id)
                    .map(|m| m.name)
                    .unwrap_or_else(|| id.clone());
                Some(format!("Creating manifest set {}", name))
            }
            Action::InstallRelease { id, .. } => {
                let name = state
                    .release(id)
                    .map(|r| r.name)
                    .unwrap_or_else(|| id.clone());
                Some(format!("Creating helm release {}", name))
            }
            Action::UserAction { name, .. } => Some(format!("Executing action {}", name)),
            Action::Noop => None,
        }
    }

    fn skipped(&self, g: &Kindling) {
        if let Some(title) = self.title(g) {
            info!(node = %title, "SKIPPED");
        }
    }

    fn cluster_handle(&self, g: &Kindling, id: &str) -> Result<Arc<dyn Cluster>> {
        g.spec_state()
            .cluster(id)
            .ok_or_else(|| missing(id, "cluster"))
    }

    /// Materialize this node's resource
    pub(crate) async fn setup(&self, g: &Kindling, ctx: &RunContext) -> Result<()> {
        let state = g.spec_state();
        let opts = g.options();
        match &self.action {
            Action::PullThirdParty { id } => {
                if opts.no_pull {
                    self.skipped(g);
                    return Ok(());
                }
                let image = state
                    .third_party_image(id)
                    .ok_or_else(|| missing(id, "third-party image"))?;
                g.images_backend()?.pull(ctx, &image).run().await
            }
            Action::BuildCustom { id } => {
                if opts.no_build {
                    self.skipped(g);
                    return Ok(());
                }
                let image = state
                    .custom_image(id)
                    .ok_or_else(|| missing(id, "custom image"))?;
                let builder = match &image.builder {
                    Some(builder) => builder.clone(),
                    None => g.images_backend()?,
                };
                builder
                    .build(
                        ctx,
                        &image,
                        opts.custom_image_tag(),
                        &opts.extra_custom_image_tags,
                    )
                    .run()
                    .await
            }
            Action::PullArchive { id } => {
                let archive = state
                    .image_archive(id)
                    .ok_or_else(|| missing(id, "image archive"))?;
                let name = match &archive.name {
                    Some(name) if !opts.no_pull && !archive.no_pull => name.clone(),
                    _ => {
                        self.skipped(g);
                        return Ok(());
                    }
                };
                match tokio::fs::metadata(&archive.path).await {
                    Ok(_) => return Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::io(archive.path.display().to_string(), e)),
                }
                let puller = opts.registry_puller.clone().ok_or_else(|| {
                    Error::construction_for(
                        id.clone(),
                        "no registry puller configured for fetching image archives",
                    )
                })?;
                puller.pull_to_archive(ctx, &name, &archive.path).await
            }
            Action::LoadThirdParty {
                cluster,
                image,
                no_cache,
            } => {
                if opts.no_load_pulled {
                    self.skipped(g);
                    return Ok(());
                }
                let descriptor = state
                    .third_party_image(image)
                    .ok_or_else(|| missing(image, "third-party image"))?;
                self.cluster_handle(g, cluster)?
                    .load_images(
                        ctx,
                        g.images_backend()?,
                        state.third_party_format(image),
                        &[descriptor.local_name().to_string()],
                        *no_cache,
                    )
                    .run()
                    .await
            }
            Action::LoadCustom {
                cluster,
                image,
                no_cache,
            } => {
                if opts.no_load_built {
                    self.skipped(g);
                    return Ok(());
                }
                let descriptor = state
                    .custom_image(image)
                    .ok_or_else(|| missing(image, "custom image"))?;
                let mut tags = vec![descriptor.with_tag(opts.custom_image_tag())];
                for extra in &opts.extra_custom_image_tags {
                    tags.push(descriptor.with_tag(extra));
                }
                self.cluster_handle(g, cluster)?
                    .load_images(
                        ctx,
                        g.images_backend()?,
                        state.custom_format(image),
                        &tags,
                        *no_cache,
                    )
                    .run()
                    .await
            }
            Action::LoadArchive { cluster, archive } => {
                if opts.no_load_pulled {
                    self.skipped(g);
                    return Ok(());
                }
                let descriptor = state
                    .image_archive(archive)
                    .ok_or_else(|| missing(archive, "image archive"))?;
                self.cluster_handle(g, cluster)?
                    .load_image_archives(ctx, descriptor.format, &[descriptor.path.clone()])
                    .run()
                    .await
            }
            Action::CreateCluster { id } => {
                self.cluster_handle(g, id)?.create(ctx, true).run().await
            }
            Action::ApplyManifests { id, cluster } => {
                if opts.no_deps {
                    self.skipped(g);
                    return Ok(());
                }
                let set = state
                    .manifest_set(id)
                    .ok_or_else(|| missing(id, "manifest set"))?;
                let handle = self.cluster_handle(g, cluster)?;
                opts.manifests_backend()
                    .create_or_update(g, ctx, handle, &set)
                    .run()
                    .await
            }
            Action::InstallRelease { id, cluster } => {
                if opts.no_deps {
                    self.skipped(g);
                    return Ok(());
                }
                let release = state.release(id).ok_or_else(|| missing(id, "release"))?;
                let handle = self.cluster_handle(g, cluster)?;
                opts.helm_backend()
                    .install_or_upgrade(g, ctx, handle, &release)
                    .run()
                    .await
            }
            Action::UserAction { id, cluster, .. } => {
                if opts.no_deps {
                    self.skipped(g);
                    return Ok(());
                }
                let hooks = state
                    .cluster_action(id)
                    .ok_or_else(|| missing(id, "cluster action"))?;
                if let Some(setup) = &hooks.setup {
                    let handle = self.cluster_handle(g, cluster)?;
                    setup.as_ref()(g.clone(), ctx.clone(), handle).await
                } else {
                    Ok(())
                }
            }
            Action::Noop => Ok(()),
        }
    }

    /// Undo this node's resource. Errors are reported by the engine but never
    /// short-circuit other cleanups.
    pub(crate) async fn cleanup(&self, g: &Kindling, ctx: &RunContext) -> Result<()> {
        let state = g.spec_state();
        match &self.action {
            Action::CreateCluster { id } => {
                if g.no_cleanup() {
                    self.skipped(g);
                    return Ok(());
                }
                self.cluster_handle(g, id)?.delete(ctx).run().await
            }
            Action::ApplyManifests { id, cluster } => {
                let set = state
                    .manifest_set(id)
                    .ok_or_else(|| missing(id, "manifest set"))?;
                if g.no_cleanup() || set.skip_delete {
                    self.skipped(g);
                    return Ok(());
                }
                let handle = self.cluster_handle(g, cluster)?;
                g.options()
                    .manifests_backend()
                    .delete(g, ctx, handle, &set)
                    .run()
                    .await
            }
            Action::InstallRelease { id, cluster } => {
                let release = state.release(id).ok_or_else(|| missing(id, "release"))?;
                if g.no_cleanup() || release.skip_delete {
                    self.skipped(g);
                    return Ok(());
                }
                let handle = self.cluster_handle(g, cluster)?;
                g.options()
                    .helm_backend()
                    .delete(ctx, handle, &release, true)
                    .run()
                    .await
            }
            Action::UserAction { id, cluster, .. } => {
                let hooks = state
                    .cluster_action(id)
                    .ok_or_else(|| missing(id, "cluster action"))?;
                let cleanup = match &hooks.cleanup {
                    Some(cleanup) => cleanup.clone(),
                    None => return Ok(()),
                };
                let run = match hooks.cleanup_policy {
                    CleanupPolicy::WithSetup => !g.no_cleanup(),
                    CleanupPolicy::Always => true,
                    CleanupPolicy::OnSuiteFailure => g.failed(),
                };
                if !run {
                    self.skipped(g);
                    return Ok(());
                }
                let handle = self.cluster_handle(g, cluster)?;
                cleanup.as_ref()(g.clone(), ctx.clone(), handle).await
            }
            // pulls, builds and loads leave nothing behind worth undoing
            _ => Ok(()),
        }
    }
}
