//! Node image resolution
//!
//! Pools either name their image directly or ask for the snapshot matching
//! the node OS version and their architecture. Missing snapshots are built,
//! one build per architecture, all architectures in parallel. Snapshots named
//! by id must exist.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use stratum_common::model::{Arch, ClusterSpec, ImageRef};
use stratum_common::poll::run_cancellable;
use stratum_common::Error;

use crate::cloud::{Labels, ServerImage, Snapshot};
use crate::context::Context;

/// Step name used in errors and logs
pub const IMAGES_STEP: &str = "images";

/// Snapshot build request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageBuildRequest {
    /// Node OS release
    pub os_version: String,
    /// Target architecture
    pub arch: Arch,
    /// Location to build in
    pub location: String,
    /// Labels the resulting snapshot must carry
    pub labels: Labels,
}

/// Builds node OS snapshots
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build a snapshot and return it once available
    async fn build(&self, request: &ImageBuildRequest) -> Result<Snapshot, Error>;
}

/// Labels identifying the snapshot for an OS version and architecture
pub fn snapshot_labels(os_version: &str, arch: Arch) -> Labels {
    BTreeMap::from([
        ("os".to_string(), "talos".to_string()),
        ("talos-version".to_string(), os_version.to_string()),
        ("arch".to_string(), arch.as_str().to_string()),
    ])
}

/// Selector for [`snapshot_labels`]
pub fn snapshot_selector(os_version: &str, arch: Arch) -> String {
    snapshot_labels(os_version, arch)
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Resolve the image of every pool for `os_version`, keyed by pool name
pub async fn resolve_pool_images(
    ctx: &Context,
    spec: &ClusterSpec,
    os_version: &str,
    cancel: &CancellationToken,
) -> Result<BTreeMap<String, ServerImage>, Error> {
    let archs: BTreeSet<Arch> = spec
        .pools()
        .filter(|(_, pool)| pool.image == ImageRef::OsVersion)
        .map(|(_, pool)| pool.arch())
        .collect();

    run_cancellable(cancel, IMAGES_STEP, check_explicit_snapshots(ctx, spec)).await?;
    let snapshots = run_cancellable(
        cancel,
        IMAGES_STEP,
        ensure_snapshots(ctx, spec, os_version, archs),
    )
    .await?;

    spec.pools()
        .map(|(_, pool)| {
            let image = match &pool.image {
                ImageRef::Snapshot { id } => ServerImage::Snapshot(*id),
                ImageRef::Named { name } => ServerImage::Named(name.clone()),
                ImageRef::OsVersion => {
                    let id = snapshots.get(&pool.arch()).ok_or_else(|| {
                        Error::internal_with_context(IMAGES_STEP, format!("no snapshot for {}", pool.arch().as_str()))
                    })?;
                    ServerImage::Snapshot(*id)
                }
            };
            Ok((pool.name.clone(), image))
        })
        .collect()
}

async fn check_explicit_snapshots(ctx: &Context, spec: &ClusterSpec) -> Result<(), Error> {
    for (_, pool) in spec.pools() {
        let ImageRef::Snapshot { id } = pool.image else {
            continue;
        };
        let found = ctx
            .cloud
            .get_snapshot(id)
            .await
            .map_err(|e| e.into_provider_error(&spec.name, IMAGES_STEP))?;
        if found.is_none() {
            return Err(Error::validation_for_field(
                &spec.name,
                format!("pools.{}.image", pool.name),
                format!("snapshot {} does not exist", id),
            ));
        }
    }
    Ok(())
}

async fn ensure_snapshots(
    ctx: &Context,
    spec: &ClusterSpec,
    os_version: &str,
    archs: BTreeSet<Arch>,
) -> Result<BTreeMap<Arch, u64>, Error> {
    let mut found = BTreeMap::new();
    let mut missing = Vec::new();
    for arch in archs {
        let selector = snapshot_selector(os_version, arch);
        match ctx
            .cloud
            .get_snapshot_by_labels(&selector)
            .await
            .map_err(|e| e.into_provider_error(&spec.name, IMAGES_STEP))?
        {
            Some(snapshot) => {
                found.insert(arch, snapshot.id);
            }
            None => missing.push(arch),
        }
    }

    let builds = missing.into_iter().map(|arch| {
        let request = ImageBuildRequest {
            os_version: os_version.to_string(),
            arch,
            location: spec.location.clone(),
            labels: snapshot_labels(os_version, arch),
        };
        async move {
            info!(cluster = %spec.name, arch = arch.as_str(), version = %os_version, "Building node image");
            let snapshot = tokio::time::timeout(ctx.config.timeouts.image_build, ctx.image_builder.build(&request))
                .await
                .map_err(|_| Error::timeout(IMAGES_STEP, arch.as_str(), "image build did not finish"))??;
            info!(cluster = %spec.name, arch = arch.as_str(), snapshot = snapshot.id, "Node image ready");
            Ok::<_, Error>((arch, snapshot.id))
        }
    });
    found.extend(try_join_all(builds).await?);
    Ok(found)
}
