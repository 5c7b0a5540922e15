//! Capturing roles' root disks as reusable OS images.

use tracing::{info, warn};

use crate::config::SnapshotSpec;
use crate::operation::OperationTracker;
use crate::template::{Context, resolve};
use crate::types::{OsImage, RoleInfo, Scope};
use crate::{Error, Result};

/// Blob name the root disk of `role` is copied to.
pub fn image_blob_name(role: &str) -> String {
    format!("image-from-{role}.vhd")
}

/// `role.*` attributes visible to snapshot templates, one per
/// [`crate::config::ROLE_TOKENS`] entry.
pub fn role_context(role: &RoleInfo) -> Context {
    Context::new()
        .with("role.role_name", &role.role_name)
        .with("role.instance_name", &role.instance_name)
        .with("role.instance_status", &role.instance_status)
        .with("role.host_name", &role.host_name)
}

pub struct SnapshotOrchestrator {
    tracker: OperationTracker,
    images_container: String,
}

impl SnapshotOrchestrator {
    pub fn new(tracker: OperationTracker, images_container: impl Into<String>) -> Self {
        Self {
            tracker,
            images_container: images_container.into(),
        }
    }

    /// Capture every role of the deployment, or only `target` when given.
    /// Returns the registered images in role order.
    pub async fn snapshot(
        &self,
        scope: &Scope,
        spec: &SnapshotSpec,
        target: Option<&str>,
    ) -> Result<Vec<OsImage>> {
        let cloud = self.tracker.cloud();
        let deployment = cloud
            .get_deployment(scope)
            .await?
            .ok_or_else(|| Error::NotFound(format!("deployment '{}'", scope.deployment)))?;

        let roles: Vec<&RoleInfo> = deployment
            .roles
            .iter()
            .filter(|r| target.is_none_or(|t| r.role_name == t))
            .collect();
        match target {
            Some(t) if roles.is_empty() => return Err(Error::NotFound(format!("role '{t}'"))),
            _ => {}
        }

        cloud.ensure_container(&self.images_container).await?;

        let mut images = Vec::with_capacity(roles.len());
        for role in roles {
            images.push(self.capture(role, spec).await?);
        }
        Ok(images)
    }

    async fn capture(&self, role: &RoleInfo, spec: &SnapshotSpec) -> Result<OsImage> {
        let cloud = self.tracker.cloud();
        let name = &role.role_name;

        if !role.is_stopped() {
            warn!(
                role = %name,
                status = %role.instance_status,
                "role is not stopped, the image may be inconsistent"
            );
        }

        let source = role
            .os_disk
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("root disk of role '{name}'")))?;

        // Resolve before copying so a bad template costs nothing.
        let ctx = role_context(role);
        let label = resolve(&spec.label_tpl, &ctx)?;
        let image_name = resolve(&spec.name_tpl, &ctx)?;

        let blob = image_blob_name(name);
        cloud
            .copy_blob(&self.images_container, &blob, &source.media_link)
            .await?;
        info!(role = %name, %blob, "root disk copied");

        let image = OsImage {
            label,
            name: image_name,
            media_link: cloud.blob_url(&self.images_container, &blob),
            os: spec.os.clone(),
        };
        self.tracker
            .track(
                &format!("register image '{}'", image.name),
                cloud.add_os_image(&image),
            )
            .await?;
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::ROLE_TOKENS;
    use crate::fleet::Fleet;
    use crate::operation::PollSettings;
    use crate::power::stop_all;
    use crate::provision::{CancelToken, Provisioner};
    use crate::testing::{FakeCloud, blob_url, deployment_spec, scope, vm_template};

    fn tracker(cloud: Arc<FakeCloud>) -> OperationTracker {
        OperationTracker::new(
            cloud,
            PollSettings {
                interval: Duration::from_millis(100),
                timeout: Duration::from_secs(30),
            },
        )
    }

    fn spec() -> SnapshotSpec {
        SnapshotSpec {
            label_tpl: "{role.host_name} image".into(),
            name_tpl: "img-{role.role_name}".into(),
            os: "Linux".into(),
        }
    }

    async fn provisioned(cloud: &Arc<FakeCloud>, n: usize) -> Fleet {
        let p = Provisioner::new(tracker(cloud.clone()), Arc::new(deployment_spec(n)));
        let plan = p.plan(&vm_template()).unwrap();
        p.provision(plan, CancelToken::never()).await.unwrap().fleet()
    }

    #[tokio::test(start_paused = true)]
    async fn captures_target_role_with_resolved_names() {
        let cloud = Arc::new(FakeCloud::new());
        let fleet = provisioned(&cloud, 2).await;
        stop_all(&tracker(cloud.clone()), &fleet).await.unwrap();
        let vm = &fleet.vms[1];
        let role = vm.name.to_string();

        let images = SnapshotOrchestrator::new(tracker(cloud.clone()), "images")
            .snapshot(&scope(), &spec(), Some(&role))
            .await
            .unwrap();

        let expected = OsImage {
            label: format!("{} image", vm.resolved.host_name),
            name: format!("img-{role}"),
            media_link: blob_url("images", &format!("image-from-{role}.vhd")),
            os: "Linux".into(),
        };
        assert_eq!(images, vec![expected.clone()]);
        assert_eq!(cloud.images(), vec![expected]);
        assert!(cloud.containers().contains("images"));

        let copies = cloud.copies();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].0, "images");
        assert_eq!(copies[0].1, format!("image-from-{role}.vhd"));
    }

    #[tokio::test(start_paused = true)]
    async fn running_roles_are_still_captured() {
        let cloud = Arc::new(FakeCloud::new());
        let fleet = provisioned(&cloud, 2).await;
        let stopped = fleet.vms[0].name.to_string();
        let running = fleet.vms[1].name.to_string();
        cloud.set_role_status(&stopped, "StoppedDeallocated");
        cloud.set_role_status(&running, "ReadyRole");
        let by_status = SnapshotSpec {
            label_tpl: "{role.role_name} {role.instance_status}".into(),
            ..spec()
        };

        let images = SnapshotOrchestrator::new(tracker(cloud.clone()), "images")
            .snapshot(&scope(), &by_status, None)
            .await
            .unwrap();

        let mut labels: Vec<String> = images.into_iter().map(|i| i.label).collect();
        labels.sort();
        let mut expected = vec![
            format!("{stopped} StoppedDeallocated"),
            format!("{running} ReadyRole"),
        ];
        expected.sort();
        assert_eq!(labels, expected);
        assert_eq!(cloud.copies().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_target_role_is_not_found() {
        let cloud = Arc::new(FakeCloud::new());
        provisioned(&cloud, 1).await;

        let err = SnapshotOrchestrator::new(tracker(cloud.clone()), "images")
            .snapshot(&scope(), &spec(), Some("vmnothere"))
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert!(cloud.copies().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_token_aborts_before_copying() {
        let cloud = Arc::new(FakeCloud::new());
        provisioned(&cloud, 1).await;
        let bad = SnapshotSpec {
            name_tpl: "img-{role.size}".into(),
            ..spec()
        };

        let err = SnapshotOrchestrator::new(tracker(cloud.clone()), "images")
            .snapshot(&scope(), &bad, None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnresolvedToken { ref token, .. } if token == "role.size"));
        assert!(cloud.copies().is_empty());
        assert!(cloud.images().is_empty());
    }

    #[test]
    fn role_context_covers_every_snapshot_token() {
        let ctx = role_context(&RoleInfo::default());
        for token in ROLE_TOKENS {
            assert!(ctx.get(token).is_some(), "{token} missing from role context");
        }
    }

    #[test]
    fn role_context_exposes_role_attributes() {
        let role = RoleInfo {
            role_name: "vmabc".into(),
            instance_name: "vmabc".into(),
            instance_status: "StoppedDeallocated".into(),
            host_name: "web-0".into(),
            ..RoleInfo::default()
        };
        let ctx = role_context(&role);
        assert_eq!(
            resolve("{role.host_name}/{role.instance_status}", &ctx).unwrap(),
            "web-0/StoppedDeallocated"
        );
    }
}
