//! Populator objects as seen by the controller
//!
//! The five populator kinds share a status shape and differ only in their spec. They are read
//! through the dynamic API so a single reconciler serves every kind.

use crate::error::ControllerError;
use crds::{
    Ec2VolumePopulatorSpec, OffloadPluginVolumePopulatorSpec, OpenstackVolumePopulatorSpec,
    OvirtVolumePopulatorSpec, PopulatorKind, PopulatorStatus, VSphereXcopyVolumePopulatorSpec,
};
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};

/// API resource of a populator kind
pub fn api_resource(kind: PopulatorKind) -> ApiResource {
    let gvk = GroupVersionKind::gvk(crds::GROUP, crds::VERSION, kind.kind());
    ApiResource::from_gvk(&gvk)
}

/// Source coordinates of one populator object
#[derive(Debug, Clone, PartialEq)]
pub enum PopulatorSource {
    Ovirt(OvirtVolumePopulatorSpec),
    Openstack(OpenstackVolumePopulatorSpec),
    Ec2(Ec2VolumePopulatorSpec),
    VSphereXcopy(VSphereXcopyVolumePopulatorSpec),
    OffloadPlugin(OffloadPluginVolumePopulatorSpec),
}

/// Identity of the populator object and the claim being filled, passed to the worker
#[derive(Debug, Clone)]
pub struct WorkerTarget<'a> {
    pub cr_name: &'a str,
    pub cr_namespace: &'a str,
    pub volume_path: &'a str,
    pub claim_name: &'a str,
}

impl PopulatorSource {
    /// Decode the spec and status of a populator object
    pub fn from_object(kind: PopulatorKind, obj: &DynamicObject) -> Result<(Self, PopulatorStatus), ControllerError> {
        let spec = obj
            .data
            .get("spec")
            .cloned()
            .ok_or_else(|| ControllerError::Validation(format!("{} has no spec", kind)))?;
        let source = match kind {
            PopulatorKind::Ovirt => Self::Ovirt(serde_json::from_value(spec)?),
            PopulatorKind::Openstack => Self::Openstack(serde_json::from_value(spec)?),
            PopulatorKind::Ec2 => Self::Ec2(serde_json::from_value(spec)?),
            PopulatorKind::VSphereXcopy => Self::VSphereXcopy(serde_json::from_value(spec)?),
            PopulatorKind::OffloadPlugin => Self::OffloadPlugin(serde_json::from_value(spec)?),
        };
        let status = match obj.data.get("status") {
            Some(value) if !value.is_null() => serde_json::from_value(value.clone())?,
            _ => PopulatorStatus::default(),
        };
        Ok((source, status))
    }

    pub fn kind(&self) -> PopulatorKind {
        match self {
            Self::Ovirt(_) => PopulatorKind::Ovirt,
            Self::Openstack(_) => PopulatorKind::Openstack,
            Self::Ec2(_) => PopulatorKind::Ec2,
            Self::VSphereXcopy(_) => PopulatorKind::VSphereXcopy,
            Self::OffloadPlugin(_) => PopulatorKind::OffloadPlugin,
        }
    }

    /// Credential secret injected into the worker with `envFrom`
    pub fn secret_name(&self) -> &str {
        match self {
            Self::Ovirt(spec) => &spec.engine_secret_name,
            Self::Openstack(spec) => &spec.secret_name,
            Self::Ec2(spec) => &spec.secret_name,
            Self::VSphereXcopy(spec) => &spec.secret_name,
            Self::OffloadPlugin(spec) => &spec.secret_name,
        }
    }

    /// Image carried by the object itself (offload plugins only)
    pub fn own_image(&self) -> Option<&str> {
        match self {
            Self::OffloadPlugin(spec) => Some(&spec.image),
            _ => None,
        }
    }

    /// Worker command line
    pub fn args(&self, target: &WorkerTarget<'_>) -> Vec<String> {
        let mut args = vec![
            format!("--volume-path={}", target.volume_path),
            format!("--secret-name={}", self.secret_name()),
            format!("--cr-name={}", target.cr_name),
            format!("--cr-namespace={}", target.cr_namespace),
        ];
        match self {
            Self::Ovirt(spec) => {
                args.push(format!("--engine-url={}", spec.engine_url));
                args.push(format!("--disk-id={}", spec.disk_id));
            }
            Self::Openstack(spec) => {
                args.push(format!("--identity-url={}", spec.identity_url));
                args.push(format!("--image-id={}", spec.image_id));
            }
            Self::Ec2(spec) => {
                args.push(format!("--region={}", spec.region));
                args.push(format!("--snapshot-id={}", spec.snapshot_id));
                if let Some(endpoint) = &spec.endpoint {
                    args.push(format!("--endpoint={}", endpoint));
                }
            }
            Self::VSphereXcopy(spec) => {
                args.push(format!("--source-vm-id={}", spec.vm_id));
                args.push(format!("--source-vmdk={}", spec.vmdk_path));
                args.push(format!("--target-namespace={}", target.cr_namespace));
                args.push(format!("--owner-name={}", target.claim_name));
                args.push(format!("--storage-vendor-product={}", spec.storage_vendor_product));
                if let Some(host) = &spec.migration_host {
                    args.push(format!("--migration-host={}", host));
                }
            }
            Self::OffloadPlugin(spec) => {
                args.push(format!("--source-vm-id={}", spec.vm_id));
                args.push(format!("--source-vmdk={}", spec.vmdk_path));
                args.push(format!("--target-namespace={}", target.cr_namespace));
                args.push(format!("--owner-name={}", target.claim_name));
            }
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dynamic(kind: PopulatorKind, data: serde_json::Value) -> DynamicObject {
        let mut obj = DynamicObject::new("pop", &api_resource(kind)).within("ns");
        obj.data = data;
        obj
    }

    fn target() -> WorkerTarget<'static> {
        WorkerTarget {
            cr_name: "pop",
            cr_namespace: "ns",
            volume_path: "/dev/block",
            claim_name: "vm-disk-0",
        }
    }

    #[test]
    fn test_decode_ovirt_without_status() {
        let obj = dynamic(
            PopulatorKind::Ovirt,
            json!({"spec": {"engineUrl": "https://engine", "engineSecretName": "creds", "diskId": "d-1"}}),
        );
        let (source, status) = PopulatorSource::from_object(PopulatorKind::Ovirt, &obj).unwrap();
        assert_eq!(
            source,
            PopulatorSource::Ovirt(OvirtVolumePopulatorSpec {
                engine_url: "https://engine".to_string(),
                engine_secret_name: "creds".to_string(),
                disk_id: "d-1".to_string(),
            })
        );
        assert_eq!(source.kind(), PopulatorKind::Ovirt);
        assert_eq!(source.secret_name(), "creds");
        assert_eq!(status, PopulatorStatus::default());
    }

    #[test]
    fn test_decode_status_retries() {
        let obj = dynamic(
            PopulatorKind::Ec2,
            json!({
                "spec": {"region": "us-east-1", "secretName": "aws", "snapshotId": "snap-1"},
                "status": {"phase": "Running", "retries": 2}
            }),
        );
        let (_, status) = PopulatorSource::from_object(PopulatorKind::Ec2, &obj).unwrap();
        assert_eq!(status.retries, 2);
    }

    #[test]
    fn test_missing_spec_is_invalid() {
        let obj = dynamic(PopulatorKind::Openstack, json!({}));
        assert!(matches!(
            PopulatorSource::from_object(PopulatorKind::Openstack, &obj),
            Err(ControllerError::Validation(_))
        ));
    }

    #[test]
    fn test_ovirt_args() {
        let source = PopulatorSource::Ovirt(OvirtVolumePopulatorSpec {
            engine_url: "https://engine".to_string(),
            engine_secret_name: "creds".to_string(),
            disk_id: "d-1".to_string(),
        });
        assert_eq!(
            source.args(&target()),
            vec![
                "--volume-path=/dev/block",
                "--secret-name=creds",
                "--cr-name=pop",
                "--cr-namespace=ns",
                "--engine-url=https://engine",
                "--disk-id=d-1",
            ]
        );
    }

    #[test]
    fn test_ec2_endpoint_is_optional() {
        let mut spec = Ec2VolumePopulatorSpec {
            region: "cn-north-1".to_string(),
            secret_name: "aws".to_string(),
            snapshot_id: "snap-1".to_string(),
            endpoint: None,
        };
        let args = PopulatorSource::Ec2(spec.clone()).args(&target());
        assert!(!args.iter().any(|a| a.starts_with("--endpoint")));

        spec.endpoint = Some("https://ebs.local".to_string());
        let args = PopulatorSource::Ec2(spec).args(&target());
        assert!(args.contains(&"--endpoint=https://ebs.local".to_string()));
        assert!(args.contains(&"--snapshot-id=snap-1".to_string()));
    }

    #[test]
    fn test_xcopy_args() {
        let source = PopulatorSource::VSphereXcopy(VSphereXcopyVolumePopulatorSpec {
            vm_id: "vm-42".to_string(),
            vmdk_path: "[ds1] web/web.vmdk".to_string(),
            secret_name: "vsphere".to_string(),
            storage_vendor_product: "ontap".to_string(),
            target_pvc: "vm-disk-0".to_string(),
            migration_host: Some("esx-1".to_string()),
        });
        let args = source.args(&target());
        assert!(args.contains(&"--source-vmdk=[ds1] web/web.vmdk".to_string()));
        assert!(args.contains(&"--owner-name=vm-disk-0".to_string()));
        assert!(args.contains(&"--storage-vendor-product=ontap".to_string()));
        assert!(args.contains(&"--migration-host=esx-1".to_string()));
        assert_eq!(source.own_image(), None);
    }

    #[test]
    fn test_offload_uses_own_image() {
        let source = PopulatorSource::OffloadPlugin(OffloadPluginVolumePopulatorSpec {
            image: "vendor/offload:1".to_string(),
            vm_id: "vm-42".to_string(),
            vmdk_path: "[ds1] web/web.vmdk".to_string(),
            secret_name: "vsphere".to_string(),
            target_pvc: "vm-disk-0".to_string(),
        });
        assert_eq!(source.own_image(), Some("vendor/offload:1"));
        assert!(!source.args(&target()).iter().any(|a| a.starts_with("--storage-vendor-product")));
    }
}
