//! Objects backing an OVA inventory server: an NFS persistent volume, the claim bound to it,
//! the catalog Deployment and its Service.

use super::conversion::nfs_export;
use crate::error::ControllerError;
use crate::reconcile_helpers::owner_reference;
use crds::{labels, settings, OVAProviderServer, Provider};
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Port the catalog server listens on
pub const SERVER_PORT: i32 = 8080;

/// Where the export is mounted in the catalog container
pub const CATALOG_PATH: &str = "/ova";

/// Group the catalog process runs with
pub const CATALOG_GROUP: i64 = 107;

const SUBAPP: &str = "ova-server";
const VOLUME_SIZE: &str = "1Gi";

/// Name of the server record of a provider
pub fn server_name(provider_uid: &str) -> String {
    format!("ova-server-{}", super::uid_prefix(provider_uid))
}

/// Labels shared by every object of a server
pub fn server_labels(provider_uid: &str, server_uid: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::APP.to_string(), super::APP.to_string()),
        (labels::SUBAPP.to_string(), SUBAPP.to_string()),
        (labels::PROVIDER.to_string(), super::label_value(provider_uid)),
        (labels::SERVER.to_string(), super::label_value(server_uid)),
    ])
}

/// Selector of every server object created for a provider
pub fn provider_selector(provider_uid: &str) -> String {
    format!(
        "{}={},{}={},{}={}",
        labels::APP,
        super::APP,
        labels::PROVIDER,
        super::label_value(provider_uid),
        labels::SUBAPP,
        SUBAPP
    )
}

/// Server record the Provider controller ensures for an OVA provider
pub fn build_server_record(provider: &Provider, namespace: &str) -> OVAProviderServer {
    let uid = provider.uid().unwrap_or_default();
    let mut server = OVAProviderServer::new(&server_name(&uid), crds::OVAProviderServerSpec {
        provider: crds::ResourceRef::with_namespace(provider.name_any(), provider.namespace().unwrap_or_default()),
    });
    server.metadata.namespace = Some(namespace.to_string());
    server.metadata.labels = Some(BTreeMap::from([
        (labels::APP.to_string(), super::APP.to_string()),
        (labels::SUBAPP.to_string(), SUBAPP.to_string()),
        (labels::PROVIDER.to_string(), super::label_value(&uid)),
    ]));
    server
}

/// The pieces every server object needs
#[derive(Debug, Clone)]
pub struct ServerContext<'a> {
    /// Server record
    pub server: &'a OVAProviderServer,
    /// OVA provider
    pub provider: &'a Provider,
    /// Catalog image
    pub image: &'a str,
}

impl ServerContext<'_> {
    fn name(&self) -> String {
        self.server.name_any()
    }

    fn namespace(&self) -> String {
        self.server.namespace().unwrap_or_default()
    }

    fn labels(&self) -> BTreeMap<String, String> {
        server_labels(&self.provider.uid().unwrap_or_default(), &self.server.uid().unwrap_or_default())
    }

    fn meta(&self, owned: bool) -> metav1::ObjectMeta {
        metav1::ObjectMeta {
            name: Some(self.name()),
            namespace: Some(self.namespace()),
            labels: Some(self.labels()),
            owner_references: owned.then(|| owner_reference(self.server).into_iter().collect()),
            ..metav1::ObjectMeta::default()
        }
    }

    /// Name of the cluster-scoped volume (unique across controller namespaces)
    pub fn volume_name(&self) -> String {
        format!("{}-{}", self.name(), self.namespace())
    }
}

/// Retain volume on the provider's NFS export. Not owned by the server record.
pub fn build_volume(ctx: &ServerContext<'_>) -> Result<corev1::PersistentVolume, ControllerError> {
    let (server, path) = nfs_export(&ctx.provider.spec.url)?;
    Ok(corev1::PersistentVolume {
        metadata: metav1::ObjectMeta {
            name: Some(ctx.volume_name()),
            labels: Some(ctx.labels()),
            ..metav1::ObjectMeta::default()
        },
        spec: Some(corev1::PersistentVolumeSpec {
            capacity: Some(BTreeMap::from([("storage".to_string(), Quantity(VOLUME_SIZE.to_string()))])),
            access_modes: Some(vec!["ReadOnlyMany".to_string()]),
            persistent_volume_reclaim_policy: Some("Retain".to_string()),
            storage_class_name: Some(String::new()),
            nfs: Some(corev1::NFSVolumeSource {
                server: server.to_string(),
                path: path.to_string(),
                read_only: Some(true),
            }),
            ..corev1::PersistentVolumeSpec::default()
        }),
        ..corev1::PersistentVolume::default()
    })
}

/// Claim bound to [`build_volume`]
pub fn build_claim(ctx: &ServerContext<'_>) -> corev1::PersistentVolumeClaim {
    corev1::PersistentVolumeClaim {
        metadata: ctx.meta(true),
        spec: Some(corev1::PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadOnlyMany".to_string()]),
            resources: Some(corev1::VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(VOLUME_SIZE.to_string()))])),
                ..corev1::VolumeResourceRequirements::default()
            }),
            storage_class_name: Some(String::new()),
            volume_name: Some(ctx.volume_name()),
            ..corev1::PersistentVolumeClaimSpec::default()
        }),
        ..corev1::PersistentVolumeClaim::default()
    }
}

/// Catalog Deployment with the claim mounted read-only
pub fn build_deployment(ctx: &ServerContext<'_>) -> appsv1::Deployment {
    let labels = ctx.labels();
    let appliance_management = ctx
        .provider
        .spec
        .settings
        .get(settings::APPLIANCE_MANAGEMENT)
        .cloned()
        .unwrap_or_else(|| "false".to_string());
    let env = vec![
        corev1::EnvVar {
            name: "CATALOG_PATH".to_string(),
            value: Some(CATALOG_PATH.to_string()),
            ..corev1::EnvVar::default()
        },
        corev1::EnvVar {
            name: "PROVIDER_NAMESPACE".to_string(),
            value: ctx.provider.namespace(),
            ..corev1::EnvVar::default()
        },
        corev1::EnvVar {
            name: "PROVIDER_NAME".to_string(),
            value: Some(ctx.provider.name_any()),
            ..corev1::EnvVar::default()
        },
        corev1::EnvVar {
            name: "APPLIANCE_MANAGEMENT".to_string(),
            value: Some(appliance_management),
            ..corev1::EnvVar::default()
        },
    ];
    appsv1::Deployment {
        metadata: ctx.meta(true),
        spec: Some(appsv1::DeploymentSpec {
            replicas: Some(1),
            selector: metav1::LabelSelector {
                match_labels: Some(labels.clone()),
                ..metav1::LabelSelector::default()
            },
            template: corev1::PodTemplateSpec {
                metadata: Some(metav1::ObjectMeta {
                    labels: Some(labels),
                    ..metav1::ObjectMeta::default()
                }),
                spec: Some(corev1::PodSpec {
                    security_context: Some(corev1::PodSecurityContext {
                        run_as_non_root: Some(true),
                        supplemental_groups: Some(vec![CATALOG_GROUP]),
                        seccomp_profile: Some(corev1::SeccompProfile {
                            type_: "RuntimeDefault".to_string(),
                            ..corev1::SeccompProfile::default()
                        }),
                        ..corev1::PodSecurityContext::default()
                    }),
                    containers: vec![corev1::Container {
                        name: "ova-server".to_string(),
                        image: Some(ctx.image.to_string()),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        ports: Some(vec![corev1::ContainerPort {
                            container_port: SERVER_PORT,
                            name: Some("api".to_string()),
                            protocol: Some("TCP".to_string()),
                            ..corev1::ContainerPort::default()
                        }]),
                        env: Some(env),
                        security_context: Some(corev1::SecurityContext {
                            allow_privilege_escalation: Some(false),
                            capabilities: Some(corev1::Capabilities {
                                drop: Some(vec!["ALL".to_string()]),
                                ..corev1::Capabilities::default()
                            }),
                            ..corev1::SecurityContext::default()
                        }),
                        volume_mounts: Some(vec![corev1::VolumeMount {
                            name: "catalog".to_string(),
                            mount_path: CATALOG_PATH.to_string(),
                            read_only: Some(true),
                            ..corev1::VolumeMount::default()
                        }]),
                        ..corev1::Container::default()
                    }],
                    volumes: Some(vec![corev1::Volume {
                        name: "catalog".to_string(),
                        persistent_volume_claim: Some(corev1::PersistentVolumeClaimVolumeSource {
                            claim_name: ctx.name(),
                            read_only: Some(true),
                        }),
                        ..corev1::Volume::default()
                    }]),
                    ..corev1::PodSpec::default()
                }),
            },
            ..appsv1::DeploymentSpec::default()
        }),
        ..appsv1::Deployment::default()
    }
}

/// ClusterIP Service in front of the catalog
pub fn build_service(ctx: &ServerContext<'_>) -> corev1::Service {
    corev1::Service {
        metadata: ctx.meta(true),
        spec: Some(corev1::ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(ctx.labels()),
            ports: Some(vec![corev1::ServicePort {
                name: Some("api".to_string()),
                port: SERVER_PORT,
                target_port: Some(IntOrString::Int(SERVER_PORT)),
                protocol: Some("TCP".to_string()),
                ..corev1::ServicePort::default()
            }]),
            ..corev1::ServiceSpec::default()
        }),
        ..corev1::Service::default()
    }
}

/// True once at least one ready address backs the Service
pub fn endpoints_ready(endpoints: &corev1::Endpoints) -> bool {
    endpoints
        .subsets
        .iter()
        .flatten()
        .any(|s| s.addresses.as_ref().is_some_and(|a| !a.is_empty()))
}
