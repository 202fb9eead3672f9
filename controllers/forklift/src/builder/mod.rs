//! Target-side object builders.
//!
//! Every builder is a pure function from migration state to a typed Kubernetes object (or a
//! `DynamicObject` for kinds k8s-openapi does not model). The migration driver hands the
//! results to a [`crate::cluster::TargetCluster`].

pub mod conversion;
pub mod hook;
pub mod ova_server;
pub mod vm;
pub mod volume;

use crate::reconcile_helpers::label_selector;
use crate::template::{Template, TemplateData, Value, MAX_LABEL_LENGTH};
use crds::{labels, Plan, PlanVm, VmStatus};
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Value of `app` on every object created by the controller
pub const APP: &str = "forklift";

/// Length of the UID prefix used in generated names
const UID_PREFIX: usize = 8;

/// Lower-case a string into a DNS-1123 label: invalid runs become `-`, leading and
/// trailing dashes are dropped, the result is cut to 63 characters.
pub fn dns_label(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let mut out: String = out.trim_matches('-').chars().take(MAX_LABEL_LENGTH).collect();
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Make a value usable as a label value (63 characters of `[A-Za-z0-9._-]`)
pub fn label_value(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '-' })
        .take(MAX_LABEL_LENGTH)
        .collect();
    cleaned.trim_matches(|c: char| !c.is_ascii_alphanumeric()).to_string()
}

/// First characters of a UID
pub fn uid_prefix(uid: &str) -> &str {
    match uid.char_indices().nth(UID_PREFIX) {
        Some((i, _)) => &uid[..i],
        None => uid,
    }
}

/// Labels selecting everything a migration created
pub fn migration_labels(migration_uid: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(labels::MIGRATION.to_string(), label_value(migration_uid))])
}

/// Selector for everything a migration created
pub fn migration_selector(migration_uid: &str) -> String {
    label_selector(&migration_labels(migration_uid))
}

/// Identity of one VM within one migration, shared by every object built for it
#[derive(Debug, Clone)]
pub struct VmContext<'a> {
    /// The plan being executed
    pub plan: &'a Plan,
    /// Plan entry of the VM
    pub plan_vm: &'a PlanVm,
    /// Status record of the VM
    pub vm: &'a VmStatus,
    /// UID of the running migration
    pub migration_uid: &'a str,
}

impl VmContext<'_> {
    /// Namespace all target objects go to
    pub fn namespace(&self) -> &str {
        &self.plan.spec.target_namespace
    }

    /// Labels identifying the VM's objects
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut out = migration_labels(self.migration_uid);
        out.insert(labels::PLAN.to_string(), label_value(&self.plan.uid().unwrap_or_default()));
        out.insert(labels::VM_ID.to_string(), label_value(&self.vm.id));
        out
    }

    /// Selector matching [`Self::labels`] without the plan label
    pub fn selector(&self) -> String {
        let mut labels = migration_labels(self.migration_uid);
        labels.insert(crds::labels::VM_ID.to_string(), label_value(&self.vm.id));
        label_selector(&labels)
    }

    /// Name stem of scratch objects: `<migration uid prefix>-<vm id>`
    pub fn base_name(&self) -> String {
        let stem = format!("{}-{}", uid_prefix(self.migration_uid), dns_label(&self.vm.id));
        dns_label(&stem)
    }

    /// Name of a scratch object for one disk
    pub fn disk_object_name(&self, index: usize) -> String {
        let suffix = format!("-{}", index);
        let stem: String = self.base_name().chars().take(MAX_LABEL_LENGTH - suffix.len()).collect();
        format!("{}{}", stem.trim_end_matches('-'), suffix)
    }

    /// Name of a per-VM scratch object with a role suffix (`-v2v`, `-prehook`)
    pub fn role_name(&self, role: &str) -> String {
        let suffix = format!("-{}", role);
        let stem: String = self.base_name().chars().take(MAX_LABEL_LENGTH - suffix.len()).collect();
        format!("{}{}", stem.trim_end_matches('-'), suffix)
    }

    /// Name of the target VM
    pub fn target_name(&self) -> String {
        if let Some(name) = self.vm.target_name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        dns_label(&self.vm.name)
    }
}

/// Where a run-to-completion workload (conversion pod, hook job) stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Not finished
    Running,
    /// Completed successfully
    Succeeded,
    /// Gave up; carries the termination message or reason
    Failed(String),
}

/// How a claim is named
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimName {
    /// Literal name
    Fixed(String),
    /// `generateName` prefix; the server appends a random suffix
    Prefix(String),
}

/// Inputs of the PVC name template for one disk
pub struct DiskNaming<'a> {
    /// Position of the disk in the VM
    pub index: usize,
    /// Disk file (VMDK, OVA member), may be empty
    pub file: &'a str,
    /// Attached to more than one VM
    pub shared: bool,
}

fn file_stem(file: &str) -> &str {
    let base = file.rsplit(['/', ' ', ']']).next().unwrap_or(file);
    base.split('.').next().unwrap_or(base)
}

/// Name of the claim of one disk.
///
/// A per-VM template wins over the plan template. Without any template the claim gets the
/// generated prefix `<target-name>-disk-<index>-`.
pub fn claim_name(ctx: &VmContext<'_>, disk: &DiskNaming<'_>) -> Result<ClaimName, crate::error::ControllerError> {
    let source = ctx
        .plan_vm
        .pvc_name_template
        .as_deref()
        .or(ctx.plan.spec.pvc_name_template.as_deref())
        .filter(|t| !t.is_empty());
    let generate = ctx.plan.spec.pvc_name_template_use_generate_name;
    let Some(source) = source else {
        return Ok(ClaimName::Prefix(format!("{}-disk-{}-", ctx.target_name(), disk.index)));
    };

    let root = ctx.plan_vm.root_disk_index.unwrap_or(0);
    let letter = ctx
        .plan_vm
        .win_drive_letters
        .get(disk.index)
        .cloned()
        .unwrap_or_default();
    let data = TemplateData::from([
        ("VmName", Value::from(ctx.target_name())),
        ("PlanName", Value::from(ctx.plan.name_any())),
        ("DiskIndex", Value::from(disk.index)),
        ("WinDriveLetter", Value::from(letter)),
        ("RootDiskIndex", Value::from(root)),
        ("Shared", Value::from(disk.shared)),
        ("FileName", Value::from(file_stem(disk.file))),
    ]);
    let rendered = Template::parse(source)?.render(&data)?;
    crate::template::validate_rendered(&rendered, generate)?;
    Ok(if generate { ClaimName::Prefix(rendered) } else { ClaimName::Fixed(rendered) })
}

/// Render an optional volume or network name template, falling back to `default`
pub(crate) fn render_or(
    source: Option<&str>,
    data: &TemplateData,
    default: String,
) -> Result<String, crate::error::ControllerError> {
    let Some(source) = source.filter(|s| !s.is_empty()) else {
        return Ok(default);
    };
    let rendered = Template::parse(source)?.render(data)?;
    crate::template::validate_rendered(&rendered, false)?;
    Ok(rendered)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crds::{PlanSpec, SourceRef};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    pub fn plan() -> Plan {
        Plan {
            metadata: ObjectMeta {
                name: Some("move-web".to_string()),
                namespace: Some("apps".to_string()),
                uid: Some("plan-uid".to_string()),
                ..Default::default()
            },
            spec: PlanSpec {
                target_namespace: "target".to_string(),
                ..Default::default()
            },
            status: None,
        }
    }

    pub fn plan_vm() -> PlanVm {
        PlanVm {
            source: SourceRef { id: "vm-42".into(), name: "Web_01".into() },
            ..Default::default()
        }
    }

    pub fn vm_status() -> VmStatus {
        VmStatus {
            id: "vm-42".into(),
            name: "Web_01".into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_dns_label() {
        assert_eq!(dns_label("Web_Server 01"), "web-server-01");
        assert_eq!(dns_label("--a--"), "a");
        assert_eq!(dns_label(&"x".repeat(80)).len(), 63);
    }

    #[test]
    fn test_label_value() {
        assert_eq!(label_value("vm-42"), "vm-42");
        assert_eq!(label_value("[ds1] web/web.vmdk"), "ds1--web-web.vmdk");
        assert!(label_value(&"a".repeat(70)).len() <= 63);
    }

    #[test]
    fn test_names() {
        let (plan, plan_vm, vm) = (plan(), plan_vm(), vm_status());
        let ctx = VmContext { plan: &plan, plan_vm: &plan_vm, vm: &vm, migration_uid: "0123456789abcdef" };
        assert_eq!(ctx.base_name(), "01234567-vm-42");
        assert_eq!(ctx.disk_object_name(1), "01234567-vm-42-1");
        assert_eq!(ctx.role_name("v2v"), "01234567-vm-42-v2v");
        assert_eq!(ctx.target_name(), "web-01");
        assert_eq!(ctx.selector(), "migration=0123456789abcdef,vmID=vm-42");
        assert_eq!(ctx.labels().get("plan").map(String::as_str), Some("plan-uid"));
    }

    #[test]
    fn test_claim_name_default_and_template() {
        let (mut plan, mut plan_vm, vm) = (plan(), plan_vm(), vm_status());
        let disk = DiskNaming { index: 2, file: "[ds1] web/web_1.vmdk", shared: false };
        {
            let ctx = VmContext { plan: &plan, plan_vm: &plan_vm, vm: &vm, migration_uid: "m" };
            assert_eq!(claim_name(&ctx, &disk).unwrap(), ClaimName::Prefix("web-01-disk-2-".into()));
        }

        plan.spec.pvc_name_template = Some("{{.PlanName}}-{{.DiskIndex}}".into());
        plan.spec.pvc_name_template_use_generate_name = false;
        {
            let ctx = VmContext { plan: &plan, plan_vm: &plan_vm, vm: &vm, migration_uid: "m" };
            assert_eq!(claim_name(&ctx, &disk).unwrap(), ClaimName::Fixed("move-web-2".into()));
        }

        plan_vm.pvc_name_template = Some(r#"{{ .FileName | lower | replace "_" "-" }}"#.into());
        let ctx = VmContext { plan: &plan, plan_vm: &plan_vm, vm: &vm, migration_uid: "m" };
        assert_eq!(claim_name(&ctx, &disk).unwrap(), ClaimName::Fixed("web-1".into()));
    }
}
