//! EC2 adapter
//!
//! Power changes are `StopInstances`/`StartInstances`. Snapshots are taken per EBS volume and
//! tagged with the snapshot label so a retried create finds the snapshots of an earlier
//! attempt instead of taking new ones.

use super::{required, AdapterError, SecretData, SourceAdapter};
use async_trait::async_trait;
use crds::{settings, PowerState, SnapshotRef};
use ec2_client::{Credentials, Ec2Client, InstanceState, SnapshotState};
use std::collections::BTreeMap;

/// Tag carrying the snapshot label
pub const SNAPSHOT_TAG: &str = "forklift.konveyor.io/snapshot";
/// Tag carrying the source instance
pub const INSTANCE_TAG: &str = "forklift.konveyor.io/vm";

/// Map an instance state; transitional states count as running
pub fn power_state_of(state: &InstanceState) -> PowerState {
    match state {
        InstanceState::Stopped => PowerState::Off,
        InstanceState::Unknown(_) | InstanceState::Terminated | InstanceState::ShuttingDown => PowerState::Unknown,
        s if s.is_on() => PowerState::On,
        _ => PowerState::Unknown,
    }
}

/// Adapter for one EC2 region
pub struct Ec2Adapter {
    client: Ec2Client,
}

impl Ec2Adapter {
    /// Create an adapter; the region comes from the provider settings
    pub fn new(provider_settings: &BTreeMap<String, String>, secret: &SecretData) -> Result<Self, AdapterError> {
        let region = provider_settings
            .get(settings::REGION)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| AdapterError::Credentials(format!("provider setting '{}' is missing", settings::REGION)))?;
        let credentials = Credentials::new(required(secret, "accessKeyId")?, required(secret, "secretAccessKey")?)?
            .with_session_token(secret.get("sessionToken").filter(|t| !t.is_empty()).cloned());
        let endpoint = provider_settings.get("endpoint").map(String::as_str).filter(|e| !e.is_empty());
        Ok(Self { client: Ec2Client::new(region, credentials, endpoint)? })
    }
}

#[async_trait]
impl SourceAdapter for Ec2Adapter {
    async fn test_connection(&self) -> Result<(), AdapterError> {
        // any signed call proves the credentials; an empty tag search is the cheapest
        self.client.find_snapshots(SNAPSHOT_TAG, "connection-test").await?;
        Ok(())
    }

    async fn power_state(&self, vm_id: &str) -> Result<PowerState, AdapterError> {
        Ok(power_state_of(&self.client.instance_state(vm_id).await?))
    }

    async fn power_off(&self, vm_id: &str) -> Result<(), AdapterError> {
        Ok(self.client.stop_instance(vm_id).await?)
    }

    async fn power_on(&self, vm_id: &str) -> Result<(), AdapterError> {
        Ok(self.client.start_instance(vm_id).await?)
    }

    async fn create_snapshot(&self, vm_id: &str, disk_ids: &[String], label: &str) -> Result<Vec<SnapshotRef>, AdapterError> {
        let existing = self.client.find_snapshots(SNAPSHOT_TAG, label).await?;
        let tags = vec![(SNAPSHOT_TAG.to_string(), label.to_string()), (INSTANCE_TAG.to_string(), vm_id.to_string())];
        let mut snapshots = Vec::with_capacity(disk_ids.len());
        for volume in disk_ids {
            let id = match existing.iter().find(|s| &s.volume_id == volume && s.state != SnapshotState::Error) {
                Some(snapshot) => snapshot.id.clone(),
                None => {
                    self.client
                        .create_snapshot(volume, &format!("Migration snapshot {} of {}", label, vm_id), &tags)
                        .await?
                }
            };
            snapshots.push(SnapshotRef { id, disk_id: Some(volume.clone()) });
        }
        Ok(snapshots)
    }

    async fn snapshot_ready(&self, _vm_id: &str, snapshot: &SnapshotRef) -> Result<Option<SnapshotRef>, AdapterError> {
        let current = self.client.describe_snapshot(&snapshot.id).await?;
        match current.state {
            SnapshotState::Completed => Ok(Some(snapshot.clone())),
            SnapshotState::Error => Err(AdapterError::Api { status: 500, message: format!("snapshot {} failed", snapshot.id) }),
            _ => Ok(None),
        }
    }

    async fn remove_snapshot(&self, _vm_id: &str, snapshot: &SnapshotRef) -> Result<(), AdapterError> {
        match self.client.delete_snapshot(&snapshot.id).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => Ok(other?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_state_of() {
        assert_eq!(power_state_of(&InstanceState::Stopped), PowerState::Off);
        assert_eq!(power_state_of(&InstanceState::Running), PowerState::On);
        assert_eq!(power_state_of(&InstanceState::Stopping), PowerState::On);
        assert_eq!(power_state_of(&InstanceState::Terminated), PowerState::Unknown);
    }

    #[test]
    fn test_region_is_required() {
        let secret = SecretData::from([
            ("accessKeyId".to_string(), "AKID".to_string()),
            ("secretAccessKey".to_string(), "secret".to_string()),
        ]);
        assert!(matches!(Ec2Adapter::new(&BTreeMap::new(), &secret), Err(AdapterError::Credentials(_))));
        let settings = BTreeMap::from([(settings::REGION.to_string(), "us-east-1".to_string())]);
        assert!(Ec2Adapter::new(&settings, &secret).is_ok());
    }
}
