//! EC2 query API client

use crate::endpoint::{set_query, Endpoint};
use crate::error::Ec2Error;
use crate::sigv4::{Credentials, Signer};
use crate::xml;
use chrono::Utc;
use reqwest::{Client, Url};
use std::time::Duration;
use tracing::debug;

const API_VERSION: &str = "2016-11-15";

/// EC2 instance state name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    Unknown(String),
}

impl InstanceState {
    pub fn from_name(name: &str) -> Self {
        match name {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Whether the instance counts as powered on
    pub fn is_on(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Stopping)
    }
}

/// EBS snapshot state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotState {
    Pending,
    Completed,
    Error,
    Unknown(String),
}

impl SnapshotState {
    pub fn from_name(name: &str) -> Self {
        match name {
            "pending" => Self::Pending,
            "completed" => Self::Completed,
            "error" => Self::Error,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// EBS snapshot summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub volume_id: String,
    pub state: SnapshotState,
    /// Percent complete
    pub progress: u8,
}

/// EC2 API client
#[derive(Debug, Clone)]
pub struct Ec2Client {
    client: Client,
    endpoint: Endpoint,
    signer: Signer,
}

impl Ec2Client {
    /// Create a client for `region`
    ///
    /// # Arguments
    /// * `region` - AWS region (e.g., "us-east-1")
    /// * `credentials` - Static credentials from the provider secret
    /// * `endpoint` - Optional endpoint override (e.g., a VPC endpoint)
    pub fn new(region: &str, credentials: Credentials, endpoint: Option<&str>) -> Result<Self, Ec2Error> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            endpoint: Endpoint::resolve("ec2", region, endpoint)?,
            signer: Signer::new(credentials, region, "ec2"),
        })
    }

    fn action_url(&self, action: &str, params: &[(String, String)]) -> Url {
        let mut url = self.endpoint.url.clone();
        let mut query = vec![("Action", action), ("Version", API_VERSION)];
        query.extend(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        set_query(&mut url, &query);
        url
    }

    async fn call(&self, action: &str, params: &[(String, String)]) -> Result<String, Ec2Error> {
        let url = self.action_url(action, params);
        debug!("EC2 {} {}", action, self.endpoint.region);

        let mut request = self.client.get(url.clone());
        for (name, value) in self.signer.sign("GET", &url, &[], b"", Utc::now())? {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(parse_error(&body).unwrap_or_else(|| Ec2Error::Api {
                code: status.as_u16().to_string(),
                message: body.chars().take(500).collect(),
            }));
        }
        Ok(body)
    }

    /// Current state of an instance
    pub async fn instance_state(&self, instance_id: &str) -> Result<InstanceState, Ec2Error> {
        let body = self
            .call("DescribeInstances", &[("InstanceId.1".to_string(), instance_id.to_string())])
            .await?;
        parse_instance_state(&body)
    }

    /// Request an instance stop
    pub async fn stop_instance(&self, instance_id: &str) -> Result<(), Ec2Error> {
        self.call("StopInstances", &[("InstanceId.1".to_string(), instance_id.to_string())])
            .await
            .map(|_| ())
    }

    /// Request an instance start
    pub async fn start_instance(&self, instance_id: &str) -> Result<(), Ec2Error> {
        self.call("StartInstances", &[("InstanceId.1".to_string(), instance_id.to_string())])
            .await
            .map(|_| ())
    }

    /// Snapshot a volume, tagging the snapshot so it can be found again
    pub async fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
        tags: &[(String, String)],
    ) -> Result<String, Ec2Error> {
        let mut params = vec![
            ("VolumeId".to_string(), volume_id.to_string()),
            ("Description".to_string(), description.to_string()),
        ];
        if !tags.is_empty() {
            params.push(("TagSpecification.1.ResourceType".to_string(), "snapshot".to_string()));
            for (i, (k, v)) in tags.iter().enumerate() {
                params.push((format!("TagSpecification.1.Tag.{}.Key", i + 1), k.clone()));
                params.push((format!("TagSpecification.1.Tag.{}.Value", i + 1), v.clone()));
            }
        }
        let body = self.call("CreateSnapshot", &params).await?;
        xml::text(&body, "snapshotId")
            .map(str::to_string)
            .ok_or_else(|| Ec2Error::Malformed("CreateSnapshot: missing snapshotId".to_string()))
    }

    /// Describe one snapshot
    pub async fn describe_snapshot(&self, snapshot_id: &str) -> Result<Snapshot, Ec2Error> {
        let body = self
            .call("DescribeSnapshots", &[("SnapshotId.1".to_string(), snapshot_id.to_string())])
            .await?;
        parse_snapshots(&body)
            .into_iter()
            .next()
            .ok_or_else(|| Ec2Error::Api {
                code: "InvalidSnapshot.NotFound".to_string(),
                message: snapshot_id.to_string(),
            })
    }

    /// Snapshots carrying a tag
    pub async fn find_snapshots(&self, tag_key: &str, tag_value: &str) -> Result<Vec<Snapshot>, Ec2Error> {
        let body = self
            .call(
                "DescribeSnapshots",
                &[
                    ("Filter.1.Name".to_string(), format!("tag:{}", tag_key)),
                    ("Filter.1.Value.1".to_string(), tag_value.to_string()),
                ],
            )
            .await?;
        Ok(parse_snapshots(&body))
    }

    /// Delete a snapshot; a snapshot that is already gone counts as deleted
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), Ec2Error> {
        match self
            .call("DeleteSnapshot", &[("SnapshotId".to_string(), snapshot_id.to_string())])
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn parse_error(body: &str) -> Option<Ec2Error> {
    let error = xml::section(body, "Error")?;
    Some(Ec2Error::Api {
        code: xml::text(error, "Code")?.to_string(),
        message: xml::unescape(xml::text(error, "Message").unwrap_or_default()),
    })
}

fn parse_instance_state(body: &str) -> Result<InstanceState, Ec2Error> {
    let state = xml::section(body, "instanceState")
        .and_then(|s| xml::text(s, "name"))
        .ok_or_else(|| Ec2Error::Api {
            code: "InvalidInstanceID.NotFound".to_string(),
            message: "instance not present in DescribeInstances response".to_string(),
        })?;
    Ok(InstanceState::from_name(state))
}

fn parse_snapshots(body: &str) -> Vec<Snapshot> {
    let Some(set) = xml::section(body, "snapshotSet") else {
        return Vec::new();
    };
    xml::sections(set, "item")
        .into_iter()
        .filter_map(|item| {
            Some(Snapshot {
                id: xml::text(item, "snapshotId")?.to_string(),
                volume_id: xml::text(item, "volumeId").unwrap_or_default().to_string(),
                state: SnapshotState::from_name(xml::text(item, "status").unwrap_or_default()),
                progress: xml::text(item, "progress")
                    .and_then(|p| p.trim_end_matches('%').parse().ok())
                    .unwrap_or(0),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_document() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<Response><Errors><Error><Code>InvalidSnapshot.NotFound</Code><Message>The snapshot &apos;snap-1&apos; does not exist.</Message></Error></Errors><RequestID>r</RequestID></Response>"#;
        let err = parse_error(body).unwrap();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "AWS error InvalidSnapshot.NotFound: The snapshot 'snap-1' does not exist.");
    }

    #[test]
    fn test_parse_instance_state() {
        let body = r#"<DescribeInstancesResponse><reservationSet><item><instancesSet><item>
            <instanceId>i-1</instanceId><instanceState><code>80</code><name>stopped</name></instanceState>
        </item></instancesSet></item></reservationSet></DescribeInstancesResponse>"#;
        let state = parse_instance_state(body).unwrap();
        assert_eq!(state, InstanceState::Stopped);
        assert!(!state.is_on());

        let empty = "<DescribeInstancesResponse><reservationSet/></DescribeInstancesResponse>";
        assert!(parse_instance_state(empty).unwrap_err().is_not_found());
    }

    #[test]
    fn test_parse_snapshots() {
        let body = r#"<DescribeSnapshotsResponse><snapshotSet>
            <item><snapshotId>snap-1</snapshotId><volumeId>vol-1</volumeId><status>pending</status><progress>42%</progress></item>
            <item><snapshotId>snap-2</snapshotId><volumeId>vol-2</volumeId><status>completed</status><progress>100%</progress></item>
        </snapshotSet></DescribeSnapshotsResponse>"#;
        let snaps = parse_snapshots(body);
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].progress, 42);
        assert_eq!(snaps[1].state, SnapshotState::Completed);
    }

    #[test]
    fn test_action_url() {
        let creds = Credentials::new("AKID", "SECRET").unwrap();
        let client = Ec2Client::new("us-east-1", creds, None).unwrap();
        let url = client.action_url("StopInstances", &[("InstanceId.1".to_string(), "i-1".to_string())]);
        assert_eq!(
            url.as_str(),
            "https://ec2.us-east-1.amazonaws.com/?Action=StopInstances&Version=2016-11-15&InstanceId.1=i-1"
        );
    }
}
