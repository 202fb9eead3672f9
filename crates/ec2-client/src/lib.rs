//! EC2 / EBS API Client
//!
//! Small client for the handful of AWS calls a migration needs: instance power control,
//! EBS snapshots, and block-level snapshot reads through the EBS direct API.
//! Requests are signed with AWS Signature Version 4.

pub mod client;
pub mod ebs;
pub mod endpoint;
pub mod error;
pub mod sigv4;
pub mod xml;

pub use client::{Ec2Client, InstanceState, Snapshot, SnapshotState};
pub use ebs::{EbsClient, SnapshotBlock, SnapshotBlocks, EBS_BLOCK_SIZE};
pub use endpoint::Endpoint;
pub use error::Ec2Error;
pub use sigv4::Credentials;
