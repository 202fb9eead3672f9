//! Volume Populator Workers
//!
//! Each populator pod runs one of the binaries in this crate. A worker reads credentials from
//! its environment, streams a single source disk into the mounted volume, and reports
//! progress into the status of the populator object that started it.
//!
//! Exit status is part of the contract with the populator controller: `0` on success, `2`
//! for failures that retrying cannot fix, `1` for everything else.

pub mod cli;
pub mod credentials;
pub mod ec2;
pub mod error;
pub mod openstack;
pub mod ovirt;
pub mod progress;
pub mod sink;
pub mod transfer;
pub mod xcopy;

pub use error::PopulatorError;
pub use progress::{KubeStatusWriter, ProgressReporter, StatusWriter};
pub use sink::DiskSink;
