//! Unit tests for the claim reconciler

#[cfg(test)]
mod tests {
    use crate::reconciler::*;
    use crds::{PopulatorKind, PopulatorPhase, PopulatorStatus};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PersistentVolumeClaim,
        PersistentVolumeClaimSpec, Pod, PodStatus, TypedObjectReference,
    };

    fn running(retries: u32) -> PopulatorStatus {
        PopulatorStatus {
            phase: PopulatorPhase::Running,
            retries,
            ..Default::default()
        }
    }

    fn failed(exit_code: i32) -> PodState {
        PodState::Failed {
            exit_code: Some(exit_code),
            message: "boom".to_string(),
        }
    }

    fn failed_pod(exit_code: i32, message: Option<&str>) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some("Failed".to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "populate".to_string(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code,
                            message: message.map(str::to_string),
                            reason: Some("Error".to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn claim_with_source(api_group: Option<&str>, kind: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            spec: Some(PersistentVolumeClaimSpec {
                data_source_ref: Some(TypedObjectReference {
                    api_group: api_group.map(str::to_string),
                    kind: kind.to_string(),
                    name: "disk-0".to_string(),
                    namespace: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_waits_for_missing_populator() {
        assert_eq!(next_step(false, None, false, &PodState::Missing, 3), Step::WaitForPopulator);
    }

    #[test]
    fn test_creates_prime_then_pod() {
        let status = PopulatorStatus::default();
        assert_eq!(next_step(false, Some(&status), false, &PodState::Missing, 3), Step::CreatePrimeClaim);
        assert_eq!(next_step(false, Some(&status), true, &PodState::Missing, 3), Step::CreatePod);
        assert_eq!(next_step(false, Some(&running(0)), true, &PodState::Active, 3), Step::Wait);
    }

    #[test]
    fn test_success_rebinds_then_completes() {
        assert_eq!(next_step(false, Some(&running(0)), true, &PodState::Succeeded, 3), Step::Rebind);
        // Once the volume moved, the original claim is bound and scratch objects go away
        assert_eq!(next_step(true, Some(&running(0)), false, &PodState::Succeeded, 3), Step::Complete);
    }

    #[test]
    fn test_rebound_volume_is_not_populated_again() {
        // The rebind records success before the pod and prime claim are deleted; the claim
        // may still be unbound on the next pass
        let recorded: PopulatorStatus = serde_json::from_value(serde_json::json!({
            "phase": "Running",
            "transferred": 512,
            "total": 1024,
        }))
        .unwrap();
        let patch = succeeded_status(&recorded);
        assert_eq!(patch["phase"], "Succeeded");
        assert_eq!(patch["transferred"], 1024);

        let after: PopulatorStatus = serde_json::from_value(patch).unwrap();
        let step = next_step(false, Some(&after), false, &PodState::Missing, 3);
        assert_eq!(step, Step::Complete);
        assert_ne!(step, Step::CreatePrimeClaim);
    }

    #[test]
    fn test_failing_claim_backs_off_per_claim() {
        use crate::backoff::BackoffTable;
        use std::time::Duration;

        let mut claim = claim_with_source(Some(crds::GROUP), "OvirtVolumePopulator");
        claim.metadata.name = Some("vm-disk-0".to_string());
        claim.metadata.namespace = Some("apps".to_string());
        let key = claim_key(&claim);
        assert_eq!(key, "PersistentVolumeClaim/apps/vm-disk-0");

        let table = BackoffTable::new(5, 300);
        let delays: Vec<Duration> = (0..4).map(|_| table.record_failure(&key).delay).collect();
        assert_eq!(delays, [5, 5, 10, 15].map(Duration::from_secs));
        assert_eq!(table.record_failure("PersistentVolumeClaim/apps/other").delay, Duration::from_secs(5));
    }

    #[test]
    fn test_permanent_exit_fails_fast() {
        let step = next_step(false, Some(&running(0)), true, &failed(2), 5);
        assert_eq!(
            step,
            Step::Fail {
                cause: "exit code 2: boom".to_string()
            }
        );
    }

    #[test]
    fn test_transient_exit_retries_until_limit() {
        assert_eq!(
            next_step(false, Some(&running(0)), true, &failed(1), 3),
            Step::Retry {
                retries: 1,
                cause: "exit code 1: boom".to_string()
            }
        );
        assert_eq!(
            next_step(false, Some(&running(2)), true, &failed(1), 3),
            Step::Retry {
                retries: 3,
                cause: "exit code 1: boom".to_string()
            }
        );
        assert!(matches!(
            next_step(false, Some(&running(3)), true, &failed(1), 3),
            Step::Fail { .. }
        ));
    }

    #[test]
    fn test_zero_retry_limit_fails_on_first_error() {
        assert!(matches!(
            next_step(false, Some(&running(0)), true, &failed(1), 0),
            Step::Fail { .. }
        ));
    }

    #[test]
    fn test_failed_populator_stays_failed() {
        let status = PopulatorStatus {
            phase: PopulatorPhase::Failed,
            ..Default::default()
        };
        assert_eq!(next_step(false, Some(&status), true, &failed(1), 3), Step::Stop);
    }

    #[test]
    fn test_pod_state_reads_exit_code() {
        let pod = failed_pod(2, Some("authentication failed\n"));
        assert_eq!(
            PodState::of(Some(&pod)),
            PodState::Failed {
                exit_code: Some(2),
                message: "authentication failed".to_string()
            }
        );
        let pod = failed_pod(1, None);
        assert_eq!(
            PodState::of(Some(&pod)),
            PodState::Failed {
                exit_code: Some(1),
                message: "Error".to_string()
            }
        );
        assert_eq!(PodState::of(None), PodState::Missing);
        assert_eq!(PodState::of(Some(&Pod::default())), PodState::Active);
    }

    #[test]
    fn test_populator_ref_requires_forklift_group() {
        let claim = claim_with_source(Some(crds::GROUP), "Ec2VolumePopulator");
        assert_eq!(populator_ref(&claim), Some((PopulatorKind::Ec2, "disk-0".to_string())));

        let claim = claim_with_source(Some("cdi.kubevirt.io"), "Ec2VolumePopulator");
        assert_eq!(populator_ref(&claim), None);

        let claim = claim_with_source(Some(crds::GROUP), "Plan");
        assert_eq!(populator_ref(&claim), None);

        assert_eq!(populator_ref(&PersistentVolumeClaim::default()), None);
    }
}
