// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::flavor::Flavor;
use crate::provider::FakeProvider;
use crate::record::HostRecord;

fn test_host(n: u32, provider: Arc<FakeProvider>) -> Arc<Host> {
    Host::new(
        HostConfig {
            record: HostRecord {
                id: format!("srv-{}", n),
                name: format!("muster-host-{}", n),
                ip: format!("10.0.0.{}", n),
                flavor: Flavor::new("f1", "m1.large", 4, 16_384, 100),
                key_ref: "muster-key".to_string(),
                namespace: String::new(),
            },
            user: "ubuntu".to_string(),
            ttd: Duration::ZERO,
            ssh: SshConfig::default(),
        },
        provider,
    )
}

fn req() -> Requirements {
    Requirements::new(2, 4096, 10, Duration::from_secs(600))
}

#[test]
fn placement_tracks_capacity_through_place_and_release() {
    let provider = Arc::new(FakeProvider::new());
    let placement = Placement::new(
        Arc::clone(&provider) as Arc<dyn Provider>,
        "ubuntu",
        Duration::ZERO,
        SshConfig::default(),
    );
    placement.add_host(test_host(1, Arc::clone(&provider)));

    assert_eq!(placement.can_fit(&req()), 2);

    let (_, token_a) = placement.place(&req()).unwrap();
    let (_, token_b) = placement.place(&req()).unwrap();
    assert_eq!(placement.can_fit(&req()), 0);

    assert!(matches!(placement.place(&req()), Err(PlacementError::NoCapacityNow)));

    token_a.release();
    assert_eq!(placement.can_fit(&req()), 1);
    drop(token_b);
}

#[test]
fn place_is_first_fit_in_creation_order() {
    let provider = Arc::new(FakeProvider::new());
    let placement = Placement::new(
        Arc::clone(&provider) as Arc<dyn Provider>,
        "ubuntu",
        Duration::ZERO,
        SshConfig::default(),
    );
    placement.add_host(test_host(1, Arc::clone(&provider)));
    placement.add_host(test_host(2, Arc::clone(&provider)));

    let (host, _token) = placement.place(&req()).unwrap();
    assert_eq!(host.id(), "srv-1");
}

#[test]
fn place_skips_quarantined_and_destroyed_hosts() {
    let provider = Arc::new(FakeProvider::new());
    let placement = Placement::new(
        Arc::clone(&provider) as Arc<dyn Provider>,
        "ubuntu",
        Duration::ZERO,
        SshConfig::default(),
    );
    let bad = test_host(1, Arc::clone(&provider));
    bad.gone_bad(None);
    placement.add_host(bad);
    placement.add_host(test_host(2, Arc::clone(&provider)));

    let (host, _token) = placement.place(&req()).unwrap();
    assert_eq!(host.id(), "srv-2");

    assert_eq!(placement.can_fit(&req()), 2, "quarantined host is invisible to can_fit");
}

#[test]
fn local_provider_cannot_grow() {
    let provider = Arc::new(FakeProvider::new());
    let placement = Placement::new(
        Arc::clone(&provider) as Arc<dyn Provider>,
        "ubuntu",
        Duration::ZERO,
        SshConfig::default(),
    );
    assert!(matches!(placement.place(&req()), Err(PlacementError::NoCapacityNow)));
    assert!(provider.spawn_requests().is_empty());
}

#[tokio::test]
async fn cloud_provider_grows_in_the_background() {
    let provider = Arc::new(FakeProvider::cloud());
    let placement = Placement::new(
        Arc::clone(&provider) as Arc<dyn Provider>,
        "ubuntu",
        Duration::ZERO,
        SshConfig::default(),
    );

    assert!(matches!(placement.place(&req()), Err(PlacementError::NoCapacityNow)));
    // a second miss while the first request is in flight must not stampede
    assert!(matches!(placement.place(&req()), Err(PlacementError::NoCapacityNow)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(provider.spawn_requests().len(), 1);
    assert_eq!(placement.hosts().len(), 1);

    let (host, _token) = placement.place(&req()).unwrap();
    assert_eq!(host.id(), "fake-1");
}

#[test]
fn can_fit_reports_the_best_single_host_not_the_sum() {
    let provider = Arc::new(FakeProvider::new());
    let placement = Placement::new(
        Arc::clone(&provider) as Arc<dyn Provider>,
        "ubuntu",
        Duration::ZERO,
        SshConfig::default(),
    );
    placement.add_host(test_host(1, Arc::clone(&provider)));
    placement.add_host(test_host(2, Arc::clone(&provider)));

    // each host fits 2; a single host is the answer, not 4
    assert_eq!(placement.can_fit(&req()), 2);
}
