// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::provider::FakeProvider;
use crate::record::HostRecord;

fn test_host(provider: Arc<FakeProvider>, ttd: Duration) -> Arc<Host> {
    Host::new(
        HostConfig {
            record: HostRecord {
                id: "srv-1".to_string(),
                name: "muster-host-1".to_string(),
                ip: "10.0.0.1".to_string(),
                flavor: Flavor::new("f1", "m1.large", 4, 16_384, 100),
                key_ref: "muster-key".to_string(),
                namespace: String::new(),
            },
            user: "ubuntu".to_string(),
            ttd,
            ssh: SshConfig::default(),
        },
        provider,
    )
}

#[test]
fn allocate_and_release_track_usage() {
    let host = test_host(Arc::new(FakeProvider::new()), Duration::ZERO);
    host.allocate(2, 4096, 10);
    assert_eq!(host.used(), (2, 4096, 10));
    host.allocate(1, 1024, 5);
    assert_eq!(host.used(), (3, 5120, 15));
    host.release(2, 4096, 10);
    assert_eq!(host.used(), (1, 1024, 5));
}

#[test]
fn usage_never_goes_negative_or_past_capacity() {
    let host = test_host(Arc::new(FakeProvider::new()), Duration::ZERO);
    // over-release clamps at zero
    host.release(3, 9999, 50);
    assert_eq!(host.used(), (0, 0, 0));
    // over-allocate clamps at capacity
    host.allocate(100, 1_000_000, 1_000);
    let (cores, ram, disk) = host.used();
    assert!(cores <= host.flavor().cores);
    assert!(ram <= host.flavor().ram_mb);
    assert!(disk <= 100);
}

#[test]
fn usage_invariant_holds_under_concurrent_churn() {
    let host = test_host(Arc::new(FakeProvider::new()), Duration::ZERO);
    let mut handles = Vec::new();
    for _ in 0..4 {
        let host = Arc::clone(&host);
        handles.push(std::thread::spawn(move || {
            for _ in 0..500 {
                host.allocate(1, 256, 1);
                host.release(1, 256, 1);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    let (cores, ram, disk) = host.used();
    assert!(cores <= host.flavor().cores);
    assert!(ram <= host.flavor().ram_mb);
    assert!(disk <= 100);
}

#[test]
fn has_space_for_takes_the_min_over_dimensions() {
    let host = test_host(Arc::new(FakeProvider::new()), Duration::ZERO);
    // cores limit: 4/2 = 2, ram would allow 4, disk 10
    assert_eq!(host.has_space_for(2, 4096, 10), 2);
    // ram is the binding constraint
    assert_eq!(host.has_space_for(1, 8192, 10), 2);
    host.allocate(2, 4096, 10);
    assert_eq!(host.has_space_for(2, 4096, 10), 1);
    host.allocate(2, 4096, 10);
    assert_eq!(host.has_space_for(2, 4096, 10), 0);
}

#[test]
fn has_space_for_ignores_zero_requirement_dimensions() {
    let host = test_host(Arc::new(FakeProvider::new()), Duration::ZERO);
    assert_eq!(host.has_space_for(1, 0, 0), 4);
    assert_eq!(host.has_space_for(0, 4096, 0), 4);
    // nothing requested fits without bound
    assert_eq!(host.has_space_for(0, 0, 0), usize::MAX);
}

#[tokio::test]
async fn idle_host_with_ttd_destroys_itself() {
    let provider = Arc::new(FakeProvider::new());
    let host = test_host(Arc::clone(&provider), Duration::from_millis(150));

    host.allocate(1, 0, 0);
    host.release(1, 0, 0);
    assert!(!host.destroyed());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(host.destroyed());
    assert!(provider.was_destroyed("srv-1"));
}

#[tokio::test]
async fn allocate_during_countdown_cancels_destruction() {
    let provider = Arc::new(FakeProvider::new());
    let host = test_host(Arc::clone(&provider), Duration::from_millis(200));

    host.allocate(1, 0, 0);
    host.release(1, 0, 0);

    tokio::time::sleep(Duration::from_millis(80)).await;
    host.allocate(1, 0, 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!host.destroyed(), "allocation must cancel the countdown");
    assert!(!host.on_deathrow());
}

#[tokio::test]
async fn release_after_cancelled_countdown_arms_a_fresh_one() {
    let provider = Arc::new(FakeProvider::new());
    let host = test_host(Arc::clone(&provider), Duration::from_millis(150));

    host.allocate(1, 0, 0);
    host.release(1, 0, 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    host.allocate(1, 0, 0);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // second idle period; the earlier cancel must not bleed into it
    host.release(1, 0, 0);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(host.destroyed());
}

#[tokio::test]
async fn deathrow_race_never_half_destroys() {
    // Allocate racing the countdown: whatever wins, the host ends up
    // either destroyed, or alive with the allocation intact — not both.
    for _ in 0..10 {
        let provider = Arc::new(FakeProvider::new());
        let host = test_host(Arc::clone(&provider), Duration::from_millis(30));

        host.allocate(1, 0, 0);
        host.release(1, 0, 0);
        let racer = Arc::clone(&host);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            racer.allocate(1, 0, 0);
        });
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        if host.destroyed() {
            assert!(!host.on_deathrow());
        } else {
            assert!(!host.on_deathrow());
            assert_eq!(host.used().0, 1);
        }
    }
}

#[tokio::test]
async fn destroy_is_idempotent() {
    let provider = Arc::new(FakeProvider::new());
    let host = test_host(Arc::clone(&provider), Duration::ZERO);

    host.destroy().await.unwrap();
    assert!(host.destroyed());
    assert!(host.is_bad());
    assert_eq!(provider.destroy_count(), 1);

    host.destroy().await.unwrap();
    assert_eq!(provider.destroy_count(), 1);
}

#[tokio::test]
async fn destroyed_host_never_comes_back() {
    let host = test_host(Arc::new(FakeProvider::new()), Duration::ZERO);
    host.destroy().await.unwrap();
    host.not_bad();
    assert!(host.destroyed());
    assert!(!host.usable());
}

#[tokio::test]
async fn destroy_error_is_swallowed_when_host_is_really_gone() {
    let provider = Arc::new(FakeProvider::new());
    *provider.destroy_result.lock() =
        Err(crate::error::ProviderError("api timeout".to_string()));
    *provider.check_exists.lock() = false;

    let host = test_host(Arc::clone(&provider), Duration::ZERO);
    host.destroy().await.unwrap();
}

#[tokio::test]
async fn destroy_error_surfaces_when_host_still_exists() {
    let provider = Arc::new(FakeProvider::new());
    *provider.destroy_result.lock() =
        Err(crate::error::ProviderError("api timeout".to_string()));
    *provider.check_exists.lock() = true;

    let host = test_host(Arc::clone(&provider), Duration::ZERO);
    assert!(host.destroy().await.is_err());
}

#[tokio::test]
async fn destroy_fires_every_outstanding_cancellation_exactly_once() {
    let host = test_host(Arc::new(FakeProvider::new()), Duration::ZERO);

    let receivers: Vec<_> = (0..5).map(|_| host.test_register_cancel()).collect();
    host.destroy().await.unwrap();

    for (_, mut rx) in receivers {
        assert_eq!(rx.recv().await, Some(()), "each pending command gets one cancel");
        assert_eq!(rx.recv().await, None, "and then the channel is closed");
    }
}

#[tokio::test]
async fn run_cmd_on_destroyed_host_fails_fast() {
    let host = test_host(Arc::new(FakeProvider::new()), Duration::ZERO);
    host.destroy().await.unwrap();

    let start = Instant::now();
    let err = host.run_cmd("true", false).await.unwrap_err();
    assert!(matches!(err, HostError::HostDestroyed));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn gone_bad_is_reversible_unless_permanent() {
    let host = test_host(Arc::new(FakeProvider::new()), Duration::ZERO);
    host.gone_bad(None);
    assert!(host.is_bad());
    host.not_bad();
    assert!(!host.is_bad());

    host.gone_bad(Some("disk errors in dmesg"));
    host.not_bad();
    assert!(host.is_bad(), "permanent problems pin the quarantine");
    assert_eq!(host.permanent_problem().as_deref(), Some("disk errors in dmesg"));
}

#[test]
fn utc_offsets_parse_in_both_directions() {
    assert_eq!(
        parse_utc_offset("+0000"),
        FixedOffset::east_opt(0)
    );
    assert_eq!(
        parse_utc_offset("+0530"),
        FixedOffset::east_opt(5 * 3600 + 30 * 60)
    );
    assert_eq!(
        parse_utc_offset("-0700"),
        FixedOffset::east_opt(-7 * 3600)
    );
    assert_eq!(parse_utc_offset("0530"), None);
    assert_eq!(parse_utc_offset("+05:30"), None);
    assert_eq!(parse_utc_offset(""), None);
}

#[test]
fn tilde_paths_resolve_against_home() {
    assert_eq!(tilde_to_home("/etc/hosts"), PathBuf::from("/etc/hosts"));
    if let Ok(home) = std::env::var("HOME") {
        assert_eq!(tilde_to_home("~/.muster/config"), Path::new(&home).join(".muster/config"));
    }
}
