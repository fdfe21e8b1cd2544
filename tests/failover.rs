//! End-to-end failover tests on a paused clock.
//!
//! The cluster runs with real actors and mailboxes; time only advances when
//! every task is idle, so timeouts and elections play out deterministically.

use dsm_coherence::{
    fault::{DeathMode, Fault},
    Cluster, CmReport, Config, ProcessorReport, RequestStatus,
};
use std::time::Duration;

fn config(faults: Vec<Fault>) -> Config {
    Config {
        processors: 4,
        pages: 2,
        central_managers: 3,
        request_rate: 20.0,
        request_interval_bound_ms: 100,
        timeout_ms: 500,
        mailbox_capacity: Some(64),
        seed: 11,
        debug: false,
        faults,
    }
}

/// Polls the cluster until `done` holds or the virtual deadline passes.
async fn wait_for<T>(
    cluster: &Cluster,
    deadline: Duration,
    done: impl Fn(&Cluster) -> Option<T>,
) -> Option<T> {
    let step = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while waited < deadline {
        if let Some(value) = done(cluster) {
            return Some(value);
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
    None
}

/// Returns the processors holding confirmed exclusive access to `page_id`.
fn confirmed_owners(reports: &[ProcessorReport], page_id: usize) -> Vec<usize> {
    reports
        .iter()
        .filter(|report| {
            !report.pending_pages.contains(&page_id)
                && report.cache.get(&page_id).is_some_and(|cache| cache.is_owner)
        })
        .map(|report| report.id)
        .collect()
}

/// Sums the ids of the last requests retired for `page_id`; grows with every completion.
fn retired(report: &CmReport, page_id: usize) -> i64 {
    report
        .state
        .requests
        .get(&page_id)
        .map(|requests| requests.completed.values().sum())
        .unwrap_or(0)
}

#[tokio::test(start_paused = true)]
async fn hard_death_of_the_primary_elects_a_new_one() {
    let cluster = Cluster::start(&config(vec![Fault {
        central_manager: 0,
        after_messages: 30,
        mode: DeathMode::Hard,
    }]))
    .unwrap();

    let primary = wait_for(&cluster, Duration::from_secs(120), |cluster| {
        cluster.converged_primary().filter(|primary| *primary != 0)
    })
    .await
    .expect("a new primary should be elected");

    let cms = cluster.cm_reports();
    assert!(!cms[0].is_alive);
    assert_eq!(primary, 1, "the lowest live CM wins");
    assert_eq!(cms.iter().filter(|report| report.is_primary).count(), 1);
    assert!(cluster
        .processor_reports()
        .iter()
        .all(|report| report.primary == primary));

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn traffic_keeps_completing_after_failover() {
    let cluster = Cluster::start(&config(vec![Fault {
        central_manager: 0,
        after_messages: 30,
        mode: DeathMode::Hard,
    }]))
    .unwrap();

    let primary = wait_for(&cluster, Duration::from_secs(120), |cluster| {
        cluster.converged_primary().filter(|primary| *primary != 0)
    })
    .await
    .expect("a new primary should be elected");
    let at_election = cluster.cm_reports()[primary].clone();

    // Confirmations must now land on the new primary for every page.
    let progressed = wait_for(&cluster, Duration::from_secs(120), |cluster| {
        let cms = cluster.cm_reports();
        let now = &cms[primary];
        let every_page =
            (0..2).all(|page_id| retired(now, page_id) > retired(&at_election, page_id));
        let moved = (0..2).any(|page_id| {
            now.state.entries.get(&page_id) != at_election.state.entries.get(&page_id)
        });
        (now.is_primary && every_page && moved).then_some(())
    })
    .await;
    assert!(progressed.is_some(), "requests should keep completing at CM {primary}");

    let cms = cluster.cm_reports();
    let state = &cms[primary].state;
    let processors = cluster.processor_reports();
    for page_id in 0..2 {
        let owners = confirmed_owners(&processors, page_id);
        assert!(owners.len() <= 1, "page {page_id} has owners {owners:?}");
        if state.status(page_id) == RequestStatus::Idle {
            let recorded = state.entries.get(&page_id).map(|entry| entry.owner);
            for owner in owners {
                assert_eq!(Some(owner), recorded, "page {page_id} owned behind the CM's back");
            }
        }
    }

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn soft_death_resurrects_and_rejoins_as_secondary() {
    let cluster = Cluster::start(&config(vec![Fault {
        central_manager: 0,
        after_messages: 30,
        mode: DeathMode::Soft {
            resurrect_after_ms: 2_000,
        },
    }]))
    .unwrap();

    wait_for(&cluster, Duration::from_secs(60), |cluster| {
        (!cluster.cm_reports()[0].is_alive).then_some(())
    })
    .await
    .expect("CM 0 should die");

    let primary = wait_for(&cluster, Duration::from_secs(120), |cluster| {
        let cms = cluster.cm_reports();
        if !cms[0].is_alive {
            return None;
        }
        cluster.converged_primary()
    })
    .await
    .expect("the cluster should settle after the resurrection");

    let primaries = cluster.cm_reports().iter().filter(|report| report.is_primary).count();
    assert_eq!(primaries, 1);
    assert!(cluster
        .processor_reports()
        .iter()
        .all(|report| report.primary == primary));

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn no_live_replica_stalls_the_election() {
    let cluster = Cluster::start(&Config {
        central_managers: 1,
        ..config(vec![Fault {
            central_manager: 0,
            after_messages: 10,
            mode: DeathMode::Hard,
        }])
    })
    .unwrap();

    let stalled = wait_for(&cluster, Duration::from_secs(30), |cluster| {
        let reports = cluster.processor_reports();
        reports.iter().all(|report| report.in_election).then_some(())
    })
    .await;
    assert!(stalled.is_some(), "every processor should be stuck in the election");
    assert_eq!(cluster.primary(), None);
    assert!(!cluster.cm_reports()[0].is_alive);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn lone_cm_is_reelected_after_its_resurrection() {
    let cluster = Cluster::start(&Config {
        central_managers: 1,
        ..config(vec![Fault {
            central_manager: 0,
            after_messages: 30,
            mode: DeathMode::Soft {
                resurrect_after_ms: 2_000,
            },
        }])
    })
    .unwrap();

    wait_for(&cluster, Duration::from_secs(60), |cluster| {
        (!cluster.cm_reports()[0].is_alive).then_some(())
    })
    .await
    .expect("CM 0 should die");

    let primary = wait_for(&cluster, Duration::from_secs(60), |cluster| {
        cluster.converged_primary()
    })
    .await
    .expect("the only CM should be elected again");
    assert_eq!(primary, 0);
    assert!(cluster.cm_reports()[0].is_alive);

    cluster.shutdown().await;
}
