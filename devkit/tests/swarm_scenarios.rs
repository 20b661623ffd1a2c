//! Scénarios de bout en bout : vraie boucle du kernel, transport en mémoire.

use lightswarm_devkit::test_utils::DEFAULT_TIMEOUT_MS;
use lightswarm_devkit::{MemberSim, TestHarness};
use lightswarm_kernel::coordinator::CoordinatorState;
use lightswarm_kernel::display::DisplaySurface;
use lightswarm_kernel::journal::SwarmEvent;
use lightswarm_kernel::protocol::{MemberId, Packet, PacketType};
use lightswarm_kernel::runtime::OperatorCommand;
use std::time::Duration;

fn member(raw: u8, clear: u16) -> MemberSim {
    MemberSim::new(MemberId::new(raw).unwrap()).with_clear(clear)
}

#[tokio::test]
async fn first_log_report_drives_displays() {
    let harness = TestHarness::new();
    harness.send_log_report(&member(42, 512)).unwrap();

    let snap = harness
        .wait_until(DEFAULT_TIMEOUT_MS, |s| s.counters.log_reports == 1)
        .await
        .unwrap();

    assert_eq!(snap.members[0].external_id, 42);
    assert_eq!(snap.members[0].activity_counter, 1);
    assert_eq!(snap.master.master_slot, Some(0));
    assert_eq!(snap.master.master_value, 512);
    assert_eq!(snap.master.version, 1);
    assert_eq!(snap.average.current_average, 512.0);
    assert_eq!(snap.state, CoordinatorState::AwaitingDisplayRefresh);

    assert_eq!(harness.display.values_for(DisplaySurface::MasterId), vec![42]);
    assert_eq!(harness.display.values_for(DisplaySurface::ActivityBar), vec![3]);
    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn six_members_fill_roster_in_arrival_order() {
    let harness = TestHarness::new();
    let arrivals = [21u8, 5, 63, 14, 8, 40];
    for raw in arrivals {
        harness.send_light_update(&member(raw, 250)).unwrap();
    }

    let snap = harness
        .wait_until(DEFAULT_TIMEOUT_MS, |s| s.counters.light_updates == 6)
        .await
        .unwrap();

    assert_eq!(snap.members_present(), 6);
    assert_eq!(snap.counters.evictions, 0);
    let ids: Vec<u8> = snap.members.iter().map(|m| m.external_id).collect();
    assert_eq!(ids, arrivals);
    assert_eq!(harness.event_count("member_evicted"), 0);
    assert_eq!(harness.event_count("member_joined"), 6);
    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn zero_member_id_never_claims_a_slot() {
    let harness = TestHarness::new();
    let mut bytes = member(9, 250).light_update_bytes();
    bytes[2] = 0;
    harness.inject(bytes, "192.168.1.9:2910".parse().unwrap()).unwrap();

    let snap = harness
        .wait_until(DEFAULT_TIMEOUT_MS, |s| s.counters.dropped == 1)
        .await
        .unwrap();
    assert_eq!(snap.members_present(), 0);
    assert_eq!(harness.event_count("packet_dropped"), 1);
    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn seventh_member_takes_oldest_slot() {
    let harness = TestHarness::new();
    for raw in 1..=6u8 {
        harness.send_light_update(&member(raw + 10, 100)).unwrap();
        harness
            .wait_until(DEFAULT_TIMEOUT_MS, |s| s.counters.light_updates == u64::from(raw))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    harness.send_light_update(&member(99, 100)).unwrap();
    let snap = harness
        .wait_until(DEFAULT_TIMEOUT_MS, |s| s.counters.evictions == 1)
        .await
        .unwrap();

    assert_eq!(snap.members[0].external_id, 99);
    assert_eq!(snap.members_present(), 6);
    assert!(harness.events().contains(&SwarmEvent::MemberEvicted {
        member: MemberId::new(99).unwrap(),
        slot: 0,
        previous: MemberId::new(11).unwrap(),
    }));
    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn burst_sends_one_refresh_then_latest() {
    let harness = TestHarness::new();
    for raw in [20u8, 21, 22, 23, 24] {
        harness.send_log_report(&member(raw, 300)).unwrap();
    }
    harness
        .wait_until(DEFAULT_TIMEOUT_MS, |s| s.counters.log_reports == 5)
        .await
        .unwrap();

    assert_eq!(harness.display.values_for(DisplaySurface::MasterId), vec![20]);
    assert_eq!(harness.display.values_for(DisplaySurface::ActivityBar).len(), 1);

    harness.complete_refresh(DisplaySurface::MasterId).unwrap();
    harness
        .wait_until(DEFAULT_TIMEOUT_MS, |s| s.counters.refreshes_dispatched == 3)
        .await
        .unwrap();
    assert_eq!(harness.display.values_for(DisplaySurface::MasterId), vec![20, 24]);
    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn truncated_datagram_logged_once() {
    let harness = TestHarness::new();
    let sim = member(7, 250);
    let mut bytes = sim.light_update_bytes();
    bytes.truncate(9);
    harness.inject(bytes, sim.source_addr()).unwrap();

    let snap = harness
        .wait_until(DEFAULT_TIMEOUT_MS, |s| s.counters.dropped == 1)
        .await
        .unwrap();

    assert_eq!(harness.event_count("packet_dropped"), 1);
    assert_eq!(snap.members_present(), 0);
    assert_eq!(snap.master.version, 0);
    assert!(harness.display.requests().is_empty());
    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn reset_command_broadcasts_and_clears_activity() {
    let harness = TestHarness::new();
    harness.send_log_report(&member(5, 600)).unwrap();
    harness
        .wait_until(DEFAULT_TIMEOUT_MS, |s| s.counters.log_reports == 1)
        .await
        .unwrap();

    harness.command(OperatorCommand::ResetSwarm).await.unwrap();
    let packet = harness
        .wait_for_sent(PacketType::ResetSwarm, DEFAULT_TIMEOUT_MS)
        .await
        .unwrap();
    assert_eq!(packet, Packet::ResetSwarm { member: MemberId::MIN });

    let snap = harness
        .wait_until(DEFAULT_TIMEOUT_MS, |s| s.counters.resets == 1)
        .await
        .unwrap();
    assert!(snap.members.iter().all(|m| m.activity_counter == 0));
    assert_eq!(snap.pending_samples, 0);
    assert_eq!(harness.journal.rotations(), 1);
    assert_eq!(harness.display.armed(), vec![Duration::from_secs(3)]);
    harness.shutdown().await.unwrap();
}

#[tokio::test]
async fn member_commands_reach_the_simulated_member() {
    let harness = TestHarness::new();
    let mut sim = member(12, 100);

    let announce = harness
        .wait_for_sent(PacketType::DefineServerLogger, DEFAULT_TIMEOUT_MS)
        .await
        .unwrap();
    sim.handle(&announce, std::time::Instant::now());
    assert!(sim.should_log());

    harness
        .command(OperatorCommand::Blink {
            member: sim.id(),
            seconds: 2.0,
        })
        .await
        .unwrap();
    let blink = harness
        .wait_for_sent(PacketType::BlinkBrightLed, DEFAULT_TIMEOUT_MS)
        .await
        .unwrap();
    assert_eq!(
        sim.handle(&blink, std::time::Instant::now()),
        lightswarm_devkit::MemberReaction::Blink(Duration::from_secs(2))
    );
    harness.shutdown().await.unwrap();
}
