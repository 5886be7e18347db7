/*
[INPUT]:  GridEngine migrations against PaperExchange with injected faults
[OUTPUT]: Atomic rebuild, ALARM and restart-resume verification
[POS]:    Integration test layer - crash-safety and escalation checks
[UPDATE]: When rebuild phases, resume rules or ALARM handling change
*/

mod common;

use common::{config, dec, harness, harness_with, open_orders, paper, prices, resting, Harness};
use keygrid_engine::inherit::inherit_by_index;
use keygrid_engine::persistence::StateStore;
use keygrid_engine::rebuild::TxLogStore;
use keygrid_engine::{RebuildPhase, RebuildTrigger, SlotStore, TransactionLog};
use keygrid_exchange::{Executor, PaperFault, Side};
use rust_decimal::Decimal;
use std::time::Duration;

const GRID: &str = "96000,95500,94500,94000";
const SHIFTED: &str = "96500,96000,95000,94800";

/// Cold-started grid with both buys resting, market then nudged up.
async fn running_grid(h: &Harness) {
    h.engine.bootstrap().await.expect("bootstrap");
    h.engine
        .migrate(prices(GRID), dec("95000"), RebuildTrigger::ColdStart)
        .await
        .expect("cold start");
    h.engine.run_recon_cycle().await.expect("recon");
    h.paper.set_mark_price(dec("95200")).await;
}

fn active_prices(slots: &[keygrid_engine::Slot]) -> Vec<Decimal> {
    slots.iter().map(|s| s.price()).collect()
}

#[tokio::test]
async fn test_migration_moves_orders_and_keeps_slot_ids() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = harness(dir.path(), paper("95000", "0"));
    running_grid(&h).await;
    let ids_before: Vec<_> = h.engine.status().await.active.iter().map(|s| s.id()).collect();

    let record = h
        .engine
        .migrate(prices(SHIFTED), dec("95200"), RebuildTrigger::AnchorDrift)
        .await
        .expect("migrate");

    assert_eq!(record.phase, RebuildPhase::Completed);
    assert_eq!((record.cancelled, record.placed, record.failed), (2, 2, 0));
    let status = h.engine.status().await;
    assert_eq!(
        active_prices(&status.active),
        vec![dec("96500"), dec("96000"), dec("95000"), dec("94800")]
    );
    let ids_after: Vec<_> = status.active.iter().map(|s| s.id()).collect();
    assert_eq!(ids_before, ids_after);
    assert_eq!(status.history.last().map(|r| r.trigger), Some(RebuildTrigger::AnchorDrift));
    assert!(TxLogStore::new(dir.path(), "BTC-USD").load().await.expect("load").is_none());
    assert_eq!(h.notifier.count("migration:anchor_drift"), 1);

    let recon = h.engine.run_recon_cycle().await.expect("recon");
    assert!(recon.actions.is_empty(), "unexpected actions: {:?}", recon.actions);
}

#[tokio::test]
async fn test_failed_cancel_enters_alarm_and_stops_all_calls() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = harness(dir.path(), paper("95000", "0"));
    running_grid(&h).await;
    h.paper
        .set_faults(PaperFault {
            reject_all_cancels: true,
            ..PaperFault::default()
        })
        .await;

    let err = h
        .engine
        .migrate(prices(SHIFTED), dec("95200"), RebuildTrigger::AnchorDrift)
        .await
        .expect_err("cancel failure");
    assert!(err.is_alarm());
    let calls = h.paper.call_counts().await;
    assert_eq!(calls, (2, 1));
    assert_eq!(h.notifier.count("alarm:"), 1);

    assert!(h.engine.run_recon_cycle().await.expect_err("blocked").is_alarm());
    assert!(h.engine.poll_fills().await.expect_err("blocked").is_alarm());
    assert!(h
        .engine
        .migrate(prices(GRID), dec("95200"), RebuildTrigger::ManualRebuild)
        .await
        .expect_err("blocked")
        .is_alarm());
    assert_eq!(h.paper.call_counts().await, calls);

    let status = h.engine.status().await;
    assert_eq!(status.pending.as_ref().map(|p| p.phase), Some(RebuildPhase::Alarm));
    assert_eq!(status.history.last().map(|r| r.phase), Some(RebuildPhase::Alarm));
    assert_eq!(
        active_prices(&status.active),
        vec![dec("96000"), dec("95500"), dec("94500"), dec("94000")]
    );
}

#[tokio::test]
async fn test_alarm_survives_restart_until_cleared() {
    let dir = tempfile::tempdir().expect("tempdir");
    let venue = paper("95000", "0");
    {
        let h = harness(dir.path(), venue.clone());
        running_grid(&h).await;
        h.paper
            .set_faults(PaperFault {
                reject_all_cancels: true,
                ..PaperFault::default()
            })
            .await;
        h.engine
            .migrate(prices(SHIFTED), dec("95200"), RebuildTrigger::AnchorDrift)
            .await
            .expect_err("alarm");
    }
    venue.clear_faults().await;
    let calls = venue.call_counts().await;

    let h = harness(dir.path(), venue.clone());
    assert!(h.engine.bootstrap().await.expect_err("blocked").is_alarm());
    assert!(h.engine.run_recon_cycle().await.expect_err("blocked").is_alarm());
    assert_eq!(venue.call_counts().await, calls);

    assert!(h.engine.clear_alarm().await.expect("clear"));
    assert!(!h.engine.clear_alarm().await.expect("nothing left"));
    assert!(TxLogStore::new(dir.path(), "BTC-USD").load().await.expect("load").is_none());

    let recon = h.engine.run_recon_cycle().await.expect("automation resumes");
    assert!(recon.actions.is_empty(), "unexpected actions: {:?}", recon.actions);
    let status = h.engine.status().await;
    assert!(status.pending.is_none());
    assert!(status.active.iter().filter(|s| s.price() < dec("95000")).all(|s| s.active_order_id().is_some()));
}

#[tokio::test]
async fn test_interrupted_migration_resumes_from_exchange_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let venue = paper("95000", "0");
    {
        let h = harness(dir.path(), venue.clone());
        running_grid(&h).await;
    }

    // Crash after both cancels and the first place reached the venue, before
    // any of it was written to the log.
    let snapshot = StateStore::new(dir.path(), "BTC-USD")
        .load()
        .await
        .expect("load")
        .expect("snapshot");
    let store = SlotStore::from_parts(snapshot.store, dec("0.0001")).expect("store");
    let live = open_orders(&venue).await;
    let plan = inherit_by_index(&prices(SHIFTED), &store, &live, dec("95200")).expect("plan");
    assert_eq!((plan.cancels.len(), plan.places.len()), (2, 2));

    let mut log = TransactionLog::new("BTC-USD", plan, RebuildTrigger::AnchorDrift, dec("95200"));
    log.advance(RebuildPhase::Cancelling).expect("advance");
    for cancel in &log.orders_to_cancel {
        venue.cancel_order(&cancel.order_id).await.expect("cancel");
    }
    log.advance(RebuildPhase::Placing).expect("advance");
    let first = log.orders_to_place[0].clone();
    venue
        .place_order(first.side, first.price, first.qty)
        .await
        .expect("place");
    TxLogStore::new(dir.path(), "BTC-USD").save(&log).await.expect("save");

    let h = harness(dir.path(), venue.clone());
    let report = h.engine.bootstrap().await.expect("resume");
    let resumed = report.resumed.expect("resumed migration");
    assert_eq!(resumed.phase, RebuildPhase::Completed);

    let status = h.engine.status().await;
    assert_eq!(
        active_prices(&status.active),
        vec![dec("96500"), dec("96000"), dec("95000"), dec("94800")]
    );
    assert_eq!(
        resting(&venue, Side::Buy).await,
        vec![(dec("95000"), dec("0.001")), (dec("94800"), dec("0.001"))]
    );
    // Two recon buys, the pre-crash place and exactly one place during resume.
    assert_eq!(venue.call_counts().await.0, 4);
    assert!(TxLogStore::new(dir.path(), "BTC-USD").load().await.expect("load").is_none());

    let recon = h.engine.run_recon_cycle().await.expect("recon");
    assert!(recon.actions.is_empty(), "unexpected actions: {:?}", recon.actions);
}

#[tokio::test]
async fn test_timed_out_place_is_adopted_at_sync() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = harness(dir.path(), paper("95000", "0"));
    running_grid(&h).await;
    h.paper
        .set_faults(PaperFault {
            timeout_next_places: 1,
            ..PaperFault::default()
        })
        .await;

    let record = h
        .engine
        .migrate(prices(SHIFTED), dec("95200"), RebuildTrigger::AnchorDrift)
        .await
        .expect("migrate");
    assert_eq!((record.placed, record.failed), (2, 0));
    // The timed-out place was not retried.
    assert_eq!(h.paper.call_counts().await.0, 4);

    let orders = open_orders(&h.paper).await;
    let at_95000 = orders
        .iter()
        .find(|o| o.price == dec("95000"))
        .expect("resting order");
    let status = h.engine.status().await;
    let slot = status
        .active
        .iter()
        .find(|s| s.price() == dec("95000"))
        .expect("slot");
    assert_eq!(slot.active_order_id(), Some(at_95000.id.as_str()));
    assert_eq!(resting(&h.paper, Side::Buy).await.len(), 2);
}

#[tokio::test]
async fn test_slow_places_hit_deadline_and_are_adopted_at_sync() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = config(dir.path());
    cfg.order_action_timeout_sec = 1;
    let h = harness_with(cfg, paper("95000", "0"));
    running_grid(&h).await;
    h.paper
        .set_faults(PaperFault {
            place_latency: Some(Duration::from_millis(1500)),
            ..PaperFault::default()
        })
        .await;

    let record = h
        .engine
        .migrate(prices(SHIFTED), dec("95200"), RebuildTrigger::AnchorDrift)
        .await
        .expect("migrate");
    assert_eq!(record.phase, RebuildPhase::Completed);
    assert_eq!((record.placed, record.failed), (2, 0));
    // Deadline expiry is an unknown outcome and is never retried.
    assert_eq!(h.paper.call_counts().await.0, 4);

    let orders = open_orders(&h.paper).await;
    let status = h.engine.status().await;
    for price in [dec("95000"), dec("94800")] {
        let order = orders
            .iter()
            .find(|o| o.price == price)
            .expect("resting order");
        let slot = status
            .active
            .iter()
            .find(|s| s.price() == price)
            .expect("slot");
        assert_eq!(slot.active_order_id(), Some(order.id.as_str()));
    }

    h.paper.clear_faults().await;
    let recon = h.engine.run_recon_cycle().await.expect("recon");
    assert!(recon.actions.is_empty(), "unexpected actions: {:?}", recon.actions);
}

#[tokio::test]
async fn test_failed_places_are_left_for_recon() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = harness(dir.path(), paper("95000", "0"));
    running_grid(&h).await;
    // place_max_attempts is 2: the first planned place burns both faults.
    h.paper
        .set_faults(PaperFault {
            fail_next_places: 2,
            ..PaperFault::default()
        })
        .await;

    let record = h
        .engine
        .migrate(prices(SHIFTED), dec("95200"), RebuildTrigger::AnchorDrift)
        .await
        .expect("partial success still completes");
    assert_eq!(record.phase, RebuildPhase::Completed);
    assert_eq!((record.placed, record.failed), (1, 1));
    assert_eq!(
        resting(&h.paper, Side::Buy).await,
        vec![(dec("94800"), dec("0.001"))]
    );

    let recon = h.engine.run_recon_cycle().await.expect("recon");
    assert_eq!(recon.execution.placed, 1);
    assert_eq!(
        resting(&h.paper, Side::Buy).await,
        vec![(dec("95000"), dec("0.001")), (dec("94800"), dec("0.001"))]
    );
}

#[tokio::test]
async fn test_invalid_target_list_is_rejected_before_side_effects() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = harness(dir.path(), paper("95000", "0"));
    running_grid(&h).await;
    let calls = h.paper.call_counts().await;

    assert!(keygrid_engine::TargetPrices::parse("95000,96000").is_err());
    assert!(keygrid_engine::TargetPrices::parse("95000,95000").is_err());
    assert!(keygrid_engine::TargetPrices::new(vec![dec("95000"), Decimal::ZERO]).is_err());
    assert_eq!(h.paper.call_counts().await, calls);
    assert!(TxLogStore::new(dir.path(), "BTC-USD").load().await.expect("load").is_none());
}
