mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use trade_settlement::{
    config::EngineConfig,
    model::OfferStatus,
    outbox::{Effect, NotificationKind},
};

use common::{FailingNotifier, RecordingNotifier, harness, harness_with};

#[test]
fn drained_effects_reach_the_notifier() -> anyhow::Result<()> {
    let h = harness()?;
    let notifier = Arc::new(RecordingNotifier::default());
    let dispatcher = h.engine.dispatcher(notifier.clone());

    let listing = h.listing("seller")?;
    let offer_id = h.item_offer("buyer", &listing)?;
    h.clock.advance(chrono::Duration::minutes(5));
    h.engine.settlement.accept(&offer_id, "seller")?;

    // nothing leaves the store until the dispatcher runs
    assert!(notifier.sent.lock().unwrap().is_empty());
    assert!(h.engine.store().outbox_len() > 0);
    assert_eq!(h.engine.history.activity("buyer")?, None);

    let report = dispatcher.drain_once()?;
    assert_eq!(report.retrying + report.dead_lettered, 0);
    assert_eq!(h.engine.store().outbox_len(), 0);

    assert_eq!(
        notifier.kinds_for("seller"),
        vec![NotificationKind::OfferReceived]
    );
    assert_eq!(
        notifier.kinds_for("buyer"),
        vec![NotificationKind::OfferAccepted]
    );
    let accepted_at = h.engine.offers.get(&offer_id)?.accepted_at;
    assert_eq!(h.engine.history.activity("buyer")?, accepted_at);
    assert_eq!(h.engine.history.activity("seller")?, accepted_at);

    // a second pass finds nothing
    assert_eq!(dispatcher.drain_once()?.delivered, 0);

    Ok(())
}

#[test]
fn failed_deliveries_are_dead_lettered_without_touching_settlement() -> anyhow::Result<()> {
    let mut config = EngineConfig::default();
    config.outbox.max_attempts = 2;
    let h = harness_with(config)?;
    let dispatcher = h.engine.dispatcher(Arc::new(FailingNotifier));

    let listing = h.listing("seller")?;
    let offer_id = h.item_offer("buyer", &listing)?;
    let acceptance = h.engine.settlement.accept(&offer_id, "seller")?;

    let first = dispatcher.drain_once()?;
    // activity updates do not go through the notifier
    assert_eq!(first.delivered, 2);
    assert_eq!(first.retrying, 2);
    assert_eq!(first.dead_lettered, 0);
    assert_eq!(h.engine.store().outbox_len(), 2);

    let second = dispatcher.drain_once()?;
    assert_eq!(second.dead_lettered, 2);
    assert_eq!(h.engine.store().outbox_len(), 0);

    let dead = h.engine.store().dead_letters()?;
    assert_eq!(dead.len(), 2);
    for entry in &dead {
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.last_error.as_deref(), Some("transport unavailable"));
        assert!(matches!(entry.effect, Effect::Notify(_)));
    }

    // the settlement stands regardless
    assert_eq!(h.engine.offers.get(&offer_id)?.status, OfferStatus::Accepted);
    h.engine.trades.get(acceptance.settlement.id())?;

    Ok(())
}

#[test]
fn losers_of_an_accept_race_are_not_notified() -> anyhow::Result<()> {
    let h = harness()?;
    let notifier = Arc::new(RecordingNotifier::default());
    let listing = h.listing("seller")?;
    let buyers: Vec<String> = (0..4).map(|i| format!("buyer_{i}")).collect();
    let offers = buyers
        .iter()
        .map(|buyer| h.item_offer(buyer, &listing))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let barrier = Barrier::new(offers.len());
    thread::scope(|s| {
        for offer_id in &offers {
            let (h, barrier) = (&h, &barrier);
            s.spawn(move || {
                barrier.wait();
                let _ = h.engine.settlement.accept(offer_id, "seller");
            });
        }
    });

    h.engine.dispatcher(notifier.clone()).drain_once()?;

    let notified: Vec<&String> = buyers
        .iter()
        .filter(|buyer| notifier.kinds_for(buyer).contains(&NotificationKind::OfferAccepted))
        .collect();
    assert_eq!(notified.len(), 1);
    assert_eq!(notifier.kinds_for("seller").len(), buyers.len());

    Ok(())
}

#[test]
fn background_dispatcher_flushes_on_shutdown() -> anyhow::Result<()> {
    let mut config = EngineConfig::default();
    config.outbox.poll_interval_ms = 10;
    let h = harness_with(config)?;
    let notifier = Arc::new(RecordingNotifier::default());
    let handle = h.engine.dispatcher(notifier.clone()).spawn();

    let service = h.service("provider")?;
    let offer_id = h.service_offer("client", &service)?;
    let acceptance = h.engine.settlement.accept(&offer_id, "provider")?;
    h.engine
        .service_runs
        .cancel(acceptance.settlement.id(), "provider", Some("double booked".into()))?;

    handle.shutdown();

    assert_eq!(h.engine.store().outbox_len(), 0);
    assert_eq!(
        notifier.kinds_for("client"),
        vec![
            NotificationKind::OfferAccepted,
            NotificationKind::ServiceRunCancelled
        ]
    );
    assert_eq!(
        notifier.kinds_for("provider"),
        vec![NotificationKind::OfferReceived]
    );

    Ok(())
}
