mod common;

use std::sync::Barrier;
use std::thread;
use trade_settlement::{
    SettlementError,
    model::{Chat, OfferStatus, OfferTarget, SettlementStatus, Trade},
};

use common::harness;

const CONTENDERS: usize = 8;

fn count_invalid_state<T>(results: &[trade_settlement::Result<T>]) -> usize {
    results
        .iter()
        .filter(|r| matches!(r, Err(SettlementError::InvalidState(_))))
        .count()
}

#[test]
fn concurrent_accepts_on_one_listing_yield_one_trade() -> anyhow::Result<()> {
    let h = harness()?;
    let listing = h.listing("seller")?;
    let offers = (0..CONTENDERS)
        .map(|i| h.item_offer(&format!("buyer_{i}"), &listing))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let barrier = Barrier::new(CONTENDERS);
    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = offers
            .iter()
            .map(|offer_id| {
                let engine = &h.engine;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    engine.settlement.accept(offer_id, "seller")
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1, "{results:?}");
    assert_eq!(count_invalid_state(&results), CONTENDERS - 1);

    let trades = h.engine.store().scan::<Trade>()?;
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].status, SettlementStatus::Active);
    assert_eq!(h.engine.store().scan::<Chat>()?.len(), 1);
    assert_eq!(
        h.engine.trades.active_for_listing(&listing.id)?.map(|t| t.id),
        Some(trades[0].id.clone())
    );

    let offers = h
        .engine
        .offers
        .offers_for_target(&OfferTarget::Listing(listing.id.clone()))?;
    let accepted = offers
        .iter()
        .filter(|o| o.status == OfferStatus::Accepted)
        .count();
    let pending = offers
        .iter()
        .filter(|o| o.status == OfferStatus::Pending && o.settlement.is_none())
        .count();
    assert_eq!((accepted, pending), (1, CONTENDERS - 1));

    Ok(())
}

#[test]
fn same_offer_accepted_twice_settles_once() -> anyhow::Result<()> {
    let h = harness()?;
    let listing = h.listing("seller")?;
    let offer_id = h.item_offer("buyer", &listing)?;

    let barrier = Barrier::new(2);
    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    h.engine.settlement.accept(&offer_id, "seller")
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(count_invalid_state(&results), 1);
    assert_eq!(h.engine.store().scan::<Trade>()?.len(), 1);

    Ok(())
}

#[test]
fn complete_and_cancel_race_has_one_winner() -> anyhow::Result<()> {
    let h = harness()?;
    let service = h.service("provider")?;
    let offer_id = h.service_offer("client", &service)?;
    let acceptance = h.engine.settlement.accept(&offer_id, "provider")?;
    let run_id = acceptance.settlement.id();

    let barrier = Barrier::new(2);
    let (completed, cancelled) = thread::scope(|s| {
        let complete = s.spawn(|| {
            barrier.wait();
            h.engine.service_runs.complete(run_id, "provider").map(|_| ())
        });
        let cancel = s.spawn(|| {
            barrier.wait();
            h.engine
                .service_runs
                .cancel(run_id, "client", None)
                .map(|_| ())
        });
        (complete.join().unwrap(), cancel.join().unwrap())
    });

    assert!(completed.is_ok() ^ cancelled.is_ok(), "{completed:?} {cancelled:?}");
    let loser = completed.err().or(cancelled.err()).expect("one side lost");
    assert!(matches!(loser, SettlementError::InvalidState(_)), "{loser}");

    let run = h.engine.service_runs.get(run_id)?;
    let transactions = h.engine.history.transactions_for_user("client")?;
    match run.status {
        SettlementStatus::Completed => assert_eq!(transactions.len(), 1),
        SettlementStatus::Cancelled => assert!(transactions.is_empty()),
        SettlementStatus::Active => panic!("run left active"),
    }

    Ok(())
}

#[test]
fn duplicate_ratings_race_records_one() -> anyhow::Result<()> {
    let h = harness()?;
    let listing = h.listing("seller")?;
    let offer_id = h.item_offer("buyer", &listing)?;
    let acceptance = h.engine.settlement.accept(&offer_id, "seller")?;
    let txn = h
        .engine
        .trades
        .complete(acceptance.settlement.id(), "seller")?
        .transaction
        .id;

    let barrier = Barrier::new(2);
    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = [5, 1]
            .into_iter()
            .map(|stars| {
                let (h, barrier, txn) = (&h, &barrier, &txn);
                s.spawn(move || {
                    barrier.wait();
                    h.engine.ratings.create(txn, "buyer", stars, None)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(SettlementError::AlreadyExists(_))))
            .count(),
        1
    );

    let summary = h.engine.ratings.summary("seller")?;
    assert_eq!(summary.count, 1);
    let kept = results
        .iter()
        .find_map(|r| r.as_ref().ok())
        .expect("one rating stored");
    assert_eq!(summary.total_stars, u64::from(kept.stars));

    Ok(())
}

#[test]
fn concurrent_ratings_of_one_user_aggregate_exactly() -> anyhow::Result<()> {
    let h = harness()?;
    let service = h.service("provider")?;

    // one completed run per client, each yielding its own transaction
    let mut transactions = Vec::new();
    for i in 0..CONTENDERS {
        let client = format!("client_{i}");
        let offer_id = h.service_offer(&client, &service)?;
        let acceptance = h.engine.settlement.accept(&offer_id, "provider")?;
        let done = h
            .engine
            .service_runs
            .complete(acceptance.settlement.id(), &client)?;
        transactions.push((client, done.transaction.id));
    }

    let barrier = Barrier::new(CONTENDERS);
    thread::scope(|s| -> anyhow::Result<()> {
        let handles: Vec<_> = transactions
            .iter()
            .enumerate()
            .map(|(i, (client, txn))| {
                let (h, barrier) = (&h, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    let stars = (i % 5) as u8 + 1;
                    h.engine.ratings.create(txn, client, stars, None)
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap()?;
        }
        Ok(())
    })?;

    let expected_total: u64 = (0..CONTENDERS).map(|i| (i % 5) as u64 + 1).sum();
    let summary = h.engine.ratings.summary("provider")?;
    assert_eq!(summary.count, CONTENDERS as u64);
    assert_eq!(summary.total_stars, expected_total);
    assert_eq!(h.engine.ratings.ratings_for_user("provider")?.len(), CONTENDERS);

    Ok(())
}
