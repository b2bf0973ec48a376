mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{balance_of, shared_service, ALICE, BOB, CAROL, DAVE, SEED};
use sqlx::PgPool;
use wallet_ledger::application::{ErrorKind, LedgerService};

fn spawn_transfer(
    service: &Arc<LedgerService>,
    from: &str,
    to: &str,
    amount: &str,
) -> tokio::task::JoinHandle<Result<String, ErrorKind>> {
    let service = Arc::clone(service);
    let (from, to, amount) = (from.to_string(), to.to_string(), amount.to_string());
    tokio::spawn(async move {
        service
            .transfer(&from, &to, &amount)
            .await
            .map(|balance| balance.to_string())
            .map_err(|err| err.kind())
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_debit_race() -> Result<()> {
    let Some((service, _store)) = shared_service().await? else {
        return Ok(());
    };

    for round in 0..20 {
        service.set_wallet(ALICE, "10").await?;
        service.set_wallet(BOB, "100").await?;
        service.set_wallet(CAROL, "0").await?;
        service.set_wallet(DAVE, "0").await?;
        let supply = service.total_supply().await?;

        let credit = spawn_transfer(&service, BOB, ALICE, "1");
        let debit_4 = spawn_transfer(&service, ALICE, CAROL, "4");
        let debit_7 = spawn_transfer(&service, ALICE, DAVE, "7");

        let credit = credit.await?;
        let debit_4 = debit_4.await?;
        let debit_7 = debit_7.await?;

        assert!(credit.is_ok(), "round {}: credit failed", round);
        for debit in [&debit_4, &debit_7] {
            if let Err(kind) = debit {
                assert_eq!(*kind, ErrorKind::InsufficientBalance, "round {}", round);
            }
        }

        let final_balance = balance_of(&service, ALICE).await?;
        let expected = match (debit_4.is_ok(), debit_7.is_ok()) {
            (true, true) => "0",
            (false, true) => "4",
            (true, false) => "7",
            (false, false) => panic!("round {}: both debits failed", round),
        };
        assert_eq!(final_balance, expected, "round {}", round);

        let carol = balance_of(&service, CAROL).await?;
        let dave = balance_of(&service, DAVE).await?;
        assert_eq!(carol, if debit_4.is_ok() { "4" } else { "0" });
        assert_eq!(dave, if debit_7.is_ok() { "7" } else { "0" });
        assert_eq!(balance_of(&service, BOB).await?, "99");
        assert_eq!(service.total_supply().await?, supply);
    }

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_overdraw_never_goes_negative() -> Result<()> {
    let Some((service, _store)) = shared_service().await? else {
        return Ok(());
    };
    service.set_wallet(ALICE, "100").await?;

    let handles: Vec<_> = (0..30)
        .map(|i| spawn_transfer(&service, ALICE, &format!("0xsink{}", i % 5), "7"))
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        match handle.await? {
            Ok(_) => succeeded += 1,
            Err(kind) => assert_eq!(kind, ErrorKind::InsufficientBalance),
        }
    }

    // Debits only fail once fewer than 7 tokens remain, so exactly floor(100 / 7) succeed.
    assert_eq!(succeeded, 14);
    assert_eq!(balance_of(&service, ALICE).await?, "2");
    assert_eq!(service.list_transfers_for_wallet(ALICE).await?.len(), 14);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_credits_to_new_wallet_are_not_lost() -> Result<()> {
    let Some((service, _store)) = shared_service().await? else {
        return Ok(());
    };
    service.set_wallet(ALICE, "1000").await?;
    service.set_wallet(BOB, "1000").await?;

    for round in 0..20 {
        let recipient = format!("0xnew{}", round);

        let from_alice = spawn_transfer(&service, ALICE, &recipient, "250");
        let from_bob = spawn_transfer(&service, BOB, &recipient, "30");
        from_alice.await?.map_err(|kind| anyhow::anyhow!("{:?}", kind))?;
        from_bob.await?.map_err(|kind| anyhow::anyhow!("{:?}", kind))?;

        assert_eq!(balance_of(&service, &recipient).await?, "280", "round {}", round);
        service.set_wallet(ALICE, "1000").await?;
        service.set_wallet(BOB, "1000").await?;
    }

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_credits_to_one_receiver() -> Result<()> {
    let Some((service, _store)) = shared_service().await? else {
        return Ok(());
    };
    let senders: Vec<String> = (0..25).map(|i| format!("0xsender{}", i)).collect();
    for sender in &senders {
        service.set_wallet(sender, "100").await?;
    }
    service.set_wallet(CAROL, "0").await?;
    let supply = service.total_supply().await?;

    let handles: Vec<_> = senders
        .iter()
        .flat_map(|sender| {
            [
                spawn_transfer(&service, sender, CAROL, "10"),
                spawn_transfer(&service, SEED, CAROL, "1"),
            ]
        })
        .collect();
    for handle in handles {
        assert!(handle.await?.is_ok());
    }

    assert_eq!(balance_of(&service, CAROL).await?, "275");
    assert_eq!(balance_of(&service, SEED).await?, "999975");
    assert_eq!(service.total_supply().await?, supply);
    assert_eq!(service.list_transfers(None).await?.len(), 50);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unrelated_pairs_all_complete() -> Result<()> {
    let Some((service, _store)) = shared_service().await? else {
        return Ok(());
    };
    for i in 0..20 {
        service.set_wallet(&format!("0xfrom{}", i), "50").await?;
    }

    let handles: Vec<_> = (0..20)
        .map(|i| spawn_transfer(&service, &format!("0xfrom{}", i), &format!("0xto{}", i), "50"))
        .collect();
    for handle in handles {
        assert_eq!(handle.await?, Ok("0".to_string()));
    }

    for i in 0..20 {
        assert_eq!(balance_of(&service, &format!("0xto{}", i)).await?, "50");
    }
    let report = service.check_integrity().await?;
    assert!(report.is_healthy(), "{:?}", report.issues);
    assert_eq!(report.transfer_count, 20);

    Ok(())
}

/// Open a transaction on a separate connection that holds the row lock on `address`.
async fn lock_wallet_row(
    pool: &PgPool,
    address: &str,
) -> Result<sqlx::Transaction<'static, sqlx::Postgres>> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT balance FROM wallets WHERE address = $1 FOR UPDATE")
        .bind(address)
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_locked_wallet_does_not_block_other_wallets() -> Result<()> {
    let Some((service, store)) = shared_service().await? else {
        return Ok(());
    };
    service.set_wallet(CAROL, "10").await?;
    let pool = store.raw_pool().await?;
    let blocker = lock_wallet_row(&pool, SEED).await?;

    let balance = service
        .transfer_within(CAROL, DAVE, "5", Duration::from_secs(5))
        .await?;
    assert_eq!(balance.to_string(), "5");
    assert_eq!(balance_of(&service, DAVE).await?, "5");

    // A transfer touching the locked row waits for it.
    let err = service
        .transfer_within(SEED, ALICE, "5", Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {}", err);

    blocker.rollback().await?;
    pool.close().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposite_transfers_do_not_deadlock() -> Result<()> {
    let Some((service, _store)) = shared_service().await? else {
        return Ok(());
    };
    service.set_wallet(ALICE, "1000").await?;
    service.set_wallet(BOB, "1000").await?;

    let handles: Vec<_> = (0..40)
        .map(|i| {
            if i % 2 == 0 {
                spawn_transfer(&service, ALICE, BOB, "3")
            } else {
                spawn_transfer(&service, BOB, ALICE, "3")
            }
        })
        .collect();
    for handle in handles {
        assert!(handle.await?.is_ok());
    }

    assert_eq!(balance_of(&service, ALICE).await?, "1000");
    assert_eq!(balance_of(&service, BOB).await?, "1000");
    assert_eq!(service.list_transfers(None).await?.len(), 40);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deadline_rolls_back_and_releases_lock() -> Result<()> {
    let Some((service, store)) = shared_service().await? else {
        return Ok(());
    };
    let seed_before = service.get_wallet(SEED).await?;

    let pool = store.raw_pool().await?;
    let blocker = lock_wallet_row(&pool, SEED).await?;

    let err = service
        .transfer_within(SEED, ALICE, "5", Duration::from_millis(200))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreFailure);
    assert!(err.is_timeout(), "unexpected error: {}", err);

    blocker.rollback().await?;
    pool.close().await;

    assert_eq!(service.get_wallet(SEED).await?, seed_before);
    assert!(service.get_wallet(ALICE).await?.is_none());
    assert!(service.list_transfers(None).await?.is_empty());

    // The abandoned transaction must not keep the wallet locked.
    let balance = service
        .transfer_within(SEED, ALICE, "5", Duration::from_secs(10))
        .await?;
    assert_eq!(balance.to_string(), "999995");

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timed_out_transfers_never_commit() -> Result<()> {
    let Some((service, _store)) = shared_service().await? else {
        return Ok(());
    };
    service.set_wallet(BOB, "0").await?;

    let mut committed = 0usize;
    let mut timed_out = 0usize;
    for i in 0..400u64 {
        // Deadlines spread around the time a transfer takes, so some expire
        // while the transaction is in flight and some just before commit.
        let deadline = Duration::from_micros(50 + (i * 37) % 4000);
        match service.transfer_within(SEED, BOB, "1", deadline).await {
            Ok(_) => committed += 1,
            Err(err) => {
                assert!(err.is_timeout(), "unexpected error: {}", err);
                timed_out += 1;
            }
        }
    }

    assert_eq!(committed + timed_out, 400);
    assert_eq!(service.list_transfers(None).await?.len(), committed);
    assert_eq!(balance_of(&service, BOB).await?, committed.to_string());
    assert_eq!(
        balance_of(&service, SEED).await?,
        (1_000_000 - committed).to_string()
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reads_see_only_committed_state() -> Result<()> {
    let Some((service, _store)) = shared_service().await? else {
        return Ok(());
    };
    service.set_wallet(ALICE, "0").await?;

    let writer = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            for _ in 0..40 {
                service.transfer(SEED, ALICE, "10").await?;
            }
            anyhow::Ok(())
        })
    };

    // Readers never observe a half-applied transfer on either side.
    for _ in 0..40 {
        let seed: u64 = balance_of(&service, SEED).await?.parse()?;
        let alice: u64 = balance_of(&service, ALICE).await?.parse()?;
        assert_eq!(alice % 10, 0);
        assert_eq!(seed % 10, 0);
        assert!(seed <= 1_000_000);
        tokio::task::yield_now().await;
    }

    writer.await??;
    assert_eq!(balance_of(&service, SEED).await?, "999600");
    assert_eq!(balance_of(&service, ALICE).await?, "400");

    Ok(())
}
