mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use coinledger::LedgerError;
use coinledger::application::LedgerService;
use coinledger::domain::UserId;
use coinledger::storage::{LedgerStore, ScanIsolation};
use common::{PEN, create_users, live, scan, test_config, test_service, total_balance};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transfers_conserve_money() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let users = create_users(&service, &[1000, 1000, 1000, 1000]).await?;
    let ids: Vec<UserId> = users.iter().map(|u| u.user_id).collect();

    let mut tasks = Vec::new();
    for i in 0..60usize {
        let service = service.clone();
        let from = ids[i % ids.len()];
        let to = ids[(i * 7 + 1) % ids.len()];
        let amount = ((i * 37) % 400 + 1) as i64;
        tasks.push(tokio::spawn(async move {
            if from == to {
                return Ok(None);
            }
            match service.transfer(&live(), from, to, amount).await {
                Ok(operation) => Ok(Some(operation)),
                Err(LedgerError::InsufficientFunds { .. }) => Ok(None),
                Err(other) => Err(other),
            }
        }));
    }

    let mut committed = Vec::new();
    for task in tasks {
        if let Some(operation) = task.await?? {
            committed.push(operation);
        }
    }

    let state = scan(&service).await?;
    assert_eq!(state.operations.len(), committed.len());
    assert_eq!(total_balance(&service).await?, 4000);

    // Every balance is explained by its history and none went negative
    let mut expected: HashMap<UserId, i64> = ids.iter().map(|id| (*id, 1000)).collect();
    for operation in &state.operations {
        for id in &ids {
            *expected.get_mut(id).unwrap() += operation.net_effect_for(*id);
        }
    }
    for user in &state.users {
        assert!(user.balance >= 0, "user {} went negative", user.user_id);
        assert_eq!(user.balance, expected[&user.user_id]);
    }

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_drain_never_overdraws() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let users = create_users(&service, &[100, 0]).await?;
    let (a, b) = (users[0].user_id, users[1].user_id);

    let mut tasks = Vec::new();
    for _ in 0..30 {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            service.transfer(&live(), a, b, 10).await
        }));
    }

    let mut succeeded = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await? {
            Ok(_) => succeeded += 1,
            Err(LedgerError::InsufficientFunds { .. }) => rejected += 1,
            Err(other) => return Err(other.into()),
        }
    }

    assert_eq!(succeeded, 10);
    assert_eq!(rejected, 20);
    assert_eq!(service.get_user(&live(), a).await?.balance, 0);
    assert_eq!(service.get_user(&live(), b).await?.balance, 100);
    assert_eq!(scan(&service).await?.operations.len(), 10);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_purchases_and_transfers_share_the_lock() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let users = create_users(&service, &[100, 0]).await?;
    let (buyer, friend) = (users[0].user_id, users[1].user_id);

    let mut tasks = Vec::new();
    for i in 0..20 {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                service.purchase_merch(&live(), buyer, PEN, 1).await.map(|_| ())
            } else {
                service.transfer(&live(), buyer, friend, 10).await.map(|_| ())
            }
        }));
    }

    let mut succeeded = 0;
    for task in tasks {
        match task.await? {
            Ok(()) => succeeded += 1,
            Err(LedgerError::InsufficientFunds { .. }) => {}
            Err(other) => return Err(other.into()),
        }
    }

    // Pens and transfers both cost 10, so exactly ten of them fit
    let state = scan(&service).await?;
    assert_eq!(succeeded, 10);
    assert_eq!(state.operations.len() + state.purchases.len(), 10);
    assert_eq!(service.get_user(&live(), buyer).await?.balance, 0);
    assert_eq!(
        service.get_user(&live(), friend).await?.balance,
        10 * state.operations.len() as i64
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transfer_canceled_while_waiting_for_lock_rolls_back() -> Result<()> {
    let (service, temp) = test_service().await?;
    let users = create_users(&service, &[500, 0]).await?;
    let (a, b) = (users[0].user_id, users[1].user_id);

    // Another writer holds the database lock
    let other = SqlitePool::connect(&test_config(&temp).database_url).await?;
    let blocking = other.begin_with("BEGIN IMMEDIATE").await?;

    let cancel = CancellationToken::new();
    let pending = {
        let service = service.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { service.transfer(&cancel, a, b, 100).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let err = tokio::time::timeout(Duration::from_secs(1), pending)
        .await??
        .unwrap_err();
    assert!(matches!(err, LedgerError::Canceled));

    blocking.rollback().await?;
    other.close().await;

    // The next uncanceled transfer gets the lock and commits
    service.transfer(&live(), a, b, 50).await?;

    let state = scan(&service).await?;
    assert_eq!(state.operations.len(), 1);
    assert_eq!(service.get_user(&live(), a).await?.balance, 450);
    assert_eq!(service.get_user(&live(), b).await?.balance, 50);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_store_stays_usable_after_deadline_interruptions() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let users = create_users(&service, &[10_000, 10_000]).await?;
    let (a, b) = (users[0].user_id, users[1].user_id);

    // Deadlines short enough to interrupt transactions at any statement
    for i in 0..200u64 {
        let hurried = LedgerService::new(
            Arc::clone(service.store()),
            Duration::from_micros(20 + (i % 30) * 20),
        );
        let outcome = if i % 4 == 0 {
            hurried.purchase_merch(&live(), a, PEN, 1).await.map(|_| ())
        } else {
            hurried.transfer(&live(), a, b, 1).await.map(|_| ())
        };
        match outcome {
            Ok(()) | Err(LedgerError::Canceled) => {}
            Err(other) => return Err(other.into()),
        }
    }
    for _ in 0..50 {
        let _ = tokio::time::timeout(
            Duration::from_micros(50),
            service.store().scan_ledger(ScanIsolation::Snapshot),
        )
        .await;
    }

    for _ in 0..20 {
        service.transfer(&live(), a, b, 1).await?;
        service.purchase_merch(&live(), b, PEN, 1).await?;
    }

    // Whatever committed is fully explained by the recorded history
    let state = scan(&service).await?;
    let spent: i64 = state.purchases.iter().map(|p| p.amount * 10).sum();
    let moved: i64 = state.operations.iter().map(|op| op.amount).sum();
    let bought_by_a: i64 = state
        .purchases
        .iter()
        .filter(|p| p.user_id == a)
        .map(|p| p.amount * 10)
        .sum();
    let balances: HashMap<UserId, i64> =
        state.users.iter().map(|u| (u.user_id, u.balance)).collect();

    assert!(state.operations.len() >= 20);
    assert_eq!(balances[&a] + balances[&b] + spent, 20_000);
    assert_eq!(balances[&a], 10_000 - moved - bought_by_a);
    Ok(())
}
