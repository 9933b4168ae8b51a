mod common;

use anyhow::Result;
use coinledger::application::SnapshotCache;
use coinledger::io::Exporter;
use common::{CUP, create_users, live, loader, test_service};

async fn populated_cache() -> Result<(SnapshotCache, tempfile::TempDir)> {
    let (service, temp) = test_service().await?;
    let users = create_users(&service, &[1000, 200, 0]).await?;
    let (a, b, c) = (users[0].user_id, users[1].user_id, users[2].user_id);

    service.transfer(&live(), a, b, 300).await?;
    service.transfer(&live(), b, c, 100).await?;
    service.purchase_merch(&live(), c, CUP, 2).await?;

    let cache = SnapshotCache::new();
    cache.refresh(&loader(&service)).await?;
    Ok((cache, temp))
}

#[tokio::test]
async fn test_export_balances_csv() -> Result<()> {
    let (cache, _temp) = populated_cache().await?;
    let snapshot = cache.snapshot();

    let mut out = Vec::new();
    let count = Exporter::new(&snapshot).export_balances_csv(&mut out)?;
    let text = String::from_utf8(out)?;
    let lines: Vec<&str> = text.lines().collect();

    assert_eq!(count, 3);
    assert_eq!(lines[0], "user_id,name,balance");
    assert_eq!(lines[1], "1,user-0,700");
    assert_eq!(lines[2], "2,user-1,400");
    assert_eq!(lines[3], "3,user-2,60");
    Ok(())
}

#[tokio::test]
async fn test_export_operations_written_once() -> Result<()> {
    let (cache, _temp) = populated_cache().await?;
    let snapshot = cache.snapshot();

    let mut out = Vec::new();
    let count = Exporter::new(&snapshot).export_operations_csv(&mut out)?;
    let text = String::from_utf8(out)?;

    // Each operation sits in two users' histories but is exported once
    assert_eq!(count, 2);
    assert_eq!(text.lines().count(), 3);
    assert!(text.contains("1,1,2,300"));
    assert!(text.contains("2,2,3,100"));
    Ok(())
}

#[tokio::test]
async fn test_export_purchases_csv() -> Result<()> {
    let (cache, _temp) = populated_cache().await?;
    let snapshot = cache.snapshot();

    let mut out = Vec::new();
    let count = Exporter::new(&snapshot).export_purchases_csv(&mut out)?;
    let text = String::from_utf8(out)?;

    assert_eq!(count, 1);
    assert_eq!(text.lines().nth(1), Some("1,3,2,2"));
    Ok(())
}

#[tokio::test]
async fn test_export_full_json_omits_passwords() -> Result<()> {
    let (cache, _temp) = populated_cache().await?;
    let snapshot = cache.snapshot();

    let mut out = Vec::new();
    let count = Exporter::new(&snapshot).export_full_json(&mut out)?;
    let text = String::from_utf8(out)?;
    let json: serde_json::Value = serde_json::from_str(&text)?;

    assert_eq!(count, 3);
    assert_eq!(json["generation"], 1);
    assert_eq!(json["users"].as_array().map(Vec::len), Some(3));
    assert_eq!(json["users"][0]["user"]["balance"], 700);
    assert_eq!(json["users"][2]["purchases"][0]["merch_id"], 2);
    assert!(!text.contains("secret"));
    Ok(())
}
