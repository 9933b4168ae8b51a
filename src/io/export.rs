use std::collections::BTreeMap;
use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::application::Snapshot;
use crate::domain::{Operation, OperationId, UserInfo};

/// Serialized form of a whole cache snapshot
#[derive(Debug, Serialize)]
pub struct SnapshotExport<'a> {
    pub version: &'static str,
    pub exported_at: DateTime<Utc>,
    pub built_at: Option<DateTime<Utc>>,
    pub generation: u64,
    pub users: Vec<&'a UserInfo>,
}

/// Exporter for writing a cache snapshot in various formats.
/// Works on the in-memory snapshot only and never touches the store.
pub struct Exporter<'a> {
    snapshot: &'a Snapshot,
}

impl<'a> Exporter<'a> {
    pub fn new(snapshot: &'a Snapshot) -> Self {
        Self { snapshot }
    }

    /// Export balances to CSV format
    pub fn export_balances_csv<W: Write>(&self, writer: W) -> Result<usize> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(["user_id", "name", "balance"])?;

        let mut count = 0;
        for info in self.snapshot.user_infos() {
            csv_writer.write_record([
                info.user.user_id.to_string(),
                info.user.name.clone(),
                info.user.balance.to_string(),
            ])?;
            count += 1;
        }

        csv_writer.flush()?;
        Ok(count)
    }

    /// Export operations to CSV format.
    /// Each operation is written once even though two users share it.
    pub fn export_operations_csv<W: Write>(&self, writer: W) -> Result<usize> {
        let operations: BTreeMap<OperationId, &Operation> = self
            .snapshot
            .user_infos()
            .into_iter()
            .flat_map(|info| info.operations.iter())
            .map(|operation| (operation.operation_id, operation))
            .collect();

        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(["operation_id", "from_user", "to_user", "amount"])?;
        for operation in operations.values() {
            csv_writer.write_record([
                operation.operation_id.to_string(),
                operation.from_user.to_string(),
                operation.to_user.to_string(),
                operation.amount.to_string(),
            ])?;
        }

        csv_writer.flush()?;
        Ok(operations.len())
    }

    /// Export purchases to CSV format
    pub fn export_purchases_csv<W: Write>(&self, writer: W) -> Result<usize> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(["purchase_id", "user_id", "merch_id", "amount"])?;

        let mut count = 0;
        for info in self.snapshot.user_infos() {
            for purchase in &info.purchases {
                csv_writer.write_record([
                    purchase.purchase_id.to_string(),
                    purchase.user_id.to_string(),
                    purchase.merch_id.to_string(),
                    purchase.amount.to_string(),
                ])?;
                count += 1;
            }
        }

        csv_writer.flush()?;
        Ok(count)
    }

    /// Export the full snapshot as JSON
    pub fn export_full_json<W: Write>(&self, mut writer: W) -> Result<usize> {
        let export = SnapshotExport {
            version: env!("CARGO_PKG_VERSION"),
            exported_at: Utc::now(),
            built_at: self.snapshot.built_at(),
            generation: self.snapshot.generation(),
            users: self.snapshot.user_infos(),
        };

        let json = serde_json::to_string_pretty(&export)?;
        writer.write_all(json.as_bytes())?;
        writer.flush()?;

        Ok(export.users.len())
    }
}
