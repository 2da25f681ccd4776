//! Snapshot repository: append-only storage of billing snapshots and their
//! line items.
//!
//! Design notes:
//! - `put` is the single entry point for both the direct accept API and the
//!   orchestrator path, so the uniqueness/atomicity invariants hold
//!   regardless of caller.
//! - Snapshot and line items are written in one transaction; `get`/`search`
//!   never observe a partial write.
//! - Duplicate periods are detected by the DB unique constraints (SQLSTATE
//!   23505), not by a racy check-then-insert.

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};

use arx_schemas::{LineItem, LineType, NewSnapshot, Snapshot, SnapshotSummary, SnapshotWithItems};

use crate::store::{SnapshotFilter, SnapshotPage, StoreError};

/// Detect a Postgres unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

/// Validate a snapshot payload before any write. Shared with the in-memory
/// store so both backends reject the same inputs.
pub fn validate_new_snapshot(s: &NewSnapshot) -> Result<(), StoreError> {
    fn finite_non_negative(name: &str, v: f64) -> Result<(), StoreError> {
        if !v.is_finite() || v < 0.0 {
            return Err(StoreError::Validation(format!(
                "{name} must be a finite non-negative number, got {v}"
            )));
        }
        Ok(())
    }

    if s.invoice_number.trim().is_empty() {
        return Err(StoreError::Validation("invoice_number is required".into()));
    }
    if s.account_number.trim().is_empty() {
        return Err(StoreError::Validation("account_number is required".into()));
    }
    if !(1..=12).contains(&s.billing_month) {
        return Err(StoreError::Validation(format!(
            "billing_month must be 1-12, got {}",
            s.billing_month
        )));
    }
    if s.billing_year <= 0 {
        return Err(StoreError::Validation(format!(
            "billing_year must be positive, got {}",
            s.billing_year
        )));
    }
    if s.invoice_csv.is_empty() {
        return Err(StoreError::Validation("invoice_csv is required".into()));
    }
    if s.billing_data.is_null() {
        return Err(StoreError::Validation("billing_data is required".into()));
    }
    finite_non_negative("total_amount", s.total_amount)?;

    for (i, item) in s.line_items.iter().enumerate() {
        if item.item_name.trim().is_empty() {
            return Err(StoreError::Validation(format!(
                "line_items[{i}].item_name is required"
            )));
        }
        finite_non_negative(&format!("line_items[{i}].quantity"), item.quantity)?;
        finite_non_negative(&format!("line_items[{i}].rate"), item.rate)?;
        finite_non_negative(&format!("line_items[{i}].amount"), item.amount)?;
    }

    Ok(())
}

/// Persist a snapshot and all of its line items atomically.
pub async fn put(pool: &PgPool, snap: NewSnapshot) -> Result<Snapshot, StoreError> {
    validate_new_snapshot(&snap)?;

    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        r#"
        insert into snapshots (
          invoice_number, account_number, company_name, billing_year,
          billing_month, total_amount, billing_data, invoice_csv,
          created_by, notes
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
        )
        returning id, archived_at
        "#,
    )
    .bind(&snap.invoice_number)
    .bind(&snap.account_number)
    .bind(&snap.company_name)
    .bind(snap.billing_year)
    .bind(snap.billing_month)
    .bind(snap.total_amount)
    .bind(&snap.billing_data)
    .bind(&snap.invoice_csv)
    .bind(&snap.created_by)
    .bind(&snap.notes)
    .fetch_one(&mut *tx)
    .await;

    let row = match inserted {
        Ok(row) => row,
        Err(e) if is_unique_violation(&e) => {
            return Err(StoreError::Duplicate {
                invoice_number: snap.invoice_number.clone(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    let snapshot_id: i64 = row.try_get("id")?;
    let archived_at: DateTime<Utc> = row.try_get("archived_at")?;

    for item in &snap.line_items {
        sqlx::query(
            r#"
            insert into snapshot_line_items (
              snapshot_id, line_type, item_name, description, quantity, rate, amount
            ) values (
              $1, $2, $3, $4, $5, $6, $7
            )
            "#,
        )
        .bind(snapshot_id)
        .bind(item.line_type.as_str())
        .bind(&item.item_name)
        .bind(&item.description)
        .bind(item.quantity)
        .bind(item.rate)
        .bind(item.amount)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(Snapshot {
        invoice_number: snap.invoice_number,
        account_number: snap.account_number,
        company_name: snap.company_name,
        billing_year: snap.billing_year,
        billing_month: snap.billing_month,
        total_amount: snap.total_amount,
        billing_data: snap.billing_data,
        invoice_csv: snap.invoice_csv,
        archived_at,
        created_by: snap.created_by,
        notes: snap.notes,
    })
}

/// Fetch one snapshot plus all of its line items.
pub async fn get(pool: &PgPool, invoice_number: &str) -> Result<SnapshotWithItems, StoreError> {
    let row = sqlx::query(
        r#"
        select
          id, invoice_number, account_number, company_name, billing_year,
          billing_month, total_amount, billing_data, invoice_csv,
          archived_at, created_by, notes
        from snapshots
        where invoice_number = $1
        "#,
    )
    .bind(invoice_number)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("snapshot {invoice_number}")))?;

    let snapshot_id: i64 = row.try_get("id")?;
    let snapshot = snapshot_from_row(&row)?;

    let item_rows = sqlx::query(
        r#"
        select line_type, item_name, description, quantity, rate, amount
        from snapshot_line_items
        where snapshot_id = $1
        order by id asc
        "#,
    )
    .bind(snapshot_id)
    .fetch_all(pool)
    .await?;

    let mut line_items = Vec::with_capacity(item_rows.len());
    for r in item_rows {
        line_items.push(line_item_from_row(&r)?);
    }

    Ok(SnapshotWithItems {
        snapshot,
        line_items,
    })
}

/// Filtered search over archived snapshots.
///
/// Ordering contract: `archived_at` descending, tie-broken by
/// `invoice_number` descending so pagination is stable. Count and page
/// run inside one transaction so `total` always agrees with the rows a
/// concurrent writer could otherwise slip in between the two queries.
pub async fn search(pool: &PgPool, filter: SnapshotFilter) -> Result<SnapshotPage, StoreError> {
    let limit = if filter.limit > 0 { filter.limit } else { 100 };
    let offset = filter.offset.max(0);

    let mut tx = pool.begin().await?;

    sqlx::query("set transaction isolation level repeatable read")
        .execute(&mut *tx)
        .await?;

    let (total,): (i64,) = sqlx::query_as::<_, (i64,)>(
        r#"
        select count(*)::bigint
        from snapshots
        where ($1::text is null or account_number = $1)
          and ($2::int is null or billing_year = $2)
          and ($3::int is null or billing_month = $3)
        "#,
    )
    .bind(&filter.account)
    .bind(filter.year)
    .bind(filter.month)
    .fetch_one(&mut *tx)
    .await?;

    let rows = sqlx::query(
        r#"
        select
          invoice_number, account_number, company_name, billing_year,
          billing_month, total_amount, archived_at
        from snapshots
        where ($1::text is null or account_number = $1)
          and ($2::int is null or billing_year = $2)
          and ($3::int is null or billing_month = $3)
        order by archived_at desc, invoice_number desc
        limit $4 offset $5
        "#,
    )
    .bind(&filter.account)
    .bind(filter.year)
    .bind(filter.month)
    .bind(limit)
    .bind(offset)
    .fetch_all(&mut *tx)
    .await?;

    tx.commit().await?;

    let mut results = Vec::with_capacity(rows.len());
    for r in rows {
        results.push(summary_from_row(&r)?);
    }

    Ok(SnapshotPage { total, results })
}

/// All snapshots for one account, newest billing period first.
pub async fn list_for_account(
    pool: &PgPool,
    account: &str,
) -> Result<Vec<SnapshotSummary>, StoreError> {
    let rows = sqlx::query(
        r#"
        select
          invoice_number, account_number, company_name, billing_year,
          billing_month, total_amount, archived_at
        from snapshots
        where account_number = $1
        order by billing_year desc, billing_month desc
        "#,
    )
    .bind(account)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for r in rows {
        out.push(summary_from_row(&r)?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn snapshot_from_row(row: &PgRow) -> Result<Snapshot, StoreError> {
    Ok(Snapshot {
        invoice_number: row.try_get("invoice_number")?,
        account_number: row.try_get("account_number")?,
        company_name: row.try_get("company_name")?,
        billing_year: row.try_get("billing_year")?,
        billing_month: row.try_get("billing_month")?,
        total_amount: row.try_get("total_amount")?,
        billing_data: row.try_get("billing_data")?,
        invoice_csv: row.try_get("invoice_csv")?,
        archived_at: row.try_get("archived_at")?,
        created_by: row.try_get("created_by")?,
        notes: row.try_get("notes")?,
    })
}

fn summary_from_row(row: &PgRow) -> Result<SnapshotSummary, StoreError> {
    Ok(SnapshotSummary {
        invoice_number: row.try_get("invoice_number")?,
        account_number: row.try_get("account_number")?,
        company_name: row.try_get("company_name")?,
        billing_year: row.try_get("billing_year")?,
        billing_month: row.try_get("billing_month")?,
        total_amount: row.try_get("total_amount")?,
        archived_at: row.try_get("archived_at")?,
    })
}

fn line_item_from_row(row: &PgRow) -> Result<LineItem, StoreError> {
    let line_type: String = row.try_get("line_type")?;
    let line_type = LineType::parse(&line_type)
        .map_err(|e| StoreError::Validation(format!("stored line_type invalid: {e}")))?;

    Ok(LineItem {
        line_type,
        item_name: row.try_get("item_name")?,
        description: row.try_get("description")?,
        quantity: row.try_get("quantity")?,
        rate: row.try_get("rate")?,
        amount: row.try_get("amount")?,
    })
}

// ---------------------------------------------------------------------------
// Tests (validation only — persistence is covered by the ignored DB
// scenarios in tests/)
// ---------------------------------------------------------------------------
