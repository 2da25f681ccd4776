//! In-memory implementations of the storage traits plus a scriptable source
//! adapter, for scenario tests that exercise the orchestrator and the HTTP
//! surface without Postgres or a network.

use serde_json::json;

use arx_schemas::{invoice_number, LineItem, LineType, NewSnapshot};

mod source;
mod stores;

pub use source::{ScriptedOutcome, ScriptedSource};
pub use stores::{MemConfig, MemJobs, MemStore};

/// A well-formed snapshot payload for one account/period, matching what the
/// billing-compute service would push to the accept endpoint.
pub fn sample_snapshot(account: &str, year: i32, month: i32) -> NewSnapshot {
    let invoice = invoice_number(account, year, month);
    NewSnapshot {
        invoice_number: invoice.clone(),
        account_number: account.to_string(),
        company_name: format!("Company {account}"),
        billing_year: year,
        billing_month: month,
        total_amount: 125.50,
        billing_data: json!({
            "invoice_number": invoice,
            "users": [{"name": "alice", "amount": 100.0}],
            "assets": [{"name": "server-1", "amount": 25.5}],
        }),
        invoice_csv: "item,quantity,rate,amount\nuser alice,1,100.00,100.00\n".to_string(),
        created_by: "scheduler".to_string(),
        notes: None,
        line_items: vec![
            LineItem {
                line_type: LineType::User,
                item_name: "alice".to_string(),
                description: None,
                quantity: 1.0,
                rate: 100.0,
                amount: 100.0,
            },
            LineItem {
                line_type: LineType::Asset,
                item_name: "server-1".to_string(),
                description: Some("managed host".to_string()),
                quantity: 1.0,
                rate: 25.5,
                amount: 25.5,
            },
        ],
    }
}
