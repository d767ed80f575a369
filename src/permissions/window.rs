// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Budget renewal windows. All boundaries are UTC midnight.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};

use crate::storage::BudgetRenewal;

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::default()).and_utc()
}

/// Start of the budget window containing `now`.
///
/// `Never` windows start when the grant was created, so the budget is a
/// lifetime cap.
pub fn window_start(
    renewal: BudgetRenewal,
    grant_created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let today = now.date_naive();
    match renewal {
        BudgetRenewal::Daily => midnight(today),
        BudgetRenewal::Weekly => {
            let since_monday = i64::from(today.weekday().num_days_from_monday());
            midnight(today - Duration::days(since_monday))
        }
        BudgetRenewal::Monthly => {
            midnight(NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap_or(today))
        }
        BudgetRenewal::Yearly => midnight(NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today)),
        BudgetRenewal::Never => grant_created_at,
    }
}
