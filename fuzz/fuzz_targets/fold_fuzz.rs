//! Fuzz test for folding change events into cached lists
//!
//! The input is split at the first newline: the first half is the cached
//! list value, the second a change event. Folding must never panic, and a
//! successful fold must yield a list that respects the list's filter and
//! sort and holds each row id at most once.
//!
//! Run with: cargo +nightly fuzz run fold_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::HashSet;
use vantage_cache::{fold_list, FoldOutcome, ListShape};
use vantage_core::{row_id, CacheKey, ChangeEvent, FilterExpr, SortSpec};

fuzz_target!(|data: &[u8]| {
    let Some(split) = data.iter().position(|b| *b == b'\n') else {
        return;
    };
    let Ok(current) = serde_json::from_slice::<Value>(&data[..split]) else {
        return;
    };
    let Ok(event) = serde_json::from_slice::<ChangeEvent>(&data[split + 1..]) else {
        return;
    };

    let shape = ListShape {
        filter: Some(FilterExpr::eq("status", json!("booked"))),
        sort: Some(SortSpec::ascending("slot")),
        ..ListShape::default()
    };
    let key = CacheKey::bare("appointment", "upcoming");

    let Ok(FoldOutcome::Changed(folded)) = fold_list(&key, &shape, &current, &event) else {
        return;
    };
    let rows = folded.as_array().expect("a fold must produce a list");
    let current_rows = current.as_array().map(Vec::as_slice).unwrap_or(&[]);
    assert!(rows.len() <= current_rows.len() + 1, "a fold adds at most one row");

    // The remaining checks need a well-formed cached list.
    let mut ids = HashSet::new();
    let well_formed = current_rows
        .iter()
        .all(|row| row_id(row, &shape.id_field).map_or(false, |id| ids.insert(id)));
    if !well_formed {
        return;
    }

    let matching: Vec<&Value> = rows
        .iter()
        .filter(|row| row_id(row, &shape.id_field).as_ref() == Some(&event.row_id))
        .collect();
    assert!(matching.len() <= 1, "the folded row appears once");
    if let (Some(row), Some(filter)) = (matching.first(), &shape.filter) {
        assert!(filter.matches(row), "only admitted rows are folded in");
    }

    if let Some(sort) = &shape.sort {
        let in_order = |rows: &[Value]| {
            rows.windows(2)
                .all(|w| sort.compare(&w[0], &w[1]) != Ordering::Greater)
        };
        if in_order(current_rows) {
            assert!(in_order(rows), "folding into a sorted list keeps it sorted");
        }
    }
});
