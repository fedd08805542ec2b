// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fifty concurrent order lookups funneled into a handful of batched mock
//! database queries.
//!
//! Each request asks for its own key, so nothing deduplicates here; the win
//! comes from the batch window turning fifty point reads into a few
//! multi-gets.

use std::{collections::HashMap, thread, time::Duration};

use multiflight::Group;
use tracing::info;

fn fetch_orders(keys: &[String]) -> Result<HashMap<String, String>, String> {
    info!(keys = keys.len(), "db multi query begin");
    // Pretend the backend takes 10ms regardless of batch size.
    thread::sleep(Duration::from_millis(10));
    let values = keys
        .iter()
        .map(|key| (key.clone(), format!("data_mock_{key}")))
        .collect();
    info!("db multi query end");
    Ok(values)
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .init();

    let group = Group::new(16, Duration::from_millis(5), fetch_orders);

    thread::scope(|s| {
        let group = &group;
        for request in 0..50 {
            // A third of the requests lag slightly behind the rest.
            if request % 10 < 3 {
                thread::sleep(Duration::from_millis(1));
            }

            s.spawn(move || {
                let key = format!("order_id_{request}");
                let flight = group.work(key.clone());
                info!(request, key = %key, value = ?flight.value(), "request complete");
            });
        }
    });

    info!("all requests drained");
}
