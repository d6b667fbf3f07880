// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flattening of provider payloads into CSV rows.

use serde::Serialize;
use serde_json::Value;

use batchlink_core::ResultEntry;

/// CSV column order.
pub const HEADER: [&str; 7] = [
    "uid",
    "full_name",
    "status",
    "linkedin_url",
    "contact_type",
    "contact_value",
    "contact_subtype",
];

/// One output row: a person and (at most) one of their contacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Row {
    pub uid: Option<String>,
    pub full_name: Option<String>,
    pub status: Option<String>,
    pub linkedin_url: Option<String>,
    pub contact_type: Option<String>,
    pub contact_value: Option<String>,
    pub contact_subtype: Option<String>,
}

/// Flatten one resolution payload.
///
/// The payload is a single item or an array of items, each shaped like
/// `{status, item, candidate: {uid, fullName, social[], contacts[]}}`.
/// Every contact yields a row; a candidate without contacts still yields
/// one row so the item stays traceable.
pub fn flatten_payload(payload: &Value) -> Vec<Row> {
    let items: Vec<&Value> = match payload {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![payload],
        _ => return Vec::new(),
    };

    let mut rows = Vec::new();
    for item in items.into_iter().filter(|i| i.is_object()) {
        let candidate = item.get("candidate").filter(|c| c.is_object());
        let field = |key: &str| candidate.and_then(|c| text(c.get(key)));

        let linkedin_url = candidate
            .and_then(|c| c.get("social"))
            .and_then(Value::as_array)
            .and_then(|socials| {
                socials.iter().find(|s| {
                    s.get("type")
                        .and_then(Value::as_str)
                        .is_some_and(|t| t.eq_ignore_ascii_case("li") || t.eq_ignore_ascii_case("linkedin"))
                })
            })
            .and_then(|s| text(s.get("link")))
            .or_else(|| text(item.get("item")));

        let base = Row {
            uid: field("uid"),
            full_name: field("fullName").or_else(|| field("full_name")),
            status: text(item.get("status")),
            linkedin_url,
            ..Row::default()
        };

        let contacts = candidate
            .and_then(|c| c.get("contacts"))
            .and_then(Value::as_array)
            .filter(|contacts| !contacts.is_empty());

        match contacts {
            Some(contacts) => rows.extend(contacts.iter().map(|contact| Row {
                contact_type: text(contact.get("type")),
                contact_value: text(contact.get("value")),
                contact_subtype: text(contact.get("subType"))
                    .or_else(|| text(contact.get("sub_type"))),
                ..base.clone()
            })),
            None => rows.push(base),
        }
    }
    rows
}

/// Render the results of a batch as CSV, header included.
pub fn render_csv(results: &[ResultEntry]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(HEADER)?;
    for entry in results {
        for row in flatten_payload(&entry.payload) {
            writer.serialize(row)?;
        }
    }
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

/// Scalar JSON as text; null, missing and composite values are empty.
fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
