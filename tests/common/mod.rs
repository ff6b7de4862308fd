//! Shared fixtures: a registry-backed parser (the grammar is a collaborator
//! outside the engine core) and seeded in-memory datastores.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use penumbra::algebra::{Parser, Statement};
use penumbra::datastore::Keyspace;
use penumbra::datastore::memory::{MemDatastore, MemKeyspace};
use penumbra::errors::{Error, Result};
use penumbra::expression::Expr;
use penumbra::Value;

/// Parser double: statements are registered by their text up front, as a
/// real deployment's grammar would produce them.
#[derive(Default)]
pub struct RegistryParser {
    statements: Mutex<HashMap<String, Statement>>,
}

impl RegistryParser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, text: &str, stmt: Statement) {
        self.statements.lock().insert(text.to_owned(), stmt);
    }
}

impl Parser for RegistryParser {
    fn parse(&self, text: &str) -> Result<Statement> {
        self.statements
            .lock()
            .get(text)
            .cloned()
            .ok_or_else(|| Error::Semantics {
                reason: format!("unparseable statement: {text}"),
            })
    }
}

/// An `orders` keyspace with a primary index, a secondary index on
/// `total`, and a handful of documents.
pub fn seeded_orders() -> (Arc<MemDatastore>, Arc<MemKeyspace>) {
    let store = Arc::new(MemDatastore::new());
    let ks = store.keyspace_or_create("default", "orders");
    ks.upsert(&[
        (
            "a".into(),
            Value::object([
                ("id", Value::from("a")),
                ("total", Value::from(10.0)),
                ("status", Value::from("open")),
            ]),
        ),
        (
            "b".into(),
            Value::object([
                ("id", Value::from("b")),
                ("total", Value::from(20.0)),
                ("status", Value::from("open")),
            ]),
        ),
        (
            "c".into(),
            Value::object([
                ("id", Value::from("c")),
                ("total", Value::from(30.0)),
                ("status", Value::from("closed")),
            ]),
        ),
    ])
    .unwrap();
    ks.create_primary_index("#primary");
    ks.create_index("ix_total", vec![Expr::field(["total"])]);
    (store, ks)
}
