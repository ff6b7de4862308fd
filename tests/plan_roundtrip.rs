//! Encoded-plan round trips and decode validation.

mod common;

use std::sync::Arc;

use common::{seeded_orders, RegistryParser};
use penumbra::algebra::{KeyspaceTerm, Projection, Select, Statement};
use penumbra::config::FeatureControls;
use penumbra::datastore::Datastore;
use penumbra::expression::{CmpOp, Expr};
use penumbra::plan::Prepared;
use penumbra::planner::build_prepared;
use penumbra::prepareds::{NoRemote, Prepareds};

fn where_total_gt(v: f64) -> Statement {
    let mut stmt = Statement::Select(Select::simple(
        KeyspaceTerm::new("default", "orders", Some("o".into())),
        Some(Expr::Cmp(
            CmpOp::Gt,
            Box::new(Expr::field(["total"])),
            Box::new(Expr::literal(v)),
        )),
        Projection::star(),
    ));
    stmt.formalize().unwrap();
    stmt
}

/// P1: decode(encode(p)) preserves the name and is structurally equal to
/// the original, with omitted zero-valued fields left unset.
#[test]
fn encode_decode_preserves_structure() {
    let (store, _) = seeded_orders();
    let prepared = build_prepared(
        &where_total_gt(15.0),
        "round",
        "SELECT * FROM orders o WHERE total > 15",
        store.as_ref(),
        "default",
        4,
        FeatureControls::default(),
    )
    .unwrap();

    let decoded = Prepared::decode(&prepared.encoded_plan).unwrap();
    assert_eq!(decoded.name, prepared.name);
    assert_eq!(decoded.text, prepared.text);
    assert_eq!(decoded.stmt_type, "SELECT");
    assert_eq!(decoded.operator, prepared.operator);
    assert_eq!(decoded.versions, prepared.versions);
    assert_eq!(decoded.readonly, prepared.readonly);

    // Re-encoding the decoded plan reproduces the same bytes.
    assert_eq!(decoded.encode().unwrap(), prepared.encode().unwrap());
}

/// The wire shape: `#operator` discriminators, `~children` nesting, and
/// keyspace fields all present in the JSON layer of the encoding.
#[test]
fn encoded_plan_wire_shape() {
    let (store, _) = seeded_orders();
    let prepared = build_prepared(
        &where_total_gt(15.0),
        "wire",
        "SELECT * FROM orders o WHERE total > 15",
        store.as_ref(),
        "default",
        4,
        FeatureControls::default(),
    )
    .unwrap();

    let raw = Prepared::decode_raw(&prepared.encoded_plan).unwrap();
    let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(json["name"], "wire");
    let root = &json["operator"];
    assert_eq!(root["#operator"], "Sequence");
    let scan = &root["~children"][0];
    assert_eq!(scan["#operator"], "IndexScan3");
    assert_eq!(scan["namespace"], "default");
    assert_eq!(scan["keyspace"], "orders");
    assert_eq!(scan["as"], "o");
    assert!(scan["spans"].is_array());
}

/// S3: decoding under a name that disagrees with the embedded one fails
/// with the name-mismatch error.
#[test]
fn decode_name_mismatch() {
    let (store, _) = seeded_orders();
    let parser = RegistryParser::new();
    let prepareds = Prepareds::new(
        8,
        Arc::clone(&store) as Arc<dyn Datastore>,
        parser,
        Arc::new(NoRemote),
        "default",
        4,
        FeatureControls::default(),
    );
    let prepared = build_prepared(
        &where_total_gt(15.0),
        "y",
        "SELECT * FROM orders o WHERE total > 15",
        store.as_ref(),
        "default",
        4,
        FeatureControls::default(),
    )
    .unwrap();

    let err = prepareds
        .decode_prepared("x", &prepared.encoded_plan, false, false)
        .unwrap_err();
    assert_eq!(err.code(), 4080);
    assert!(err.to_string().contains("x"));
}

/// Decoding garbage fails with a decoding error, not a panic.
#[test]
fn decode_rejects_malformed_input() {
    assert_eq!(Prepared::decode("@@@").unwrap_err().code(), 4070);
}
