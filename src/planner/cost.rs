//! Cost-model hooks for index selection.

use std::sync::Arc;

use crate::datastore::Index;
use crate::plan::{SpanRange, Spans2};

/// Pluggable cost model consulted during index selection.
///
/// The default implementation estimates selectivity from span shape alone;
/// deployments with statistics can supply their own.
pub trait CostModel: Send + Sync {
    /// Estimated fraction of index entries a span set selects, in `(0, 1]`.
    fn span_selectivity(&self, index: &Arc<dyn Index>, spans: &Spans2) -> f64;
}

/// Shape-based selectivity heuristics: points are tighter than ranges,
/// ranges tighter than full scans.
#[derive(Default)]
pub struct HeuristicCostModel;

impl CostModel for HeuristicCostModel {
    fn span_selectivity(&self, _index: &Arc<dyn Index>, spans: &Spans2) -> f64 {
        let mut total = 0.0;
        for span in spans {
            total += range_selectivity(&span.range);
        }
        total.clamp(1e-6, 1.0)
    }
}

fn range_selectivity(range: &SpanRange) -> f64 {
    let bounded_low = !range.low.is_empty();
    let bounded_high = !range.high.is_empty();
    match (bounded_low, bounded_high) {
        (true, true) => {
            if range.low == range.high {
                0.01
            } else {
                0.1
            }
        }
        (true, false) | (false, true) => 0.33,
        (false, false) => 1.0,
    }
}
