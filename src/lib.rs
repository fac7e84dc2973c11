//! sonir — escape analysis over a sea-of-nodes intermediate representation.
//!
//! The crate carries a minimal sea-of-nodes IR (value, effect, and control
//! edges between dense-id nodes) and an escape analysis pass over it. The
//! pass decides which heap allocations are *virtual* — never observable
//! outside the function — tracks their field contents per program point,
//! and records replacement nodes so a later pass can fold loads into stored
//! values and delete the allocations.
//!
//! Graphs are built programmatically via [`builder::GraphBuilder`] or parsed
//! from the textual form printed by [`graph::Graph`]'s `Display` impl.
//!
//! ```
//! use sonir::builder::GraphBuilder;
//! use sonir::escape::EscapeAnalysis;
//!
//! let mut b = GraphBuilder::new();
//! let size = b.number_constant(8);
//! b.begin_region();
//! let alloc = b.allocate(size);
//! let object = b.finish_region(alloc);
//! let value = b.number_constant(42);
//! b.store_field(object, 0, value);
//! let load = b.load_field(object, 0);
//! let ret = b.return_(load);
//! let mut graph = b.finish(ret);
//!
//! let mut analysis = EscapeAnalysis::new(&mut graph);
//! analysis.run();
//! assert!(analysis.is_virtual(alloc));
//! assert_eq!(analysis.get_replacement(load), Some(value));
//! ```

use std::sync::OnceLock;

pub mod builder;
pub mod escape;
pub mod graph;
pub mod graph_parse;
pub mod state;

pub use builder::GraphBuilder;
pub use escape::EscapeAnalysis;
pub use graph::{Graph, NodeId, Operator};

static TRACE_ESCAPE: OnceLock<bool> = OnceLock::new();

/// Whether state-transition tracing is on.
///
/// Read once from `SONIR_TRACE_ESCAPE` (any value except `0`), then cached.
pub(crate) fn trace_enabled() -> bool {
    *TRACE_ESCAPE.get_or_init(|| {
        std::env::var_os("SONIR_TRACE_ESCAPE").is_some_and(|value| value != "0")
    })
}

/// Log a state transition to stderr when tracing is enabled.
macro_rules! trace {
    ($($arg:tt)*) => {
        if $crate::trace_enabled() {
            eprintln!($($arg)*);
        }
    };
}
pub(crate) use trace;
