//! Diagnostics handed to the host's bug reporter. Message templates are
//! stable: downstream tooling keys on them.

use crate::host::{DiagNode, SourceSpan, SymValue};
use crate::state::TaintStore;

/// Every diagnostic reports under one bug type.
pub const BUG_NAME: &str = "Use of Untrusted Data";
pub const BUG_CATEGORY: &str = "Untrusted Data";

/// The four diagnostic categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BugKind {
    FormatString,
    SystemCall,
    BufferSize,
    CustomSink,
}

impl BugKind {
    pub fn message(self) -> &'static str {
        match self {
            BugKind::FormatString => "Untrusted data is used as a format string (CWE-134: Uncontrolled Format String)",
            BugKind::SystemCall => "Untrusted data is passed to a system call (CERT/STR02-C. Sanitize data passed to complex subsystems)",
            BugKind::BufferSize => "Untrusted data is used to specify the buffer size (CERT/STR31-C. Guarantee that storage for strings has sufficient space for character data and the null terminator)",
            BugKind::CustomSink => "Untrusted data is passed to a user-defined sink",
        }
    }
}

/// One step of the path annotation attached to a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceStep {
    pub span: SourceSpan,
    pub note: String,
}

/// A finished diagnostic: everything the host needs to render the bug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub kind: BugKind,
    pub message: &'static str,
    /// Diagnostic node the host materialized for the offending call.
    pub node: DiagNode,
    /// Range of the flagged expression.
    pub span: SourceSpan,
    /// Provenance of the flagged value, origin first.
    pub trace: Vec<TraceStep>,
}

impl Report {
    pub fn new(kind: BugKind, node: DiagNode, span: SourceSpan) -> Self {
        Report {
            kind,
            message: kind.message(),
            node,
            span,
            trace: Vec::new(),
        }
    }

    pub fn with_trace(mut self, trace: Vec<TraceStep>) -> Self {
        self.trace = trace;
        self
    }
}

/// Walk the provenance chain recorded for `value`, oldest step first.
pub fn origin_trace(store: &TaintStore, value: &SymValue) -> Vec<TraceStep> {
    let mut steps = Vec::new();
    let mut cursor = store.origin_of(value);
    while let Some(origin) = cursor {
        steps.push(TraceStep {
            span: origin.span,
            note: origin.note.clone(),
        });
        cursor = origin.parent.clone();
    }
    steps.reverse();
    steps
}

#[cfg(test)]
use crate::host::mock::sym;
#[cfg(test)]
use crate::state::TaintOrigin;

#[test]
fn messages_are_stable() {
    assert_eq!(
        BugKind::FormatString.message(),
        "Untrusted data is used as a format string (CWE-134: Uncontrolled Format String)"
    );
    assert_eq!(
        BugKind::SystemCall.message(),
        "Untrusted data is passed to a system call (CERT/STR02-C. Sanitize data passed to complex subsystems)"
    );
    assert_eq!(
        BugKind::BufferSize.message(),
        "Untrusted data is used to specify the buffer size (CERT/STR31-C. Guarantee that storage for strings has sufficient space for character data and the null terminator)"
    );
    assert_eq!(
        BugKind::CustomSink.message(),
        "Untrusted data is passed to a user-defined sink"
    );
}

#[test]
fn trace_lists_the_origin_first() {
    let root = TaintOrigin::root(SourceSpan::new(1, 2), "Taint originated here");
    let step = TaintOrigin::derived(SourceSpan::new(3, 4), "Taint propagated here", root);
    let head = TaintOrigin::derived(SourceSpan::new(5, 6), "Taint propagated here", step);

    let mut store = TaintStore::new();
    store.mark_value(&sym(1), head);

    let trace = origin_trace(&store, &sym(1));
    assert_eq!(trace.len(), 3);
    assert_eq!(trace[0].span, SourceSpan::new(1, 2));
    assert_eq!(trace[0].note, "Taint originated here");
    assert_eq!(trace[2].span, SourceSpan::new(5, 6));
}

#[test]
fn untainted_value_has_no_trace() {
    let store = TaintStore::new();
    assert!(origin_trace(&store, &sym(9)).is_empty());
}
