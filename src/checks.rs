//! Pre-call sink checks. These run before rule evaluation; the first check
//! that emits a diagnostic short-circuits the rest for this call.

use tracing::debug;

use crate::builtins;
use crate::host::{CallArg, CallSite, CalleeDecl, HostContext, SymValue};
use crate::report::{origin_trace, BugKind, Report};
use crate::rules::RuleCatalog;
use crate::state::TaintStore;

/// Run every sink check against `call`. Returns true when a diagnostic was
/// emitted; the caller then skips propagation for this call.
pub(crate) fn run_pre_checks(
    catalog: &RuleCatalog,
    call: &CallSite,
    ctx: &mut dyn HostContext,
    store: &TaintStore,
) -> bool {
    if check_format_string(call, ctx, store) {
        return true;
    }

    // The remaining checks key on a resolved callee name.
    let Some(decl) = &call.callee else {
        return false;
    };
    if decl.name.is_empty() {
        return false;
    }

    check_system_call(&decl.name, call, ctx, store)
        || check_buffer_size(decl, call, ctx, store)
        || check_custom_sinks(catalog, &decl.name, call, ctx, store)
}

fn check_format_string(call: &CallSite, ctx: &mut dyn HostContext, store: &TaintStore) -> bool {
    let Some(index) = format_string_arg(call) else {
        return false;
    };
    let Some(arg) = call.arg(index) else {
        return false;
    };
    report_if_tainted(arg, BugKind::FormatString, ctx, store)
}

/// Position of the callee's format-string argument, when it has one: the
/// declaration's printf-style annotation (with an argument-count guard),
/// falling back to a name heuristic for `setproctitle` variants.
fn format_string_arg(call: &CallSite) -> Option<u32> {
    let decl = call.callee.as_ref()?;
    if let Some(index) = decl.format_arg {
        if call.arg_count() > index {
            return Some(index);
        }
    }
    if decl.name.contains("setproctitle") {
        return Some(0);
    }
    None
}

fn check_system_call(
    name: &str,
    call: &CallSite,
    ctx: &mut dyn HostContext,
    store: &TaintStore,
) -> bool {
    let Some(index) = builtins::system_call_arg(name) else {
        return false;
    };
    let Some(arg) = call.arg(index) else {
        return false;
    };
    report_if_tainted(arg, BugKind::SystemCall, ctx, store)
}

fn check_buffer_size(
    decl: &CalleeDecl,
    call: &CallSite,
    ctx: &mut dyn HostContext,
    store: &TaintStore,
) -> bool {
    let Some(index) = builtins::buffer_size_arg(decl) else {
        return false;
    };
    let Some(arg) = call.arg(index) else {
        return false;
    };
    report_if_tainted(arg, BugKind::BufferSize, ctx, store)
}

fn check_custom_sinks(
    catalog: &RuleCatalog,
    name: &str,
    call: &CallSite,
    ctx: &mut dyn HostContext,
    store: &TaintStore,
) -> bool {
    let Some(positions) = catalog.sink_args(name) else {
        return false;
    };
    for &index in positions {
        let Some(arg) = call.arg(index) else { continue };
        if report_if_tainted(arg, BugKind::CustomSink, ctx, store) {
            return true;
        }
    }
    false
}

/// Test `arg` pointee-first, then the value itself, and emit a diagnostic
/// for whichever is tainted. A host that cannot materialize a diagnostic
/// node here gets no report; the caller treats that as "nothing emitted".
fn report_if_tainted(
    arg: &CallArg,
    kind: BugKind,
    ctx: &mut dyn HostContext,
    store: &TaintStore,
) -> bool {
    let Some(flagged) = tainted_value_of(arg, ctx, store) else {
        return false;
    };
    let Some(node) = ctx.diagnostic_node() else {
        return false;
    };
    debug!(target: "taint", "{kind:?} report at {:?}", arg.span);
    let report = Report::new(kind, node, arg.span).with_trace(origin_trace(store, &flagged));
    ctx.report(report);
    true
}

/// The tainted value an argument exposes: its pointee when that is tainted,
/// otherwise the argument's own value.
fn tainted_value_of(
    arg: &CallArg,
    ctx: &dyn HostContext,
    store: &TaintStore,
) -> Option<SymValue> {
    if arg.ty.is_pointer() {
        if let Some(region) = arg.value.as_region() {
            let pointee = ctx.read_region(region);
            if store.is_value_tainted(&pointee) {
                return Some(pointee);
            }
        }
    }
    if store.is_value_tainted(&arg.value) {
        return Some(arg.value);
    }
    None
}

#[cfg(test)]
use crate::host::mock::{buf_arg, call, const_arg, sym, val_arg, MockHost};
#[cfg(test)]
use crate::host::{MemFnKind, RegionId, SourceSpan};
#[cfg(test)]
use crate::state::TaintOrigin;

#[cfg(test)]
fn tainted_store(values: &[SymValue]) -> TaintStore {
    let mut store = TaintStore::new();
    for value in values {
        store.mark_value(value, TaintOrigin::root(SourceSpan::new(1, 2), "Taint originated here"));
    }
    store
}

#[test]
fn tainted_system_argument_is_reported() {
    let catalog = RuleCatalog::new();
    let mut host = MockHost::new();
    let store = tainted_store(&[sym(1)]);

    let site = call("system", vec![val_arg(1)]);
    assert!(run_pre_checks(&catalog, &site, &mut host, &store));

    assert_eq!(host.reports.len(), 1);
    let report = &host.reports[0];
    assert_eq!(report.kind, BugKind::SystemCall);
    assert!(report.message.contains("system call"));
    assert_eq!(report.trace[0].note, "Taint originated here");
}

#[test]
fn pointee_taint_is_preferred_over_the_pointer() {
    let catalog = RuleCatalog::new();
    let mut host = MockHost::new();
    host.bind(RegionId(10), sym(5));
    let store = tainted_store(&[sym(5)]);

    let site = call("popen", vec![buf_arg(10), val_arg(2)]);
    assert!(run_pre_checks(&catalog, &site, &mut host, &store));
    assert_eq!(host.reports[0].kind, BugKind::SystemCall);
    assert!(!host.reports[0].trace.is_empty());
}

#[test]
fn constant_buffer_size_is_not_reported() {
    let catalog = RuleCatalog::new();
    let mut host = MockHost::new();
    let store = tainted_store(&[sym(1)]);

    let decl = CalleeDecl::named("memcpy").with_memfn(MemFnKind::Memcpy);
    let site = CallSite::new(
        Some(decl),
        vec![buf_arg(10), buf_arg(20), const_arg(64)],
        SourceSpan::default(),
    );

    assert!(!run_pre_checks(&catalog, &site, &mut host, &store));
    assert!(host.reports.is_empty());
}

#[test]
fn tainted_buffer_size_is_reported() {
    let catalog = RuleCatalog::new();
    let mut host = MockHost::new();
    let store = tainted_store(&[sym(1)]);

    let decl = CalleeDecl::named("memcpy").with_memfn(MemFnKind::Memcpy);
    let site = CallSite::new(
        Some(decl),
        vec![buf_arg(10), buf_arg(20), val_arg(1)],
        SourceSpan::default(),
    );

    assert!(run_pre_checks(&catalog, &site, &mut host, &store));
    assert_eq!(host.reports[0].kind, BugKind::BufferSize);
}

#[test]
fn allocator_size_check_needs_the_library_gate() {
    let catalog = RuleCatalog::new();
    let mut host = MockHost::new();
    let store = tainted_store(&[sym(1)]);

    // A user-defined function that merely shares the name is not a sink.
    let site = call("malloc", vec![val_arg(1)]);
    assert!(!run_pre_checks(&catalog, &site, &mut host, &store));

    let site = CallSite::new(
        Some(CalleeDecl::c_library("malloc")),
        vec![val_arg(1)],
        SourceSpan::default(),
    );
    assert!(run_pre_checks(&catalog, &site, &mut host, &store));
    assert_eq!(host.reports[0].kind, BugKind::BufferSize);
}

#[test]
fn format_annotation_drives_the_format_check() {
    let catalog = RuleCatalog::new();
    let mut host = MockHost::new();
    host.bind(RegionId(10), sym(5));
    let store = tainted_store(&[sym(5)]);

    let decl = CalleeDecl::named("log_event").with_format_arg(1);
    let site = CallSite::new(
        Some(decl),
        vec![val_arg(2), buf_arg(10)],
        SourceSpan::default(),
    );

    assert!(run_pre_checks(&catalog, &site, &mut host, &store));
    assert_eq!(host.reports[0].kind, BugKind::FormatString);
}

#[test]
fn format_annotation_out_of_range_is_ignored() {
    let catalog = RuleCatalog::new();
    let mut host = MockHost::new();
    let store = tainted_store(&[sym(1)]);

    // Annotation points at argument 2, the call only passes one.
    let decl = CalleeDecl::named("log_event").with_format_arg(2);
    let site = CallSite::new(Some(decl), vec![val_arg(1)], SourceSpan::default());

    assert!(!run_pre_checks(&catalog, &site, &mut host, &store));
}

#[test]
fn setproctitle_is_recognized_by_name() {
    let catalog = RuleCatalog::new();
    let mut host = MockHost::new();
    host.bind(RegionId(10), sym(5));
    let store = tainted_store(&[sym(5)]);

    let site = call("my_setproctitle_wrapper", vec![buf_arg(10)]);
    assert!(run_pre_checks(&catalog, &site, &mut host, &store));
    assert_eq!(host.reports[0].kind, BugKind::FormatString);
}

#[test]
fn first_emitting_check_wins() {
    let mut catalog = RuleCatalog::new();
    catalog.add_sink("system", crate::rules::ArgVec::from_slice(&[0]));

    let mut host = MockHost::new();
    let store = tainted_store(&[sym(1)]);

    // `system` matches both the builtin sink list and the custom sink; only
    // the builtin check reports.
    let site = call("system", vec![val_arg(1)]);
    assert!(run_pre_checks(&catalog, &site, &mut host, &store));
    assert_eq!(host.reports.len(), 1);
    assert_eq!(host.reports[0].kind, BugKind::SystemCall);
}

#[test]
fn custom_sink_skips_out_of_range_positions() {
    let mut catalog = RuleCatalog::new();
    catalog.add_sink("run_query", crate::rules::ArgVec::from_slice(&[3, 0]));

    let mut host = MockHost::new();
    let store = tainted_store(&[sym(1)]);

    let site = call("run_query", vec![val_arg(1)]);
    assert!(run_pre_checks(&catalog, &site, &mut host, &store));
    assert_eq!(host.reports[0].kind, BugKind::CustomSink);
}

#[test]
fn no_diagnostic_node_means_no_report() {
    let catalog = RuleCatalog::new();
    let mut host = MockHost::new();
    host.node_available = false;
    let store = tainted_store(&[sym(1)]);

    let site = call("system", vec![val_arg(1)]);
    assert!(!run_pre_checks(&catalog, &site, &mut host, &store));
    assert!(host.reports.is_empty());
}

#[test]
fn unresolved_callee_runs_no_checks() {
    let catalog = RuleCatalog::new();
    let mut host = MockHost::new();
    let store = tainted_store(&[sym(1)]);

    let site = CallSite::new(None, vec![val_arg(1)], SourceSpan::default());
    assert!(!run_pre_checks(&catalog, &site, &mut host, &store));
}

#[test]
fn untainted_arguments_stay_quiet() {
    let catalog = RuleCatalog::new();
    let mut host = MockHost::new();
    let store = TaintStore::new();

    let site = call("system", vec![val_arg(1)]);
    assert!(!run_pre_checks(&catalog, &site, &mut host, &store));
    assert!(host.reports.is_empty());
}
