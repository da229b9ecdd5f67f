//! Post-call half of rule evaluation: commit the pending intent onto the
//! values that only exist once the call has returned.

use tracing::debug;

use crate::host::{CallSite, HostContext};
use crate::rules::RETURN_VALUE_INDEX;
use crate::state::TaintStore;

/// Commit the store's pending intent for `call`. Returns the successor
/// store, or `None` when nothing was pending. The intent is consumed in
/// every case, including when all of its entries drop out: stale markers
/// must never leak into the next call.
pub(crate) fn apply_intent(
    call: &CallSite,
    ctx: &dyn HostContext,
    store: &TaintStore,
) -> Option<TaintStore> {
    let mut next = store.clone();
    let intent = next.take_intent()?;
    let origin = intent.origin().clone();

    let before = next.mark_count();
    for &index in intent.indices() {
        if index == RETURN_VALUE_INDEX {
            if let Some(result) = &call.result {
                next.mark_value(result, origin.clone());
            }
            continue;
        }

        // Argument destinations taint the pointed-to memory. Non-location
        // values and out-of-range entries drop silently.
        let Some(arg) = call.arg(index) else { continue };
        let Some(region) = arg.value.as_region() else { continue };
        next.mark_region(region, origin.clone());

        // The value the callee left in that region is reachable through its
        // own symbol as well; cover it so region-independent copies stay
        // tainted.
        let written = ctx.read_region(region);
        next.mark_value(&written, origin.clone());
    }

    debug!(
        target: "taint",
        "post-call commit for `{}`: {} new marks",
        call.callee_name().unwrap_or("<indirect>"),
        next.mark_count() - before
    );
    Some(next)
}

#[cfg(test)]
use crate::host::mock::{buf_arg, call, sym, val_arg, MockHost};
#[cfg(test)]
use crate::host::{RegionId, SourceSpan};
#[cfg(test)]
use crate::state::{TaintIntent, TaintOrigin};

#[cfg(test)]
fn intent_with(indices: &[u32]) -> TaintIntent {
    let mut intent = TaintIntent::new(TaintOrigin::root(SourceSpan::new(3, 9), "test"));
    for &i in indices {
        intent.push(i);
    }
    intent
}

#[test]
fn pending_marks_commit_after_the_call() {
    let host = MockHost::new();
    let mut store = TaintStore::new();
    store.set_intent(intent_with(&[0, RETURN_VALUE_INDEX]));

    let site = call("gets", vec![buf_arg(10)]).with_result(sym(42));
    let next = apply_intent(&site, &host, &store).unwrap();

    assert!(next.is_region_tainted(RegionId(10)));
    assert!(next.is_value_tainted(&sym(42)));
    assert!(next.intent().is_none());
}

#[test]
fn no_pending_intent_means_no_transition() {
    let host = MockHost::new();
    let store = TaintStore::new();
    let site = call("gets", vec![buf_arg(10)]);

    assert!(apply_intent(&site, &host, &store).is_none());
}

#[test]
fn intent_is_cleared_even_when_every_entry_drops() {
    let host = MockHost::new();
    let mut store = TaintStore::new();
    store.set_intent(intent_with(&[5]));

    let site = call("f", vec![val_arg(1)]);
    let next = apply_intent(&site, &host, &store).unwrap();

    assert_eq!(next.mark_count(), 0);
    assert!(next.intent().is_none());
}

#[test]
fn missing_result_skips_the_return_mark() {
    let host = MockHost::new();
    let mut store = TaintStore::new();
    store.set_intent(intent_with(&[RETURN_VALUE_INDEX]));

    let site = call("getenv", vec![val_arg(1)]);
    let next = apply_intent(&site, &host, &store).unwrap();

    assert_eq!(next.mark_count(), 0);
}

#[test]
fn non_pointer_destination_is_skipped() {
    let host = MockHost::new();
    let mut store = TaintStore::new();
    store.set_intent(intent_with(&[0]));

    let site = call("f", vec![val_arg(1)]);
    let next = apply_intent(&site, &host, &store).unwrap();

    assert!(!next.is_value_tainted(&sym(1)));
    assert_eq!(next.mark_count(), 0);
}

#[test]
fn region_marks_cover_the_value_the_callee_wrote() {
    let mut host = MockHost::new();
    host.bind(RegionId(10), sym(5));

    let mut store = TaintStore::new();
    store.set_intent(intent_with(&[0]));

    let site = call("scanf_target", vec![buf_arg(10)]);
    let next = apply_intent(&site, &host, &store).unwrap();

    assert!(next.is_region_tainted(RegionId(10)));
    assert!(next.is_value_tainted(&sym(5)));
}

#[test]
fn committed_marks_carry_the_pending_origin() {
    let host = MockHost::new();
    let mut store = TaintStore::new();
    store.set_intent(intent_with(&[RETURN_VALUE_INDEX]));

    let site = call("getenv", vec![val_arg(1)]).with_result(sym(42));
    let next = apply_intent(&site, &host, &store).unwrap();

    let origin = next.origin_of(&sym(42)).unwrap();
    assert_eq!(origin.note, "test");
    assert_eq!(origin.span, SourceSpan::new(3, 9));
}

#[test]
fn input_store_is_never_mutated() {
    let host = MockHost::new();
    let mut store = TaintStore::new();
    store.set_intent(intent_with(&[RETURN_VALUE_INDEX]));
    let snapshot = store.clone();

    let site = call("getenv", vec![]).with_result(sym(42));
    let _ = apply_intent(&site, &host, &snapshot).unwrap();

    assert!(store.intent().is_some());
    assert!(!store.is_value_tainted(&sym(42)));
}
