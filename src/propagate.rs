//! Pre-call half of rule evaluation: test a rule's sources against the
//! current store and record which positions must become tainted once the
//! call returns. The post-call half lives in [`crate::resolve`].

use std::sync::Arc;

use tracing::debug;

use crate::host::{CallArg, CallSite, HostContext};
use crate::rules::{PropagationRule, RETURN_VALUE_INDEX, VariadicKind};
use crate::state::{TaintIntent, TaintOrigin, TaintStore};

const NOTE_ORIGINATED: &str = "Taint originated here";
const NOTE_PROPAGATED: &str = "Taint propagated here";

impl PropagationRule {
    /// Evaluate the rule against `call`. On a fire, returns a successor
    /// store whose pending intent names every destination to mark at the
    /// post-call visit; `None` means no state change.
    ///
    /// A rule with no in-range source argument fires unconditionally; that
    /// is how pure sources (`getenv`, `scanf`) are expressed.
    pub(crate) fn process(
        &self,
        call: &CallSite,
        ctx: &dyn HostContext,
        store: &TaintStore,
    ) -> Option<TaintStore> {
        let mut tainted = true;
        let mut witness: Option<&CallArg> = None;

        for &index in &self.src_args {
            let Some(arg) = call.arg(index) else { continue };
            tainted = arg_is_tainted(arg, ctx, store);
            if tainted {
                witness = Some(arg);
                break;
            }
        }

        if !tainted && self.variadic == VariadicKind::Source {
            for (_, arg) in args_from(call, self.variadic_start) {
                if arg_is_tainted(arg, ctx, store) {
                    tainted = true;
                    witness = Some(arg);
                    break;
                }
            }
        }

        if let Some(predicate) = self.predicate {
            tainted = predicate(tainted, call, ctx, store);
        }

        if !tainted {
            return None;
        }

        // Destinations inherit the witness's provenance chain; a fire with
        // no tainted source (pure source rules, predicate overrides) starts
        // a fresh chain at the call itself.
        let origin = match witness.and_then(|arg| taint_origin(arg, ctx, store)) {
            Some(parent) => TaintOrigin::derived(call.span, NOTE_PROPAGATED, parent),
            None => TaintOrigin::root(call.span, NOTE_ORIGINATED),
        };

        let mut intent = TaintIntent::new(origin);
        for &index in &self.dst_args {
            // The return value has no argument slot; everything else must
            // be in range to be recorded.
            if index == RETURN_VALUE_INDEX || index < call.arg_count() {
                intent.push(index);
            }
        }

        if self.variadic == VariadicKind::Dest {
            for (index, arg) in args_from(call, self.variadic_start) {
                if arg.ty.is_mutable_target() {
                    intent.push(index);
                }
            }
        }

        if intent.is_empty() {
            return None;
        }

        debug!(
            target: "taint",
            "rule fired for `{}`: pending {:?}",
            call.callee_name().unwrap_or("<indirect>"),
            intent.indices()
        );

        let mut next = store.clone();
        next.set_intent(intent);
        Some(next)
    }
}

/// Source test: the value itself, stdin, or (for pointer arguments) the
/// immediate pointee. One level deep only.
pub(crate) fn arg_is_tainted(arg: &CallArg, ctx: &dyn HostContext, store: &TaintStore) -> bool {
    if store.is_value_tainted(&arg.value) || ctx.is_stdin(&arg.value) {
        return true;
    }
    if !arg.ty.is_pointer() {
        return false;
    }
    match arg.value.as_region() {
        Some(region) => store.is_value_tainted(&ctx.read_region(region)),
        None => false,
    }
}

/// Provenance chain backing [`arg_is_tainted`], when one is recorded. Stdin
/// carries no chain; it starts fresh at the argument.
fn taint_origin(
    arg: &CallArg,
    ctx: &dyn HostContext,
    store: &TaintStore,
) -> Option<Arc<TaintOrigin>> {
    if let Some(origin) = store.origin_of(&arg.value) {
        return Some(origin);
    }
    if arg.ty.is_pointer() {
        if let Some(region) = arg.value.as_region() {
            if let Some(origin) = store.origin_of(&ctx.read_region(region)) {
                return Some(origin);
            }
        }
    }
    if ctx.is_stdin(&arg.value) {
        return Some(TaintOrigin::root(arg.span, NOTE_ORIGINATED));
    }
    None
}

fn args_from(call: &CallSite, start: u32) -> impl Iterator<Item = (u32, &CallArg)> {
    call.args
        .iter()
        .enumerate()
        .skip(start as usize)
        .map(|(i, arg)| (i as u32, arg))
}

#[cfg(test)]
use crate::host::mock::{buf_arg, call, const_buf_arg, sym, val_arg, MockHost};
#[cfg(test)]
use crate::host::{RegionId, SourceSpan};

#[test]
fn tainted_source_fires_and_records_destinations() {
    let host = MockHost::new();
    let mut store = TaintStore::new();
    store.mark_value(&sym(1), TaintOrigin::root(SourceSpan::default(), "test"));

    let rule = PropagationRule::new(&[1], &[0, RETURN_VALUE_INDEX]);
    let site = call("strcpy", vec![buf_arg(10), val_arg(1)]);

    let next = rule.process(&site, &host, &store).unwrap();
    assert_eq!(next.intent().unwrap().indices(), &[0, RETURN_VALUE_INDEX]);
    // The input store is untouched.
    assert!(store.intent().is_none());
}

#[test]
fn untainted_source_does_not_fire() {
    let host = MockHost::new();
    let store = TaintStore::new();

    let rule = PropagationRule::new(&[1], &[0]);
    let site = call("strcpy", vec![buf_arg(10), val_arg(1)]);

    assert!(rule.process(&site, &host, &store).is_none());
}

#[test]
fn sourceless_rule_fires_unconditionally() {
    let host = MockHost::new();
    let store = TaintStore::new();

    let rule = PropagationRule::new(&[], &[RETURN_VALUE_INDEX]);
    let site = call("getenv", vec![val_arg(1)]);

    let next = rule.process(&site, &host, &store).unwrap();
    assert_eq!(next.intent().unwrap().indices(), &[RETURN_VALUE_INDEX]);
}

#[test]
fn all_sources_out_of_range_fires() {
    let host = MockHost::new();
    let store = TaintStore::new();

    // read(0, buf, n): rule tests args 0 and 2, call only has one arg.
    let rule = PropagationRule::new(&[0, 2], &[1, RETURN_VALUE_INDEX]);
    let site = call("read", vec![val_arg(1)]);

    let next = rule.process(&site, &host, &store).unwrap();
    assert_eq!(next.intent().unwrap().indices(), &[RETURN_VALUE_INDEX]);
}

#[test]
fn out_of_range_sources_are_skipped_not_tested() {
    let host = MockHost::new();
    let mut store = TaintStore::new();
    store.mark_value(&sym(7), TaintOrigin::root(SourceSpan::default(), "test"));

    // Arg 5 does not exist; arg 0 is tainted and must still be found.
    let rule = PropagationRule::new(&[5, 0], &[RETURN_VALUE_INDEX]);
    let site = call("f", vec![val_arg(7)]);

    assert!(rule.process(&site, &host, &store).is_some());
}

#[test]
fn variadic_sources_are_scanned_when_fixed_sources_miss() {
    let host = MockHost::new();
    let mut store = TaintStore::new();
    store.mark_value(&sym(9), TaintOrigin::root(SourceSpan::default(), "test"));

    let rule = PropagationRule::variadic(&[1], &[0], VariadicKind::Source, 2);
    let site = call(
        "snprintf",
        vec![buf_arg(10), val_arg(1), val_arg(2), val_arg(9)],
    );

    let next = rule.process(&site, &host, &store).unwrap();
    assert_eq!(next.intent().unwrap().indices(), &[0]);
}

#[test]
fn variadic_destinations_skip_immutable_arguments() {
    let host = MockHost::new();
    let store = TaintStore::new();

    let rule = PropagationRule::variadic(&[], &[], VariadicKind::Dest, 1);
    let site = call(
        "scanf",
        vec![const_buf_arg(1), buf_arg(2), val_arg(3), buf_arg(4)],
    );

    let next = rule.process(&site, &host, &store).unwrap();
    assert_eq!(next.intent().unwrap().indices(), &[1, 3]);
}

#[test]
fn predicate_can_veto_a_fire() {
    fn veto(_: bool, _: &CallSite, _: &dyn HostContext, _: &TaintStore) -> bool {
        false
    }

    let host = MockHost::new();
    let store = TaintStore::new();

    let rule = PropagationRule::new(&[], &[RETURN_VALUE_INDEX]).with_predicate(veto);
    let site = call("socket", vec![val_arg(1)]);

    assert!(rule.process(&site, &host, &store).is_none());
}

#[test]
fn predicate_can_force_a_fire() {
    fn force(_: bool, _: &CallSite, _: &dyn HostContext, _: &TaintStore) -> bool {
        true
    }

    let host = MockHost::new();
    let store = TaintStore::new();

    // Source arg 0 is untainted, but the predicate overrides the verdict.
    let rule = PropagationRule::new(&[0], &[RETURN_VALUE_INDEX]).with_predicate(force);
    let site = call("f", vec![val_arg(1)]);

    assert!(rule.process(&site, &host, &store).is_some());
}

#[test]
fn pointee_taint_is_seen_one_level_deep() {
    let mut host = MockHost::new();
    let mut store = TaintStore::new();

    // Region 10 holds a tainted symbol; region 20 holds a pointer to region 10.
    host.bind(RegionId(10), sym(5));
    host.bind(RegionId(20), crate::host::mock::ptr_to(10));
    store.mark_value(&sym(5), TaintOrigin::root(SourceSpan::default(), "test"));

    let rule = PropagationRule::new(&[0], &[RETURN_VALUE_INDEX]);

    // Pointer to the tainted data: seen.
    let direct = call("f", vec![buf_arg(10)]);
    assert!(rule.process(&direct, &host, &store).is_some());

    // Pointer to a pointer to tainted data: not traversed.
    let indirect = call("f", vec![buf_arg(20)]);
    assert!(rule.process(&indirect, &host, &store).is_none());
}

#[test]
fn stdin_argument_counts_as_tainted() {
    let mut host = MockHost::new();
    host.stdin_value = Some(crate::host::mock::ptr_to(99));
    let store = TaintStore::new();

    // fgets(buf, n, stream): stream is arg 2.
    let rule = PropagationRule::new(&[2], &[0, RETURN_VALUE_INDEX]);
    let site = call(
        "fgets",
        vec![buf_arg(1), val_arg(2), buf_arg(99)],
    );

    let next = rule.process(&site, &host, &store).unwrap();
    assert_eq!(next.intent().unwrap().indices(), &[0, RETURN_VALUE_INDEX]);
}

#[test]
fn propagation_extends_the_provenance_chain() {
    let host = MockHost::new();
    let mut store = TaintStore::new();
    let root = TaintOrigin::root(SourceSpan::new(1, 5), NOTE_ORIGINATED);
    store.mark_value(&sym(1), root);

    let rule = PropagationRule::new(&[0], &[RETURN_VALUE_INDEX]);
    let site = CallSite::new(
        Some(crate::host::CalleeDecl::named("strdup")),
        vec![val_arg(1)],
        SourceSpan::new(10, 20),
    );

    let next = rule.process(&site, &host, &store).unwrap();
    let origin = next.intent().unwrap().origin().clone();
    assert_eq!(origin.note, NOTE_PROPAGATED);
    assert_eq!(origin.span, SourceSpan::new(10, 20));
    let parent = origin.parent.clone().unwrap();
    assert_eq!(parent.note, NOTE_ORIGINATED);
    assert_eq!(parent.span, SourceSpan::new(1, 5));
}
