//! Propagation rules and the catalog that resolves a callee to one.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::builtins;
use crate::host::{CallSite, CalleeDecl, HostContext};
use crate::state::TaintStore;

/// Argument positions named by a rule. Nearly always one or two entries.
pub type ArgVec = SmallVec<[u32; 2]>;

/// Synthetic index denoting the call's return value.
pub const RETURN_VALUE_INDEX: u32 = u32::MAX - 1;

/// Synthetic index denoting "no such argument"; a destination carrying it
/// can never match a real argument.
pub const INVALID_ARG_INDEX: u32 = u32::MAX;

/// Context-dependent override consulted after the default verdict is
/// computed (e.g. `socket` only taints for network address families). The
/// returned value replaces the verdict.
pub type RulePredicate = fn(bool, &CallSite, &dyn HostContext, &TaintStore) -> bool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VariadicKind {
    #[default]
    None,
    /// Arguments from `variadic_start` on are additional taint sources.
    #[serde(rename = "Src")]
    Source,
    /// Non-const pointer/reference arguments from `variadic_start` on are
    /// additional taint destinations.
    #[serde(rename = "Dst")]
    Dest,
}

/// How taint flows through one named function.
///
/// If any source argument is tainted, every destination argument (and the
/// return value, when `RETURN_VALUE_INDEX` is listed) becomes tainted. An
/// empty source set fires unconditionally; that is how pure sources like
/// `getenv` are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationRule {
    pub src_args: ArgVec,
    pub dst_args: ArgVec,
    pub variadic: VariadicKind,
    pub variadic_start: u32,
    pub predicate: Option<RulePredicate>,
}

impl Default for PropagationRule {
    fn default() -> Self {
        PropagationRule {
            src_args: ArgVec::new(),
            dst_args: ArgVec::new(),
            variadic: VariadicKind::None,
            variadic_start: INVALID_ARG_INDEX,
            predicate: None,
        }
    }
}

impl PropagationRule {
    /// The canonical "no rule" sentinel.
    pub fn none() -> Self {
        PropagationRule::default()
    }

    pub fn new(src: &[u32], dst: &[u32]) -> Self {
        PropagationRule {
            src_args: ArgVec::from_slice(src),
            dst_args: ArgVec::from_slice(dst),
            ..PropagationRule::default()
        }
    }

    pub fn variadic(src: &[u32], dst: &[u32], kind: VariadicKind, start: u32) -> Self {
        PropagationRule {
            src_args: ArgVec::from_slice(src),
            dst_args: ArgVec::from_slice(dst),
            variadic: kind,
            variadic_start: start,
            ..PropagationRule::default()
        }
    }

    pub fn with_predicate(mut self, predicate: RulePredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// True for the sentinel: nothing to test, nothing to taint.
    pub fn is_noop(&self) -> bool {
        self.src_args.is_empty() && self.dst_args.is_empty() && self.variadic == VariadicKind::None
    }
}

/// Name-keyed rule tables. Immutable once the checker is built; shared
/// read-only across every path the host explores.
#[derive(Debug, Clone, Default)]
pub struct RuleCatalog {
    propagations: HashMap<String, PropagationRule>,
    filters: HashMap<String, ArgVec>,
    sinks: HashMap<String, ArgVec>,
}

impl RuleCatalog {
    pub fn new() -> Self {
        RuleCatalog::default()
    }

    /// Register a custom propagation rule. Re-registering a name replaces
    /// the earlier entry.
    pub fn add_propagation(&mut self, name: impl Into<String>, rule: PropagationRule) {
        self.propagations.insert(name.into(), rule);
    }

    /// Register filter positions for a name. Reserved: filters are stored
    /// and queryable but no check consults them yet.
    pub fn add_filter(&mut self, name: impl Into<String>, args: ArgVec) {
        self.filters.insert(name.into(), args);
    }

    pub fn add_sink(&mut self, name: impl Into<String>, args: ArgVec) {
        self.sinks.insert(name.into(), args);
    }

    pub fn custom_propagation(&self, name: &str) -> Option<&PropagationRule> {
        self.propagations.get(name)
    }

    pub fn filter_args(&self, name: &str) -> Option<&[u32]> {
        self.filters.get(name).map(|v| v.as_slice())
    }

    pub fn sink_args(&self, name: &str) -> Option<&[u32]> {
        self.sinks.get(name).map(|v| v.as_slice())
    }

    /// Resolve the propagation rule for a callee. First match wins: the
    /// exact-name builtin table, then structural memory/string recognition,
    /// then C-library signatures, then custom configuration. No merging.
    pub fn lookup(&self, decl: &CalleeDecl) -> PropagationRule {
        if let Some(rule) = builtins::builtin_rule(&decl.name) {
            return rule;
        }

        if let Some(kind) = decl.memfn {
            return builtins::memory_rule(kind);
        }

        if decl.is_c_library {
            if let Some(rule) = builtins::c_library_rule(&decl.name) {
                return rule;
            }
        }

        self.propagations
            .get(decl.name.as_str())
            .cloned()
            .unwrap_or_else(PropagationRule::none)
    }
}

#[cfg(test)]
use crate::host::MemFnKind;

#[test]
fn lookup_is_idempotent() {
    let catalog = RuleCatalog::new();
    let decl = CalleeDecl::named("getenv");
    assert_eq!(catalog.lookup(&decl), catalog.lookup(&decl));
}

#[test]
fn builtin_wins_over_custom_entry() {
    let mut catalog = RuleCatalog::new();
    catalog.add_propagation("getenv", PropagationRule::new(&[0], &[0]));

    let rule = catalog.lookup(&CalleeDecl::named("getenv"));
    assert!(rule.src_args.is_empty());
    assert_eq!(rule.dst_args.as_slice(), &[RETURN_VALUE_INDEX]);
}

#[test]
fn unknown_name_resolves_to_noop() {
    let catalog = RuleCatalog::new();
    assert!(catalog.lookup(&CalleeDecl::named("frobnicate")).is_noop());
}

#[test]
fn structural_kind_matches_aliases() {
    let catalog = RuleCatalog::new();
    let decl = CalleeDecl::named("__memcpy_chk").with_memfn(MemFnKind::Memcpy);

    let rule = catalog.lookup(&decl);
    assert_eq!(rule.src_args.as_slice(), &[1, 2]);
    assert_eq!(rule.dst_args.as_slice(), &[0, RETURN_VALUE_INDEX]);
}

#[test]
fn c_library_rules_require_the_library_gate() {
    let catalog = RuleCatalog::new();

    // Some local function that happens to be called strcpy.
    assert!(catalog.lookup(&CalleeDecl::named("strcpy")).is_noop());

    let rule = catalog.lookup(&CalleeDecl::c_library("strcpy"));
    assert_eq!(rule.src_args.as_slice(), &[1]);
    assert_eq!(rule.dst_args.as_slice(), &[0, RETURN_VALUE_INDEX]);
}

#[test]
fn re_registering_overwrites() {
    let mut catalog = RuleCatalog::new();
    catalog.add_propagation("api_read", PropagationRule::new(&[0], &[RETURN_VALUE_INDEX]));
    catalog.add_propagation("api_read", PropagationRule::new(&[1], &[0]));

    let rule = catalog.custom_propagation("api_read").unwrap();
    assert_eq!(rule.src_args.as_slice(), &[1]);
    assert_eq!(rule.dst_args.as_slice(), &[0]);
}
