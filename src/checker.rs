//! The checker façade. One value owns the rule catalog; the host calls
//! [`TaintChecker::pre_call`] before it evaluates a call expression and
//! [`TaintChecker::post_call`] after the call returned.

use std::path::Path;

use crate::checks;
use crate::config::{ConfigWarning, TaintConfig};
use crate::errors::ErebusResult;
use crate::host::{CallSite, HostContext};
use crate::resolve;
use crate::rules::RuleCatalog;
use crate::state::TaintStore;

pub struct TaintChecker {
    catalog: RuleCatalog,
}

impl TaintChecker {
    /// Builtin rules only.
    pub fn new() -> Self {
        TaintChecker {
            catalog: RuleCatalog::new(),
        }
    }

    /// Builtins extended by `config`. The warnings describe entries that
    /// were disabled; the checker is usable regardless.
    pub fn with_config(config: TaintConfig) -> (Self, Vec<ConfigWarning>) {
        let mut catalog = RuleCatalog::new();
        let warnings = config.apply(&mut catalog);
        (TaintChecker { catalog }, warnings)
    }

    /// Build from a configuration file. A missing file yields a
    /// builtins-only checker; content problems are logged as warnings at
    /// the point the loader finds them.
    pub fn from_config_path(path: &Path) -> ErebusResult<Self> {
        let (config, _) = TaintConfig::load(path)?;
        let (checker, _) = Self::with_config(config);
        Ok(checker)
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    /// Pre-visit: run the sink checks, then evaluate the callee's
    /// propagation rule. Returns the successor store to transition to, or
    /// `None` for no state change. A call that produced a diagnostic gets
    /// no propagation.
    pub fn pre_call(
        &self,
        ctx: &mut dyn HostContext,
        call: &CallSite,
        store: &TaintStore,
    ) -> Option<TaintStore> {
        if checks::run_pre_checks(&self.catalog, call, ctx, store) {
            return None;
        }

        let decl = call.callee.as_ref()?;
        if decl.name.is_empty() {
            return None;
        }

        let rule = self.catalog.lookup(decl);
        if rule.is_noop() {
            return None;
        }
        rule.process(call, ctx, store)
    }

    /// Post-visit: commit whatever the pre-visit left pending. The return
    /// value and freshly written output buffers only exist now.
    pub fn post_call(
        &self,
        ctx: &dyn HostContext,
        call: &CallSite,
        store: &TaintStore,
    ) -> Option<TaintStore> {
        resolve::apply_intent(call, ctx, store)
    }
}

impl Default for TaintChecker {
    fn default() -> Self {
        TaintChecker::new()
    }
}

#[cfg(test)]
use crate::host::mock::{buf_arg, c_lib_call, call, const_arg, ptr_to, sym, val_arg, MockHost};
#[cfg(test)]
use crate::host::{CalleeDecl, MemFnKind, RegionId, SourceSpan, SymValue, SymbolId};
#[cfg(test)]
use crate::report::BugKind;

/// Drive one call through both visits, unwrapping the pre-visit fire.
#[cfg(test)]
fn run_call(checker: &TaintChecker, host: &mut MockHost, site: &CallSite, store: &TaintStore) -> TaintStore {
    let pre = checker.pre_call(host, site, store).unwrap();
    checker.post_call(host, site, &pre).unwrap()
}

#[test]
fn environment_variable_reaching_system_is_reported() {
    let checker = TaintChecker::new();
    let mut host = MockHost::new();
    let store = TaintStore::new();

    // cmd = getenv("CMD");
    let getenv = call("getenv", vec![val_arg(1)]).with_result(sym(42));
    let store = run_call(&checker, &mut host, &getenv, &store);
    assert!(store.is_value_tainted(&sym(42)));

    // system(cmd);
    let system = call("system", vec![val_arg(42)]);
    assert!(checker.pre_call(&mut host, &system, &store).is_none());

    assert_eq!(host.reports.len(), 1);
    let report = &host.reports[0];
    assert_eq!(report.kind, BugKind::SystemCall);
    assert_eq!(report.trace[0].note, "Taint originated here");
}

#[test]
fn string_copy_carries_taint_to_the_destination() {
    let checker = TaintChecker::new();
    let mut host = MockHost::new();
    let store = TaintStore::new();

    // gets(buf) taints what buf points at.
    let gets = call("gets", vec![buf_arg(10)]).with_result(ptr_to(10));
    let store = run_call(&checker, &mut host, &gets, &store);
    assert!(store.is_region_tainted(RegionId(10)));

    // strcpy(dst, buf) taints the destination buffer too.
    let strcpy = c_lib_call("strcpy", vec![buf_arg(20), buf_arg(10)]).with_result(ptr_to(20));
    let store = run_call(&checker, &mut host, &strcpy, &store);
    assert!(store.is_region_tainted(RegionId(20)));

    // A later load out of dst sees the taint.
    let loaded = SymValue::Derived {
        symbol: SymbolId(7),
        parent: RegionId(20),
    };
    assert!(store.is_value_tainted(&loaded));
}

#[test]
fn constant_copy_size_is_not_a_finding() {
    let checker = TaintChecker::new();
    let mut host = MockHost::new();
    let mut store = TaintStore::new();
    store.mark_value(
        &ptr_to(30),
        crate::state::TaintOrigin::root(SourceSpan::default(), "Taint originated here"),
    );

    let decl = CalleeDecl::named("memcpy").with_memfn(MemFnKind::Memcpy);
    let memcpy = CallSite::new(
        Some(decl),
        vec![buf_arg(20), buf_arg(30), const_arg(64)],
        SourceSpan::default(),
    )
    .with_result(ptr_to(20));

    // No diagnostic for the constant size, but propagation still runs.
    let store = run_call(&checker, &mut host, &memcpy, &store);
    assert!(host.reports.is_empty());
    assert!(store.is_region_tainted(RegionId(20)));
}

#[test]
fn socket_taints_only_remote_domains() {
    let checker = TaintChecker::new();
    let mut host = MockHost::new();
    let store = TaintStore::new();

    let inet = call("socket", vec![val_arg(1).with_spelling("AF_INET")]).with_result(sym(50));
    let store_inet = run_call(&checker, &mut host, &inet, &store);
    assert!(store_inet.is_value_tainted(&sym(50)));

    let unix = call("socket", vec![val_arg(2).with_spelling("AF_UNIX")]).with_result(sym(51));
    assert!(checker.pre_call(&mut host, &unix, &store).is_none());
}

#[test]
fn scanf_taints_every_output_pointer_but_not_the_format() {
    let checker = TaintChecker::new();
    let mut host = MockHost::new();
    let store = TaintStore::new();

    let scanf = call("scanf", vec![buf_arg(1), buf_arg(10), buf_arg(20)]).with_result(sym(60));
    let store = run_call(&checker, &mut host, &scanf, &store);

    assert!(store.is_region_tainted(RegionId(10)));
    assert!(store.is_region_tainted(RegionId(20)));
    assert!(!store.is_region_tainted(RegionId(1)));
    // Only the variadic outputs are pending, not the return value.
    assert!(!store.is_value_tainted(&sym(60)));
}

#[test]
fn paths_forked_from_one_store_stay_independent() {
    let checker = TaintChecker::new();
    let mut host = MockHost::new();
    let base = TaintStore::new();

    let getenv = call("getenv", vec![]).with_result(sym(42));
    let taken = run_call(&checker, &mut host, &getenv, &base);

    assert!(taken.is_value_tainted(&sym(42)));
    assert!(!base.is_value_tainted(&sym(42)));
    assert!(base.intent().is_none());
}

#[test]
fn unknown_callees_produce_no_transition() {
    let checker = TaintChecker::new();
    let mut host = MockHost::new();
    let store = TaintStore::new();

    let site = call("frobnicate", vec![val_arg(1)]);
    assert!(checker.pre_call(&mut host, &site, &store).is_none());
    assert!(checker.post_call(&host, &site, &store).is_none());
}

#[test]
fn a_reported_call_does_not_also_propagate() {
    let (checker, warnings) = TaintChecker::with_config(
        TaintConfig::from_toml(
            r#"
            [[Propagations]]
            Name = "system"
            SrcArgs = [0]
            DstArgs = [-1]
        "#,
        )
        .0,
    );
    assert!(warnings.is_empty());

    let mut host = MockHost::new();
    let mut store = TaintStore::new();
    store.mark_value(
        &sym(1),
        crate::state::TaintOrigin::root(SourceSpan::default(), "Taint originated here"),
    );

    // The builtin sink check fires first and suppresses propagation, so no
    // intent is pending afterwards.
    let site = call("system", vec![val_arg(1)]).with_result(sym(2));
    assert!(checker.pre_call(&mut host, &site, &store).is_none());
    assert_eq!(host.reports.len(), 1);
    assert!(checker.post_call(&host, &site, &store).is_none());
}

#[test]
fn unplaceable_report_does_not_block_propagation() {
    let (checker, warnings) = TaintChecker::with_config(
        TaintConfig::from_toml(
            r#"
            [[Propagations]]
            Name = "system"
            SrcArgs = [0]
            DstArgs = [-1]
        "#,
        )
        .0,
    );
    assert!(warnings.is_empty());

    let mut host = MockHost::new();
    host.node_available = false;
    let mut store = TaintStore::new();
    store.mark_value(
        &sym(1),
        crate::state::TaintOrigin::root(SourceSpan::default(), "Taint originated here"),
    );

    // The sink check finds the tainted argument but cannot place a report,
    // so the visit falls through to the custom propagation rule.
    let site = call("system", vec![val_arg(1)]).with_result(sym(2));
    let store = run_call(&checker, &mut host, &site, &store);
    assert!(host.reports.is_empty());
    assert!(store.is_value_tainted(&sym(2)));
}

#[test]
fn config_rules_feed_the_whole_pipeline() {
    let (config, parse_warnings) = TaintConfig::from_toml(
        r#"
        [[Propagations]]
        Name = "read_input"
        DstArgs = [-1]

        [[Sinks]]
        Name = "run_query"
        Args = [0]
    "#,
    );
    assert!(parse_warnings.is_empty());

    let (checker, warnings) = TaintChecker::with_config(config);
    assert!(warnings.is_empty());

    let mut host = MockHost::new();
    let store = TaintStore::new();

    let source = call("read_input", vec![]).with_result(sym(1));
    let store = run_call(&checker, &mut host, &source, &store);
    assert!(store.is_value_tainted(&sym(1)));

    let sink = call("run_query", vec![val_arg(1)]);
    assert!(checker.pre_call(&mut host, &sink, &store).is_none());
    assert_eq!(host.reports.len(), 1);
    assert_eq!(host.reports[0].kind, BugKind::CustomSink);
}

#[test]
fn checker_loads_its_config_from_a_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taint.toml");
    std::fs::write(
        &path,
        r#"
        [[Propagations]]
        Name = "fetch_blob"
        DstArgs = [0]
    "#,
    )
    .unwrap();

    let checker = TaintChecker::from_config_path(&path).unwrap();
    assert!(checker.catalog().custom_propagation("fetch_blob").is_some());

    // A missing file is not an error.
    let empty = TaintChecker::from_config_path(&dir.path().join("absent.toml")).unwrap();
    assert!(empty.catalog().custom_propagation("fetch_blob").is_none());
}
