//! Taint propagation engine for path-sensitive analysis hosts.
//!
//! The engine rides along a symbolic executor. At every call expression the
//! host hands it the call's shape plus the path's [`state::TaintStore`] and
//! gets back the successor store and any diagnostics. Untrusted data enters
//! at known sources (`getenv`, `read`, `scanf`, ...), spreads through
//! propagation rules, and is reported when it reaches a format-string,
//! system-call, buffer-size or user-defined sink.
//!
//! The host side of the contract is [`host::HostContext`] plus the call
//! model in [`host`]; everything else is driven through
//! [`checker::TaintChecker`].

pub mod checker;
pub mod config;
pub mod errors;
pub mod host;
pub mod report;
pub mod rules;
pub mod state;

mod builtins;
mod checks;
mod propagate;
mod resolve;

pub use checker::TaintChecker;
pub use config::{ConfigWarning, TaintConfig};
pub use errors::{ErebusError, ErebusResult};
pub use host::{
    ArgType, CallArg, CallSite, CalleeDecl, DiagNode, HostContext, MemFnKind, RegionId,
    SourceSpan, SymValue, SymbolId,
};
pub use report::{origin_trace, BugKind, Report, TraceStep, BUG_CATEGORY, BUG_NAME};
pub use rules::{
    PropagationRule, RuleCatalog, VariadicKind, INVALID_ARG_INDEX, RETURN_VALUE_INDEX,
};
pub use state::{TaintOrigin, TaintStore};
