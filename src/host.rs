//! Types and the trait through which the engine talks to the symbolic
//! executor driving it. The host owns program states, values and regions;
//! the engine only ever sees them through the handles defined here.

use crate::report::Report;

/// Identity of a symbolic value on one execution path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(pub u64);

/// Identity of a memory region on one execution path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(pub u64);

/// Byte range of an expression in the analyzed source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SourceSpan {
    pub start: usize,
    pub end: usize,
}

impl SourceSpan {
    pub fn new(start: usize, end: usize) -> Self {
        SourceSpan { start, end }
    }
}

/// Opaque handle to a diagnostic node the host materialized for the current
/// program point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagNode(pub u64);

/// A symbolic value as observed through the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymValue {
    /// Concrete compile-time value; never tainted.
    Constant(i128),
    /// Plain symbolic data value.
    Symbol(SymbolId),
    /// Location value: a pointer designating `RegionId`.
    Region(RegionId),
    /// A value read out of memory; keeps the region it came from so region
    /// taint stays visible through loads.
    Derived { symbol: SymbolId, parent: RegionId },
    /// Unknown or undefined; conservatively never tainted.
    Unknown,
}

impl SymValue {
    pub fn is_constant(&self) -> bool {
        matches!(self, SymValue::Constant(_))
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, SymValue::Unknown)
    }

    /// The region this value designates, for pointer values.
    pub fn as_region(&self) -> Option<RegionId> {
        match self {
            SymValue::Region(r) => Some(*r),
            _ => None,
        }
    }
}

/// Static type shape of a call argument, as seen by the host's AST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    /// Plain non-pointer value.
    Value,
    Pointer { pointee_const: bool },
    Reference { const_qualified: bool },
}

impl ArgType {
    pub fn is_pointer(&self) -> bool {
        matches!(self, ArgType::Pointer { .. })
    }

    /// Whether the callee could write through this argument.
    pub fn is_mutable_target(&self) -> bool {
        match *self {
            ArgType::Pointer { pointee_const } => !pointee_const,
            ArgType::Reference { const_qualified } => !const_qualified,
            ArgType::Value => false,
        }
    }
}

/// One argument at a call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallArg {
    /// The argument expression's value at this visit.
    pub value: SymValue,
    pub ty: ArgType,
    pub span: SourceSpan,
    /// Source spelling of the argument (macro name or literal text), when
    /// the host can recover it. Consulted by spelling-sensitive predicates.
    pub spelling: Option<String>,
}

impl CallArg {
    pub fn new(value: SymValue, ty: ArgType, span: SourceSpan) -> Self {
        CallArg {
            value,
            ty,
            span,
            spelling: None,
        }
    }

    pub fn with_spelling(mut self, spelling: impl Into<String>) -> Self {
        self.spelling = Some(spelling.into());
        self
    }
}

/// Structural classification of memory/string builtins. Keyed on the host's
/// builtin recognition rather than the spelled name, so platform aliases
/// (`__builtin_memcpy`, fortified variants) resolve to the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemFnKind {
    Memcpy,
    Memmove,
    Strncpy,
    Strncat,
    Strlcpy,
    Strlcat,
    Strndup,
}

/// What the host knows about the callee's declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalleeDecl {
    /// Spelled name; empty means the host could not name the callee.
    pub name: String,
    /// The declaration looks like a C library function (external linkage,
    /// file scope); gates signature-based rules.
    pub is_c_library: bool,
    /// Zero-based index of a printf-style format argument, from the
    /// declaration's format annotation.
    pub format_arg: Option<u32>,
    pub memfn: Option<MemFnKind>,
}

impl CalleeDecl {
    pub fn named(name: impl Into<String>) -> Self {
        CalleeDecl {
            name: name.into(),
            is_c_library: false,
            format_arg: None,
            memfn: None,
        }
    }

    pub fn c_library(name: impl Into<String>) -> Self {
        CalleeDecl {
            is_c_library: true,
            ..CalleeDecl::named(name)
        }
    }

    pub fn with_format_arg(mut self, index: u32) -> Self {
        self.format_arg = Some(index);
        self
    }

    pub fn with_memfn(mut self, kind: MemFnKind) -> Self {
        self.memfn = Some(kind);
        self
    }
}

/// A call expression, as handed over by the host on each visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    /// `None` for indirect calls the host could not resolve.
    pub callee: Option<CalleeDecl>,
    pub args: Vec<CallArg>,
    pub span: SourceSpan,
    /// The call's result value; only available on the post-visit.
    pub result: Option<SymValue>,
}

impl CallSite {
    pub fn new(callee: Option<CalleeDecl>, args: Vec<CallArg>, span: SourceSpan) -> Self {
        CallSite {
            callee,
            args,
            span,
            result: None,
        }
    }

    pub fn with_result(mut self, value: SymValue) -> Self {
        self.result = Some(value);
        self
    }

    pub fn callee_name(&self) -> Option<&str> {
        self.callee.as_ref().map(|d| d.name.as_str())
    }

    pub fn arg(&self, index: u32) -> Option<&CallArg> {
        self.args.get(index as usize)
    }

    pub fn arg_count(&self) -> u32 {
        self.args.len() as u32
    }
}

/// Capabilities the engine needs from the host.
///
/// Reads are cheap queries against the current program point;
/// `diagnostic_node`/`report` talk to the host's bug reporter.
pub trait HostContext {
    /// Value currently bound in `region` at this program point.
    fn read_region(&self, region: RegionId) -> SymValue;

    /// Whether `value` designates the process's standard input stream.
    fn is_stdin(&self, value: &SymValue) -> bool;

    /// Materialize a diagnostic node for the current program point. `None`
    /// when the host cannot place a report here (e.g. the path was already
    /// pruned as infeasible).
    fn diagnostic_node(&mut self) -> Option<DiagNode>;

    /// Hand a finished report to the host's bug reporter.
    fn report(&mut self, report: Report);
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::HashMap;

    use super::{
        ArgType, CallArg, CallSite, CalleeDecl, DiagNode, HostContext, RegionId, SourceSpan,
        SymValue, SymbolId,
    };
    use crate::report::Report;

    /// Minimal host: a region→value table, an optional stdin handle, and a
    /// report log.
    pub struct MockHost {
        pub regions: HashMap<RegionId, SymValue>,
        pub stdin_value: Option<SymValue>,
        pub node_available: bool,
        pub reports: Vec<Report>,
        next_node: u64,
    }

    impl MockHost {
        pub fn new() -> Self {
            MockHost {
                regions: HashMap::new(),
                stdin_value: None,
                node_available: true,
                reports: Vec::new(),
                next_node: 0,
            }
        }

        pub fn bind(&mut self, region: RegionId, value: SymValue) {
            self.regions.insert(region, value);
        }
    }

    impl HostContext for MockHost {
        fn read_region(&self, region: RegionId) -> SymValue {
            self.regions
                .get(&region)
                .copied()
                .unwrap_or(SymValue::Unknown)
        }

        fn is_stdin(&self, value: &SymValue) -> bool {
            self.stdin_value.as_ref() == Some(value)
        }

        fn diagnostic_node(&mut self) -> Option<DiagNode> {
            if !self.node_available {
                return None;
            }
            self.next_node += 1;
            Some(DiagNode(self.next_node))
        }

        fn report(&mut self, report: Report) {
            self.reports.push(report);
        }
    }

    pub fn sym(id: u64) -> SymValue {
        SymValue::Symbol(SymbolId(id))
    }

    pub fn ptr_to(region: u64) -> SymValue {
        SymValue::Region(RegionId(region))
    }

    /// Plain symbolic argument.
    pub fn val_arg(id: u64) -> CallArg {
        CallArg::new(sym(id), ArgType::Value, SourceSpan::default())
    }

    /// Mutable `char*`-style argument pointing at `region`.
    pub fn buf_arg(region: u64) -> CallArg {
        CallArg::new(
            ptr_to(region),
            ArgType::Pointer {
                pointee_const: false,
            },
            SourceSpan::default(),
        )
    }

    /// Const pointer argument (a string literal, say).
    pub fn const_buf_arg(region: u64) -> CallArg {
        CallArg::new(
            ptr_to(region),
            ArgType::Pointer {
                pointee_const: true,
            },
            SourceSpan::default(),
        )
    }

    pub fn const_arg(v: i128) -> CallArg {
        CallArg::new(SymValue::Constant(v), ArgType::Value, SourceSpan::default())
    }

    pub fn call(name: &str, args: Vec<CallArg>) -> CallSite {
        CallSite::new(Some(CalleeDecl::named(name)), args, SourceSpan::default())
    }

    pub fn c_lib_call(name: &str, args: Vec<CallArg>) -> CallSite {
        CallSite::new(
            Some(CalleeDecl::c_library(name)),
            args,
            SourceSpan::default(),
        )
    }
}

#[test]
fn out_of_range_arg_is_none() {
    let call = CallSite::new(Some(CalleeDecl::named("f")), vec![], SourceSpan::default());
    assert!(call.arg(0).is_none());
    assert!(call.arg(u32::MAX).is_none());
    assert_eq!(call.arg_count(), 0);
}

#[test]
fn mutable_target_shapes() {
    assert!(
        ArgType::Pointer {
            pointee_const: false
        }
        .is_mutable_target()
    );
    assert!(
        !ArgType::Pointer {
            pointee_const: true
        }
        .is_mutable_target()
    );
    assert!(
        ArgType::Reference {
            const_qualified: false
        }
        .is_mutable_target()
    );
    assert!(!ArgType::Value.is_mutable_target());
}
