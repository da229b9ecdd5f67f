//! Built-in taint knowledge: the exact-name propagation table, rules for
//! the memory/string-copy family, C-library signatures, and the fixed sink
//! tables. All static; the catalog consults these before any configuration.

use phf::{Map, phf_map};

use crate::host::{CallSite, CalleeDecl, HostContext, MemFnKind};
use crate::rules::{
    ArgVec, INVALID_ARG_INDEX, PropagationRule, RETURN_VALUE_INDEX, RulePredicate, VariadicKind,
};
use crate::state::TaintStore;

const RET: u32 = RETURN_VALUE_INDEX;

/// Const-constructible rule shape for the static tables; converted to a
/// [`PropagationRule`] on lookup.
#[derive(Debug, Clone, Copy)]
struct RuleSpec {
    src: &'static [u32],
    dst: &'static [u32],
    variadic: VariadicKind,
    variadic_start: u32,
    predicate: Option<RulePredicate>,
}

impl RuleSpec {
    const fn fixed(src: &'static [u32], dst: &'static [u32]) -> Self {
        RuleSpec {
            src,
            dst,
            variadic: VariadicKind::None,
            variadic_start: INVALID_ARG_INDEX,
            predicate: None,
        }
    }

    const fn variadic(
        src: &'static [u32],
        dst: &'static [u32],
        variadic: VariadicKind,
        variadic_start: u32,
    ) -> Self {
        RuleSpec {
            src,
            dst,
            variadic,
            variadic_start,
            predicate: None,
        }
    }

    fn rule(&self) -> PropagationRule {
        PropagationRule {
            src_args: ArgVec::from_slice(self.src),
            dst_args: ArgVec::from_slice(self.dst),
            variadic: self.variadic,
            variadic_start: self.variadic_start,
            predicate: self.predicate,
        }
    }
}

static EXACT: Map<&'static str, RuleSpec> = phf_map! {
    // ─────────── sources ───────────
    "fdopen"           => RuleSpec::fixed(&[], &[RET]),
    "fopen"            => RuleSpec::fixed(&[], &[RET]),
    "freopen"          => RuleSpec::fixed(&[], &[RET]),
    "getch"            => RuleSpec::fixed(&[], &[RET]),
    "getchar"          => RuleSpec::fixed(&[], &[RET]),
    "getchar_unlocked" => RuleSpec::fixed(&[], &[RET]),
    "getenv"           => RuleSpec::fixed(&[], &[RET]),
    "gets"             => RuleSpec::fixed(&[], &[0, RET]),
    "scanf"            => RuleSpec::variadic(&[], &[], VariadicKind::Dest, 1),
    "socket"           => RuleSpec {
        src: &[],
        dst: &[RET],
        variadic: VariadicKind::None,
        variadic_start: INVALID_ARG_INDEX,
        predicate: Some(post_socket),
    },
    "wgetch"           => RuleSpec::fixed(&[], &[RET]),

    // ─────────── propagators ───────────
    "atoi"          => RuleSpec::fixed(&[0], &[RET]),
    "atol"          => RuleSpec::fixed(&[0], &[RET]),
    "atoll"         => RuleSpec::fixed(&[0], &[RET]),
    "fgetc"         => RuleSpec::fixed(&[0], &[RET]),
    "fgetln"        => RuleSpec::fixed(&[0], &[RET]),
    "fgets"         => RuleSpec::fixed(&[2], &[0, RET]),
    "fscanf"        => RuleSpec::variadic(&[0], &[], VariadicKind::Dest, 2),
    "getc"          => RuleSpec::fixed(&[0], &[RET]),
    "getc_unlocked" => RuleSpec::fixed(&[0], &[RET]),
    "getdelim"      => RuleSpec::fixed(&[3], &[0]),
    "getline"       => RuleSpec::fixed(&[2], &[0]),
    "getw"          => RuleSpec::fixed(&[0], &[RET]),
    "pread"         => RuleSpec::fixed(&[0, 1, 2, 3], &[1, RET]),
    "read"          => RuleSpec::fixed(&[0, 2], &[1, RET]),
    "strchr"        => RuleSpec::fixed(&[0], &[RET]),
    "strrchr"       => RuleSpec::fixed(&[0], &[RET]),
    "tolower"       => RuleSpec::fixed(&[0], &[RET]),
    "toupper"       => RuleSpec::fixed(&[0], &[RET]),
};

/// Process-spawning / dynamic-loading functions and the argument carrying
/// the command or path.
static SYSTEM_CALL_SINKS: Map<&'static str, u32> = phf_map! {
    "system" => 0,
    "popen"  => 0,
    "execl"  => 0,
    "execle" => 0,
    "execlp" => 0,
    "execv"  => 0,
    "execvp" => 0,
    "execvP" => 0,
    "execve" => 0,
    "dlopen" => 0,
};

/// Exact-name lookup in the builtin propagation table.
pub(crate) fn builtin_rule(name: &str) -> Option<PropagationRule> {
    EXACT.get(name).map(RuleSpec::rule)
}

/// Rules for the memory/string-copy family, keyed on the host's structural
/// classification so fortified and `__builtin_` aliases land here too.
pub(crate) fn memory_rule(kind: MemFnKind) -> PropagationRule {
    match kind {
        MemFnKind::Memcpy | MemFnKind::Memmove | MemFnKind::Strncpy | MemFnKind::Strncat => {
            PropagationRule::new(&[1, 2], &[0, RET])
        }
        // No return-value taint: these return a length, not the buffer.
        MemFnKind::Strlcpy | MemFnKind::Strlcat => PropagationRule::new(&[1, 2], &[0]),
        MemFnKind::Strndup => PropagationRule::new(&[0, 1], &[RET]),
    }
}

/// Signature-recognized C library functions. `memccpy` is deliberately
/// absent: copy-until-delimiter is often used for cleansing.
pub(crate) fn c_library_rule(name: &str) -> Option<PropagationRule> {
    let rule = match name {
        "snprintf" => PropagationRule::variadic(&[1], &[0, RET], VariadicKind::Source, 3),
        "sprintf" => PropagationRule::variadic(&[], &[0, RET], VariadicKind::Source, 2),
        "strcpy" | "stpcpy" | "strcat" => PropagationRule::new(&[1], &[0, RET]),
        "bcopy" => PropagationRule::new(&[0, 2], &[1]),
        "strdup" | "strdupa" | "wcsdup" => PropagationRule::new(&[0], &[RET]),
        _ => return None,
    };
    Some(rule)
}

/// Command/path argument position for the fixed system-call sink list.
pub(crate) fn system_call_arg(name: &str) -> Option<u32> {
    SYSTEM_CALL_SINKS.get(name).copied()
}

/// Size argument position for allocators and bounded copies.
pub(crate) fn buffer_size_arg(decl: &CalleeDecl) -> Option<u32> {
    if let Some(kind) = decl.memfn {
        match kind {
            MemFnKind::Memcpy | MemFnKind::Memmove | MemFnKind::Strncpy => return Some(2),
            MemFnKind::Strndup => return Some(1),
            _ => {}
        }
    }

    if decl.is_c_library {
        let arg = match decl.name.as_str() {
            "malloc" | "calloc" | "alloca" => 0,
            "memccpy" => 3,
            "realloc" => 1,
            "bcopy" => 2,
            _ => return None,
        };
        return Some(arg);
    }

    None
}

/// `socket` taints its descriptor only when the protocol domain is remote-
/// capable. Local/IPC families cannot carry attacker input, so they are
/// whitelisted by the spelling of the first argument.
fn post_socket(
    _verdict: bool,
    call: &CallSite,
    _ctx: &dyn HostContext,
    _store: &TaintStore,
) -> bool {
    let domain = call
        .arg(0)
        .and_then(|arg| arg.spelling.as_deref())
        .unwrap_or("");
    !matches!(domain, "AF_SYSTEM" | "AF_LOCAL" | "AF_UNIX" | "AF_RESERVED_36")
}

#[cfg(test)]
use crate::host::mock::{MockHost, const_arg};

#[test]
fn exact_table_spot_checks() {
    let getenv = builtin_rule("getenv").unwrap();
    assert!(getenv.src_args.is_empty());
    assert_eq!(getenv.dst_args.as_slice(), &[RET]);

    let gets = builtin_rule("gets").unwrap();
    assert_eq!(gets.dst_args.as_slice(), &[0, RET]);

    let scanf = builtin_rule("scanf").unwrap();
    assert_eq!(scanf.variadic, VariadicKind::Dest);
    assert_eq!(scanf.variadic_start, 1);

    let pread = builtin_rule("pread").unwrap();
    assert_eq!(pread.src_args.as_slice(), &[0, 1, 2, 3]);
    assert_eq!(pread.dst_args.as_slice(), &[1, RET]);

    assert!(builtin_rule("printf").is_none());
}

#[test]
fn socket_domain_whitelist() {
    let host = MockHost::new();
    let store = TaintStore::new();
    let rule = builtin_rule("socket").unwrap();
    let predicate = rule.predicate.unwrap();

    let mut unix_call = crate::host::mock::call("socket", vec![const_arg(1), const_arg(1), const_arg(0)]);
    unix_call.args[0] = unix_call.args[0].clone().with_spelling("AF_UNIX");
    assert!(!predicate(true, &unix_call, &host, &store));

    let mut inet_call = crate::host::mock::call("socket", vec![const_arg(2), const_arg(1), const_arg(0)]);
    inet_call.args[0] = inet_call.args[0].clone().with_spelling("AF_INET");
    assert!(predicate(true, &inet_call, &host, &store));

    // No spelling available: assume remote-capable.
    let bare_call = crate::host::mock::call("socket", vec![const_arg(2)]);
    assert!(predicate(true, &bare_call, &host, &store));
}

#[test]
fn memory_family_rules() {
    let memcpy = memory_rule(MemFnKind::Memcpy);
    assert_eq!(memcpy.src_args.as_slice(), &[1, 2]);
    assert_eq!(memcpy.dst_args.as_slice(), &[0, RET]);

    let strlcpy = memory_rule(MemFnKind::Strlcpy);
    assert_eq!(strlcpy.dst_args.as_slice(), &[0]);

    let strndup = memory_rule(MemFnKind::Strndup);
    assert_eq!(strndup.src_args.as_slice(), &[0, 1]);
    assert_eq!(strndup.dst_args.as_slice(), &[RET]);
}

#[test]
fn c_library_signatures() {
    let snprintf = c_library_rule("snprintf").unwrap();
    assert_eq!(snprintf.src_args.as_slice(), &[1]);
    assert_eq!(snprintf.variadic, VariadicKind::Source);
    assert_eq!(snprintf.variadic_start, 3);

    let sprintf = c_library_rule("sprintf").unwrap();
    assert!(sprintf.src_args.is_empty());
    assert_eq!(sprintf.variadic_start, 2);

    assert!(c_library_rule("memccpy").is_none());
}

#[test]
fn sink_tables() {
    assert_eq!(system_call_arg("system"), Some(0));
    assert_eq!(system_call_arg("dlopen"), Some(0));
    assert_eq!(system_call_arg("printf"), None);

    let memcpy = CalleeDecl::named("memcpy").with_memfn(MemFnKind::Memcpy);
    assert_eq!(buffer_size_arg(&memcpy), Some(2));

    // strncat propagates but its size argument is not treated as a sink.
    let strncat = CalleeDecl::named("strncat").with_memfn(MemFnKind::Strncat);
    assert_eq!(buffer_size_arg(&strncat), None);

    assert_eq!(buffer_size_arg(&CalleeDecl::c_library("malloc")), Some(0));
    assert_eq!(buffer_size_arg(&CalleeDecl::c_library("memccpy")), Some(3));
    // Without the library gate the name alone is not enough.
    assert_eq!(buffer_size_arg(&CalleeDecl::named("malloc")), None);
}
