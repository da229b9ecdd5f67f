//! User-supplied rule configuration: a TOML document with three optional
//! array-of-tables sections (`Propagations`, `Filters`, `Sinks`). Content
//! problems are warnings, never hard errors; a broken entry must not take
//! the valid ones down with it.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::ErebusResult;
use crate::rules::{
    ArgVec, INVALID_ARG_INDEX, PropagationRule, RETURN_VALUE_INDEX, RuleCatalog, VariadicKind,
};

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct TaintConfig {
    #[serde(rename = "Propagations")]
    pub propagations: Vec<Propagation>,

    #[serde(rename = "Filters")]
    pub filters: Vec<NameArgs>,

    #[serde(rename = "Sinks")]
    pub sinks: Vec<NameArgs>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Propagation {
    #[serde(rename = "Name")]
    pub name: String,

    /// Source argument positions; empty means the rule fires unconditionally.
    #[serde(rename = "SrcArgs", default)]
    pub src_args: Vec<u32>,

    /// Destination positions; `-1` selects the return value.
    #[serde(rename = "DstArgs", default)]
    pub dst_args: Vec<i64>,

    #[serde(rename = "VariadicType", default)]
    pub variadic_type: VariadicKind,

    #[serde(rename = "VariadicIndex", default = "invalid_index")]
    pub variadic_index: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NameArgs {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Args", default)]
    pub args: Vec<u32>,
}

fn invalid_index() -> u32 {
    INVALID_ARG_INDEX
}

/// Non-fatal problem found while loading configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The whole document was rejected; only builtins stay active.
    Malformed(String),
    /// A propagation entry used an argument index below `-1`; the rule is
    /// registered but disabled.
    InvalidArgIndex { name: String, index: i64 },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::Malformed(err) => write!(f, "invalid taint configuration: {err}"),
            ConfigWarning::InvalidArgIndex { name, index } => write!(
                f,
                "rule `{name}`: expected an argument number greater or equal to -1, got {index}; rule disabled"
            ),
        }
    }
}

impl TaintConfig {
    /// Parse a TOML document. A malformed document yields an empty config
    /// plus one warning so the caller keeps running on builtins.
    pub fn from_toml(text: &str) -> (Self, Vec<ConfigWarning>) {
        match toml::from_str(text) {
            Ok(config) => (config, Vec::new()),
            Err(err) => {
                warn!(target: "taint", "config rejected: {err}");
                (
                    TaintConfig::default(),
                    vec![ConfigWarning::Malformed(err.to_string())],
                )
            }
        }
    }

    /// Read a config file. A missing file is an empty config, not an error;
    /// an existing but unreadable one surfaces as I/O failure.
    pub fn load(path: &Path) -> ErebusResult<(Self, Vec<ConfigWarning>)> {
        if !path.exists() {
            return Ok((TaintConfig::default(), Vec::new()));
        }
        let text = fs::read_to_string(path)?;
        Ok(Self::from_toml(&text))
    }

    /// Move the entries into `catalog`. Later entries for the same name
    /// replace earlier ones. Returns the warnings for entries that had to be
    /// disabled.
    pub fn apply(self, catalog: &mut RuleCatalog) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        for prop in self.propagations {
            let rule = match convert_dst_args(&prop) {
                Ok(dst_args) => PropagationRule {
                    src_args: ArgVec::from_slice(&prop.src_args),
                    dst_args,
                    variadic: prop.variadic_type,
                    variadic_start: prop.variadic_index,
                    predicate: None,
                },
                Err(warning) => {
                    warn!(target: "taint", "{warning}");
                    warnings.push(warning);
                    // Keep the name registered so overwrite semantics stay
                    // observable, but leave the rule unable to fire.
                    PropagationRule::new(&[], &[INVALID_ARG_INDEX])
                }
            };
            catalog.add_propagation(prop.name, rule);
        }

        for filter in self.filters {
            catalog.add_filter(filter.name, ArgVec::from_slice(&filter.args));
        }

        for sink in self.sinks {
            catalog.add_sink(sink.name, ArgVec::from_slice(&sink.args));
        }

        warnings
    }
}

fn convert_dst_args(prop: &Propagation) -> Result<ArgVec, ConfigWarning> {
    let mut out = ArgVec::new();
    for &raw in &prop.dst_args {
        if raw == -1 {
            out.push(RETURN_VALUE_INDEX);
        } else if raw < -1 {
            return Err(ConfigWarning::InvalidArgIndex {
                name: prop.name.clone(),
                index: raw,
            });
        } else {
            out.push(u32::try_from(raw).unwrap_or(INVALID_ARG_INDEX));
        }
    }
    Ok(out)
}

#[test]
fn minus_one_maps_to_return_value() {
    let (config, warnings) = TaintConfig::from_toml(
        r#"
        [[Propagations]]
        Name = "mySource"
        DstArgs = [-1]
    "#,
    );
    assert!(warnings.is_empty());

    let mut catalog = RuleCatalog::new();
    assert!(config.apply(&mut catalog).is_empty());

    let rule = catalog.custom_propagation("mySource").unwrap();
    assert_eq!(rule.dst_args.as_slice(), &[RETURN_VALUE_INDEX]);
}

#[test]
fn index_below_minus_one_warns_and_disables() {
    let (config, _) = TaintConfig::from_toml(
        r#"
        [[Propagations]]
        Name = "broken"
        DstArgs = [-2, 0]

        [[Propagations]]
        Name = "fine"
        SrcArgs = [0]
        DstArgs = [1]
    "#,
    );

    let mut catalog = RuleCatalog::new();
    let warnings = config.apply(&mut catalog);
    assert_eq!(warnings.len(), 1);
    assert!(matches!(
        &warnings[0],
        ConfigWarning::InvalidArgIndex { name, index: -2 } if name == "broken"
    ));

    // The broken entry stays registered but can never produce taint.
    let broken = catalog.custom_propagation("broken").unwrap();
    assert!(broken.src_args.is_empty());
    assert_eq!(broken.dst_args.as_slice(), &[INVALID_ARG_INDEX]);

    // The valid sibling still loaded.
    let fine = catalog.custom_propagation("fine").unwrap();
    assert_eq!(fine.dst_args.as_slice(), &[1]);
}

#[test]
fn malformed_document_is_one_warning() {
    let (config, warnings) = TaintConfig::from_toml("Propagations = 3");
    assert_eq!(config, TaintConfig::default());
    assert_eq!(warnings.len(), 1);
    assert!(matches!(warnings[0], ConfigWarning::Malformed(_)));
}

#[test]
fn empty_document_is_fine() {
    let (config, warnings) = TaintConfig::from_toml("");
    assert_eq!(config, TaintConfig::default());
    assert!(warnings.is_empty());
}

#[test]
fn missing_file_is_empty_config() {
    let dir = tempfile::tempdir().unwrap();
    let (config, warnings) = TaintConfig::load(&dir.path().join("no-such.toml")).unwrap();
    assert_eq!(config, TaintConfig::default());
    assert!(warnings.is_empty());
}

#[test]
fn loads_all_three_sections_from_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taint.toml");
    fs::write(
        &path,
        r#"
        [[Propagations]]
        Name = "recv_data"
        SrcArgs = [0]
        DstArgs = [1, -1]
        VariadicType = "Dst"
        VariadicIndex = 2

        [[Filters]]
        Name = "sanitize_len"
        Args = [0]

        [[Sinks]]
        Name = "run_query"
        Args = [0, 1]
    "#,
    )
    .unwrap();

    let (config, warnings) = TaintConfig::load(&path).unwrap();
    assert!(warnings.is_empty());

    let mut catalog = RuleCatalog::new();
    config.apply(&mut catalog);

    let rule = catalog.custom_propagation("recv_data").unwrap();
    assert_eq!(rule.src_args.as_slice(), &[0]);
    assert_eq!(rule.dst_args.as_slice(), &[1, RETURN_VALUE_INDEX]);
    assert_eq!(rule.variadic, VariadicKind::Dest);
    assert_eq!(rule.variadic_start, 2);

    assert_eq!(catalog.filter_args("sanitize_len"), Some(&[0][..]));
    assert_eq!(catalog.sink_args("run_query"), Some(&[0, 1][..]));
}

#[test]
fn later_entry_for_a_name_wins() {
    let (config, warnings) = TaintConfig::from_toml(
        r#"
        [[Propagations]]
        Name = "twice"
        DstArgs = [0]

        [[Propagations]]
        Name = "twice"
        DstArgs = [-1]
    "#,
    );
    assert!(warnings.is_empty());

    let mut catalog = RuleCatalog::new();
    config.apply(&mut catalog);

    let rule = catalog.custom_propagation("twice").unwrap();
    assert_eq!(rule.dst_args.as_slice(), &[RETURN_VALUE_INDEX]);
}

#[test]
fn negative_source_arg_rejects_the_document() {
    let (config, warnings) = TaintConfig::from_toml(
        r#"
        [[Propagations]]
        Name = "bad"
        SrcArgs = [-1]
    "#,
    );
    assert_eq!(config, TaintConfig::default());
    assert_eq!(warnings.len(), 1);
    assert!(matches!(warnings[0], ConfigWarning::Malformed(_)));
}
