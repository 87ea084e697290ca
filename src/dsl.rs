//! Parse a field grammar into symbols using PEST.
//!
//! ```text
//! symbol "Ping" {
//!     kind: uint8(1);
//!     len: size(payload, type = uint16());
//!     payload: raw(0..=32);
//!     crc: crc32(kind, len, payload);
//! }
//! ```
//!
//! Ranges follow Rust: `a..b` excludes `b`, `a..=b` includes it. Fields may
//! reference fields declared later in the same symbol, and `Other.field`
//! reaches a field of another symbol through session memory.

use crate::bits::BitString;
use crate::domain::{HashAlgorithm, RelationKind, RepeatCount, Svas, VarId, Variable};
use crate::error::DomainError;
use crate::message::{Field, Symbol};
use crate::types::{Ascii, BitArray, DataType, Endianness, Integer, Ipv4, Raw, Sign, Timestamp, TypeError};
use pest::Parser;
use pest_derive::Parser as PestParser;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(PestParser)]
#[grammar = "grammar.pest"]
struct FieldGrammar;

#[derive(Debug, Error)]
pub enum DslError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("{function}: {message}")]
    BadArgument { function: String, message: String },
    #[error("unknown reference `{0}`")]
    UnknownReference(String),
    #[error("duplicate symbol `{0}`")]
    DuplicateSymbol(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl From<TypeError> for DslError {
    fn from(e: TypeError) -> Self {
        DslError::Domain(e.into())
    }
}

fn bad(function: &str, message: impl Into<String>) -> DslError {
    DslError::BadArgument { function: function.to_string(), message: message.into() }
}

/// Parse grammar source into symbols, in declaration order.
pub fn parse(source: &str) -> Result<Vec<Symbol>, DslError> {
    let pairs = FieldGrammar::parse(Rule::grammar, source).map_err(|e| DslError::Syntax(e.to_string()))?;
    let pair = pairs.into_iter().next().ok_or_else(|| DslError::Syntax("empty parse".to_string()))?;
    let decls = build_grammar(pair)?;
    let mut builder = Builder::new(&decls)?;
    let mut symbols = Vec::with_capacity(decls.len());
    for decl in &decls {
        let mut fields = Vec::with_capacity(decl.fields.len());
        for f in &decl.fields {
            let domain = builder.build_field(decl, &f.name)?;
            fields.push(Field::new(&f.name, domain));
        }
        symbols.push(Symbol::new(&decl.name, fields)?);
    }
    debug!(symbols = symbols.len(), "grammar loaded");
    Ok(symbols)
}

// ==================== Syntax tree ====================

#[derive(Debug)]
struct SymbolDecl {
    name: String,
    fields: Vec<FieldDecl>,
}

#[derive(Debug)]
struct FieldDecl {
    name: String,
    domain: Call,
}

#[derive(Debug)]
struct Call {
    name: String,
    args: Vec<Expr>,
    kwargs: Vec<(String, Expr)>,
    svas: Option<Svas>,
}

#[derive(Debug)]
enum Expr {
    Call(Call),
    Int(i128),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Text(String),
    Bits(BitString),
    Range { start: i128, end: i128, inclusive: bool },
    List(Vec<Expr>),
    Ref { symbol: Option<String>, field: String },
}

impl Expr {
    fn describe(&self) -> &'static str {
        match self {
            Expr::Call(_) => "a domain",
            Expr::Int(_) => "an integer",
            Expr::Float(_) => "a float",
            Expr::Bool(_) => "a boolean",
            Expr::Bytes(_) => "hex bytes",
            Expr::Text(_) => "a string",
            Expr::Bits(_) => "binary digits",
            Expr::Range { .. } => "a range",
            Expr::List(_) => "a list",
            Expr::Ref { .. } => "a reference",
        }
    }
}

fn build_grammar(pair: pest::iterators::Pair<Rule>) -> Result<Vec<SymbolDecl>, DslError> {
    let mut symbols = Vec::new();
    for inner in pair.into_inner() {
        if inner.as_rule() == Rule::symbol {
            symbols.push(build_symbol(inner)?);
        }
    }
    Ok(symbols)
}

fn build_symbol(pair: pest::iterators::Pair<Rule>) -> Result<SymbolDecl, DslError> {
    let mut name = None;
    let mut fields = Vec::new();
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::string => name = Some(unquote(inner.as_str())),
            Rule::field => fields.push(build_field(inner)?),
            _ => {}
        }
    }
    let name = name.ok_or_else(|| DslError::Syntax("symbol: missing name".to_string()))?;
    Ok(SymbolDecl { name, fields })
}

fn build_field(pair: pest::iterators::Pair<Rule>) -> Result<FieldDecl, DslError> {
    let mut it = pair.into_inner();
    let name = it.next().ok_or_else(|| DslError::Syntax("field: name".to_string()))?;
    let domain = it.next().ok_or_else(|| DslError::Syntax("field: domain".to_string()))?;
    Ok(FieldDecl { name: name.as_str().to_string(), domain: build_domain(domain)? })
}

fn build_domain(pair: pest::iterators::Pair<Rule>) -> Result<Call, DslError> {
    let mut call = None;
    let mut svas = None;
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::call => call = Some(build_call(inner)?),
            Rule::svas => {
                let kind = inner.into_inner().next().ok_or_else(|| DslError::Syntax("svas: kind".to_string()))?;
                svas = Some(kind.as_str().parse::<Svas>().map_err(DslError::Syntax)?);
            }
            _ => {}
        }
    }
    let mut call = call.ok_or_else(|| DslError::Syntax("domain: missing call".to_string()))?;
    call.svas = svas;
    Ok(call)
}

fn build_call(pair: pest::iterators::Pair<Rule>) -> Result<Call, DslError> {
    let mut it = pair.into_inner();
    let name = it.next().ok_or_else(|| DslError::Syntax("call: name".to_string()))?.as_str().to_string();
    let mut args = Vec::new();
    let mut kwargs = Vec::new();
    for arg in it {
        let inner = arg.into_inner().next().ok_or_else(|| DslError::Syntax("empty argument".to_string()))?;
        match inner.as_rule() {
            Rule::kwarg => {
                let mut kv = inner.into_inner();
                let key = kv.next().ok_or_else(|| DslError::Syntax("kwarg: key".to_string()))?;
                let value = kv.next().ok_or_else(|| DslError::Syntax("kwarg: value".to_string()))?;
                kwargs.push((key.as_str().to_string(), build_expr(value)?));
            }
            Rule::expr => args.push(build_expr(inner)?),
            r => return Err(DslError::Syntax(format!("unexpected argument {:?}", r))),
        }
    }
    Ok(Call { name, args, kwargs, svas: None })
}

fn build_expr(pair: pest::iterators::Pair<Rule>) -> Result<Expr, DslError> {
    let inner = pair.into_inner().next().ok_or_else(|| DslError::Syntax("empty expression".to_string()))?;
    match inner.as_rule() {
        Rule::domain => Ok(Expr::Call(build_domain(inner)?)),
        Rule::range => {
            let mut it = inner.into_inner();
            let start = it.next().ok_or_else(|| DslError::Syntax("range: start".to_string()))?;
            let op = it.next().ok_or_else(|| DslError::Syntax("range: operator".to_string()))?;
            let end = it.next().ok_or_else(|| DslError::Syntax("range: end".to_string()))?;
            Ok(Expr::Range {
                start: parse_int(start.as_str())?,
                end: parse_int(end.as_str())?,
                inclusive: op.as_rule() == Rule::range_inclusive,
            })
        }
        Rule::list => inner.into_inner().map(build_expr).collect::<Result<Vec<_>, _>>().map(Expr::List),
        Rule::literal => build_literal(inner),
        Rule::reference => {
            let mut parts = inner.into_inner().map(|p| p.as_str().to_string());
            let first = parts.next().ok_or_else(|| DslError::Syntax("reference: name".to_string()))?;
            Ok(match parts.next() {
                Some(field) => Expr::Ref { symbol: Some(first), field },
                None => Expr::Ref { symbol: None, field: first },
            })
        }
        r => Err(DslError::Syntax(format!("unexpected expression {:?}", r))),
    }
}

fn build_literal(pair: pest::iterators::Pair<Rule>) -> Result<Expr, DslError> {
    let inner = pair.into_inner().next().ok_or_else(|| DslError::Syntax("empty literal".to_string()))?;
    let s = inner.as_str();
    match inner.as_rule() {
        Rule::hex => hex::decode(&s[2..])
            .map(Expr::Bytes)
            .map_err(|e| DslError::Syntax(format!("hex literal {}: {}", s, e))),
        Rule::binary => BitString::from_binary(&s[2..])
            .map(Expr::Bits)
            .ok_or_else(|| DslError::Syntax(format!("binary literal {}", s))),
        Rule::float => s.parse().map(Expr::Float).map_err(|_| DslError::Syntax(format!("float literal {}", s))),
        Rule::integer => parse_int(s).map(Expr::Int),
        Rule::string => Ok(Expr::Text(unquote(s))),
        Rule::boolean => Ok(Expr::Bool(s == "true")),
        r => Err(DslError::Syntax(format!("unexpected literal {:?}", r))),
    }
}

fn parse_int(s: &str) -> Result<i128, DslError> {
    s.parse().map_err(|_| DslError::Syntax(format!("integer literal {}", s)))
}

fn unquote(s: &str) -> String {
    let inner = &s[1..s.len() - 1];
    inner.replace("\\n", "\n").replace("\\t", "\t").replace("\\\"", "\"")
}

// ==================== Variables ====================

/// Builds field domains. Field ids are reserved up front so relations can
/// target fields that are built later.
struct Builder<'d> {
    decls: &'d [SymbolDecl],
    ids: HashMap<(String, String), VarId>,
    built: HashMap<VarId, Variable>,
    building: HashSet<VarId>,
}

impl<'d> Builder<'d> {
    fn new(decls: &'d [SymbolDecl]) -> Result<Self, DslError> {
        let mut ids = HashMap::new();
        let mut names = HashSet::new();
        for decl in decls {
            if !names.insert(decl.name.as_str()) {
                return Err(DslError::DuplicateSymbol(decl.name.clone()));
            }
            for f in &decl.fields {
                let key = (decl.name.clone(), f.name.clone());
                if ids.insert(key, VarId::fresh()).is_some() {
                    return Err(DomainError::DuplicateField { symbol: decl.name.clone(), field: f.name.clone() }.into());
                }
            }
        }
        Ok(Builder { decls, ids, built: HashMap::new(), building: HashSet::new() })
    }

    fn reserved(&self, symbol: &str, field: &str) -> Result<VarId, DslError> {
        self.ids
            .get(&(symbol.to_string(), field.to_string()))
            .copied()
            .ok_or_else(|| DslError::UnknownReference(format!("{}.{}", symbol, field)))
    }

    fn build_field(&mut self, decl: &'d SymbolDecl, field: &str) -> Result<Variable, DslError> {
        let id = self.reserved(&decl.name, field)?;
        if let Some(v) = self.built.get(&id) {
            return Ok(v.clone());
        }
        if !self.building.insert(id) {
            return Err(bad("value", format!("`{}.{}` depends on its own value", decl.name, field)));
        }
        let Some(f) = decl.fields.iter().find(|f| f.name == field) else {
            return Err(DslError::UnknownReference(format!("{}.{}", decl.name, field)));
        };
        let var = self.build_var(decl, field, &f.domain)?.with_id(id);
        self.building.remove(&id);
        self.built.insert(id, var.clone());
        Ok(var)
    }

    fn build_var(&mut self, decl: &'d SymbolDecl, name: &str, call: &'d Call) -> Result<Variable, DslError> {
        let var = match call.name.as_str() {
            "alt" | "agg" => {
                no_kwargs(call)?;
                let mut children = Vec::with_capacity(call.args.len());
                for (i, arg) in call.args.iter().enumerate() {
                    let child = as_call(&call.name, arg)?;
                    children.push(self.build_var(decl, &format!("{}[{}]", name, i), child)?);
                }
                if call.name == "alt" {
                    Variable::alt(name, children)?
                } else {
                    Variable::agg(name, children)?
                }
            }
            "repeat" => self.build_repeat(decl, name, call)?,
            "value" => {
                no_kwargs(call)?;
                let [Expr::Ref { symbol, field }] = call.args.as_slice() else {
                    return Err(bad("value", "expected exactly one field reference"));
                };
                let target = match symbol {
                    Some(s) => {
                        let other = self.symbol(s)?;
                        self.build_field(other, field)?
                    }
                    None => self.build_field(decl, field)?,
                };
                Variable::value(name, &target)?
            }
            "size" | "internet_checksum" | "crc32" | "hmac" | "padding" => self.build_relation(decl, name, call)?,
            _ => Variable::data_arc(name, leaf_type(call)?),
        };
        Ok(match call.svas {
            Some(svas) => var.with_svas(svas),
            None => var,
        })
    }

    fn symbol(&self, name: &str) -> Result<&'d SymbolDecl, DslError> {
        self.decls
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| DslError::UnknownReference(name.to_string()))
    }

    fn build_repeat(&mut self, decl: &'d SymbolDecl, name: &str, call: &'d Call) -> Result<Variable, DslError> {
        check_kwargs(call, &["delimiter"])?;
        let [child, count] = call.args.as_slice() else {
            return Err(bad("repeat", "expected a domain and a count"));
        };
        let child = self.build_var(decl, &format!("{}[]", name), as_call("repeat", child)?)?;
        let count = match count {
            Expr::Int(n) => RepeatCount::exactly(to_usize("repeat", *n)?),
            Expr::Range { start, end, inclusive } => {
                let end = if *inclusive { end + 1 } else { *end };
                RepeatCount::new(to_usize("repeat", *start)?, to_usize("repeat", end)?)
            }
            other => return Err(bad("repeat", format!("count must be an integer or a range, found {}", other.describe()))),
        };
        let delimiter = kwarg(call, "delimiter").map(|e| bits_of("repeat", e)).transpose()?;
        Ok(Variable::repeat(name, child, count, delimiter)?)
    }

    fn build_relation(&mut self, decl: &'d SymbolDecl, name: &str, call: &Call) -> Result<Variable, DslError> {
        let function = call.name.as_str();
        let mut targets = Vec::new();
        for arg in &call.args {
            self.collect_targets(decl, function, arg, &mut targets)?;
        }
        let (kind, data_type): (RelationKind, Arc<dyn DataType>) = match function {
            "size" => {
                check_kwargs(call, &["type", "factor", "offset"])?;
                let data_type = match kwarg(call, "type") {
                    Some(e) => leaf_type(as_call(function, e)?)?,
                    None => Arc::new(Integer::uint8()),
                };
                let factor = float_kwarg(call, "factor", 1.0 / 8.0)?;
                let offset = int_kwarg(call, "offset", 0)?;
                (RelationKind::Size { factor, offset }, data_type)
            }
            "internet_checksum" => {
                no_kwargs(call)?;
                (RelationKind::InternetChecksum, Arc::new(Integer::uint16()))
            }
            "crc32" => {
                no_kwargs(call)?;
                (RelationKind::Crc32, Arc::new(Integer::uint32()))
            }
            "hmac" => {
                check_kwargs(call, &["algorithm", "key"])?;
                let algorithm = match kwarg(call, "algorithm") {
                    Some(Expr::Text(s)) => s.parse::<HashAlgorithm>()?,
                    Some(other) => return Err(bad(function, format!("algorithm must be a string, found {}", other.describe()))),
                    None => HashAlgorithm::Sha256,
                };
                let key = match kwarg(call, "key") {
                    Some(e) => bytes_of(function, e)?,
                    None => return Err(bad(function, "missing `key`")),
                };
                (RelationKind::Hmac { algorithm, key }, Arc::new(Raw::exact(algorithm.digest_len())))
            }
            "padding" => {
                check_kwargs(call, &["modulo", "pad", "once", "factor", "offset"])?;
                let modulo = match kwarg(call, "modulo") {
                    Some(Expr::Int(n)) => to_usize(function, *n)?,
                    Some(other) => return Err(bad(function, format!("modulo must be an integer, found {}", other.describe()))),
                    None => return Err(bad(function, "missing `modulo`")),
                };
                let pad: Arc<dyn DataType> = match kwarg(call, "pad") {
                    Some(e) => leaf_type(as_call(function, e)?)?,
                    None => Arc::new(Raw::fixed(vec![0u8])),
                };
                let once = match kwarg(call, "once") {
                    Some(Expr::Bool(b)) => *b,
                    Some(other) => return Err(bad(function, format!("once must be a boolean, found {}", other.describe()))),
                    None => false,
                };
                let factor = float_kwarg(call, "factor", 1.0)?;
                let offset = int_kwarg(call, "offset", 0)?;
                (RelationKind::Padding { modulo, once, factor, offset }, pad)
            }
            other => return Err(DslError::UnknownFunction(other.to_string())),
        };
        Ok(Variable::relation(name, kind, targets, data_type)?)
    }

    fn collect_targets(&self, decl: &SymbolDecl, function: &str, arg: &Expr, out: &mut Vec<VarId>) -> Result<(), DslError> {
        match arg {
            Expr::Ref { symbol: Some(s), field } => out.push(self.reserved(s, field)?),
            Expr::Ref { symbol: None, field } => out.push(self.reserved(&decl.name, field)?),
            Expr::List(items) => {
                for item in items {
                    self.collect_targets(decl, function, item, out)?;
                }
            }
            other => return Err(bad(function, format!("expected a field reference, found {}", other.describe()))),
        }
        Ok(())
    }
}

/// Data type of a leaf call such as `uint16le(0..=1500)` or `raw(0xcafe)`.
fn leaf_type(call: &Call) -> Result<Arc<dyn DataType>, DslError> {
    let function = call.name.as_str();
    no_kwargs(call)?;
    let arg = match call.args.as_slice() {
        [] => None,
        [one] => Some(one),
        _ => return Err(bad(function, "expected at most one argument")),
    };
    if let Some(integer) = integer_type(function) {
        let integer = integer?;
        return Ok(Arc::new(match arg {
            None => integer,
            Some(Expr::Int(v)) => integer.with_value(*v)?,
            Some(Expr::Bytes(b)) if b.len() <= 8 => {
                integer.with_value(b.iter().fold(0i128, |acc, x| (acc << 8) | i128::from(*x)))?
            }
            Some(Expr::Range { start, end, inclusive }) => {
                let hi = if *inclusive { *end } else { end - 1 };
                integer.with_interval(*start, hi)?
            }
            Some(other) => return Err(bad(function, format!("expected a value or a range, found {}", other.describe()))),
        }));
    }
    let data_type: Arc<dyn DataType> = match (function, arg) {
        ("raw", None) => Arc::new(Raw::sized(0, None)?),
        ("raw", Some(Expr::Bytes(b))) => Arc::new(Raw::fixed(b.clone())),
        ("raw", Some(Expr::Text(s))) => Arc::new(Raw::fixed(s.as_bytes().to_vec())),
        ("raw", Some(e)) => {
            let (min, max) = length_bounds(function, e)?;
            Arc::new(Raw::sized(min, Some(max))?)
        }
        ("ascii", None) => Arc::new(Ascii::sized(0, None)?),
        ("ascii", Some(Expr::Text(s))) => Arc::new(Ascii::fixed(s.clone())?),
        ("ascii", Some(e)) => {
            let (min, max) = length_bounds(function, e)?;
            Arc::new(Ascii::sized(min, Some(max))?)
        }
        ("bits", None) => Arc::new(BitArray::sized(0, None)?),
        ("bits", Some(Expr::Bits(b))) => Arc::new(BitArray::fixed(b.clone())),
        ("bits", Some(e)) => {
            let (min, max) = length_bounds(function, e)?;
            Arc::new(BitArray::sized(min, Some(max))?)
        }
        ("ipv4", None) => Arc::new(Ipv4::new()),
        ("ipv4", Some(Expr::Text(s))) => {
            let addr: Ipv4Addr = s.parse().map_err(|_| bad(function, format!("invalid address {}", s)))?;
            Arc::new(Ipv4::fixed(addr))
        }
        ("timestamp", None) => Arc::new(Timestamp::new()),
        ("timestamp", Some(Expr::Int(n))) => {
            let seconds = u32::try_from(*n).map_err(|_| bad(function, format!("{} is not a 32-bit time", n)))?;
            Arc::new(Timestamp::fixed(seconds))
        }
        ("ipv4" | "timestamp", Some(other)) => {
            return Err(bad(function, format!("unexpected {}", other.describe())));
        }
        _ => return Err(DslError::UnknownFunction(function.to_string())),
    };
    Ok(data_type)
}

/// `uint8` .. `int64`, with an optional `le`/`be` suffix.
fn integer_type(name: &str) -> Option<Result<Integer, TypeError>> {
    let (sign, rest) = if let Some(rest) = name.strip_prefix("uint") {
        (Sign::Unsigned, rest)
    } else if let Some(rest) = name.strip_prefix("int") {
        (Sign::Signed, rest)
    } else {
        return None;
    };
    let (digits, endianness) = if let Some(d) = rest.strip_suffix("le") {
        (d, Endianness::Little)
    } else if let Some(d) = rest.strip_suffix("be") {
        (d, Endianness::Big)
    } else {
        (rest, Endianness::Big)
    };
    let bits: usize = digits.parse().ok()?;
    Some(Integer::new(bits, endianness, sign))
}

/// Inclusive length bounds from `n` or a range.
fn length_bounds(function: &str, e: &Expr) -> Result<(usize, usize), DslError> {
    match e {
        Expr::Int(n) => {
            let n = to_usize(function, *n)?;
            Ok((n, n))
        }
        Expr::Range { start, end, inclusive } => {
            let hi = if *inclusive { *end } else { end - 1 };
            Ok((to_usize(function, *start)?, to_usize(function, hi)?))
        }
        other => Err(bad(function, format!("expected a length or a range, found {}", other.describe()))),
    }
}

fn to_usize(function: &str, n: i128) -> Result<usize, DslError> {
    usize::try_from(n).map_err(|_| bad(function, format!("{} is not a valid count", n)))
}

fn as_call<'c>(function: &str, e: &'c Expr) -> Result<&'c Call, DslError> {
    match e {
        Expr::Call(c) => Ok(c),
        other => Err(bad(function, format!("expected a domain, found {}", other.describe()))),
    }
}

fn bytes_of(function: &str, e: &Expr) -> Result<Vec<u8>, DslError> {
    match e {
        Expr::Bytes(b) => Ok(b.clone()),
        Expr::Text(s) => Ok(s.as_bytes().to_vec()),
        other => Err(bad(function, format!("expected bytes, found {}", other.describe()))),
    }
}

fn bits_of(function: &str, e: &Expr) -> Result<BitString, DslError> {
    match e {
        Expr::Bits(b) => Ok(b.clone()),
        other => bytes_of(function, other).map(BitString::from),
    }
}

fn kwarg<'c>(call: &'c Call, key: &str) -> Option<&'c Expr> {
    call.kwargs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

fn check_kwargs(call: &Call, allowed: &[&str]) -> Result<(), DslError> {
    match call.kwargs.iter().find(|(k, _)| !allowed.contains(&k.as_str())) {
        Some((k, _)) => Err(bad(&call.name, format!("unknown argument `{}`", k))),
        None => Ok(()),
    }
}

fn no_kwargs(call: &Call) -> Result<(), DslError> {
    check_kwargs(call, &[])
}

fn float_kwarg(call: &Call, key: &str, default: f64) -> Result<f64, DslError> {
    match kwarg(call, key) {
        Some(Expr::Float(f)) => Ok(*f),
        Some(Expr::Int(n)) => Ok(*n as f64),
        Some(other) => Err(bad(&call.name, format!("{} must be a number, found {}", key, other.describe()))),
        None => Ok(default),
    }
}

fn int_kwarg(call: &Call, key: &str, default: i64) -> Result<i64, DslError> {
    match kwarg(call, key) {
        Some(Expr::Int(n)) => i64::try_from(*n).map_err(|_| bad(&call.name, format!("{} out of range", key))),
        Some(other) => Err(bad(&call.name, format!("{} must be an integer, found {}", key, other.describe()))),
        None => Ok(default),
    }
}
