use crate::error::RmPermError;
use crate::types::{parse_methodsignature, MethodSignature, TypeSignature};
use nom::{
    bytes::complete::{tag, take_until, take_while1},
    character::complete::{char, digit1, one_of, space0, space1},
    combinator::{all_consuming, map_res},
    multi::separated_list0,
    sequence::{delimited, pair},
    IResult,
};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label(pub String);

// A helper function to determine valid characters for a label.
fn is_label_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Parse a label in smali syntax, e.g. ":cond_0"
pub fn parse_label(input: &str) -> IResult<&str, Label> {
    let (input, _) = tag(":")(input)?;
    let (input, label_body) = take_while1(is_label_char)(input)?;
    Ok((input, Label(label_body.to_string())))
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.0)
    }
}

/// A symbolic reference to a method: defining type, name, parameter types and return type.
///
/// Equality and hashing are structural, so a reference parsed from a call site matches one
/// built from a permission table or a replacement library.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodRef {
    /// The defining type as a descriptor, e.g. "Lcom/example/MyClass;". Array types such as
    /// "[I" can appear here too.
    pub class: String,
    /// The method name.
    pub name: String,
    /// Parameter and return types.
    pub signature: MethodSignature,
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Example: Landroid/location/LocationManager;->getLastKnownLocation(Ljava/lang/String;)Landroid/location/Location;
        write!(f, "{}->{}{}", self.class, self.name, self.signature.to_jni())
    }
}

impl MethodRef {
    pub fn new(class: &str, name: &str, args: Vec<TypeSignature>, result: TypeSignature) -> MethodRef {
        MethodRef {
            class: class.to_string(),
            name: name.to_string(),
            signature: MethodSignature { args, result },
        }
    }

    /// Parses the smali spelling `Lfoo/Bar;->name(I)V`.
    pub fn from_smali(s: &str) -> Result<MethodRef, RmPermError> {
        match all_consuming(parse_method_ref)(s.trim()) {
            Ok((_, m)) => Ok(m),
            Err(_) => Err(err!("Could not parse method reference {}", s)),
        }
    }

    pub fn returns_void(&self) -> bool {
        self.signature.result.is_void()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmaliRegister {
    Parameter(u16),
    Local(u16),
}

pub fn p(u: u16) -> SmaliRegister {
    SmaliRegister::Parameter(u)
}
pub fn v(u: u16) -> SmaliRegister {
    SmaliRegister::Local(u)
}

impl fmt::Display for SmaliRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmaliRegister::Parameter(n) => write!(f, "p{n}"),
            SmaliRegister::Local(n) => write!(f, "v{n}"),
        }
    }
}

/// A symbolic range of registers as written in smali, e.g. "{v0 .. v6}"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRange {
    pub start: SmaliRegister,
    pub end: SmaliRegister,
}

impl fmt::Display for RegisterRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{} .. {}}}", self.start, self.end)
    }
}

/// A method body instruction.
///
/// Invocations are decoded into their callee and registers; every other instruction is kept
/// verbatim in `Other`.
#[derive(Debug, Clone, PartialEq)]
pub enum DexOp {
    InvokeVirtual {
        registers: Vec<SmaliRegister>,
        method: MethodRef,
    },
    InvokeSuper {
        registers: Vec<SmaliRegister>,
        method: MethodRef,
    },
    InvokeDirect {
        registers: Vec<SmaliRegister>,
        method: MethodRef,
    },
    InvokeStatic {
        registers: Vec<SmaliRegister>,
        method: MethodRef,
    },
    InvokeInterface {
        registers: Vec<SmaliRegister>,
        method: MethodRef,
    },
    InvokeVirtualRange {
        range: RegisterRange,
        method: MethodRef,
    },
    InvokeSuperRange {
        range: RegisterRange,
        method: MethodRef,
    },
    InvokeDirectRange {
        range: RegisterRange,
        method: MethodRef,
    },
    InvokeStaticRange {
        range: RegisterRange,
        method: MethodRef,
    },
    InvokeInterfaceRange {
        range: RegisterRange,
        method: MethodRef,
    },
    Other(String),
}

impl DexOp {
    /// The callee of an invoke instruction.
    pub fn invoked_method(&self) -> Option<&MethodRef> {
        match self {
            DexOp::InvokeVirtual { method, .. }
            | DexOp::InvokeSuper { method, .. }
            | DexOp::InvokeDirect { method, .. }
            | DexOp::InvokeStatic { method, .. }
            | DexOp::InvokeInterface { method, .. }
            | DexOp::InvokeVirtualRange { method, .. }
            | DexOp::InvokeSuperRange { method, .. }
            | DexOp::InvokeDirectRange { method, .. }
            | DexOp::InvokeStaticRange { method, .. }
            | DexOp::InvokeInterfaceRange { method, .. } => Some(method),
            DexOp::Other(_) => None,
        }
    }
}

fn join_registers(registers: &[SmaliRegister]) -> String {
    registers
        .iter()
        .map(|r| format!("{r}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for DexOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DexOp::InvokeVirtual { registers, method } => {
                write!(f, "invoke-virtual {{{}}}, {method}", join_registers(registers))
            }
            DexOp::InvokeSuper { registers, method } => {
                write!(f, "invoke-super {{{}}}, {method}", join_registers(registers))
            }
            DexOp::InvokeDirect { registers, method } => {
                write!(f, "invoke-direct {{{}}}, {method}", join_registers(registers))
            }
            DexOp::InvokeStatic { registers, method } => {
                write!(f, "invoke-static {{{}}}, {method}", join_registers(registers))
            }
            DexOp::InvokeInterface { registers, method } => {
                write!(f, "invoke-interface {{{}}}, {method}", join_registers(registers))
            }
            DexOp::InvokeVirtualRange { range, method } => {
                write!(f, "invoke-virtual/range {range}, {method}")
            }
            DexOp::InvokeSuperRange { range, method } => {
                write!(f, "invoke-super/range {range}, {method}")
            }
            DexOp::InvokeDirectRange { range, method } => {
                write!(f, "invoke-direct/range {range}, {method}")
            }
            DexOp::InvokeStaticRange { range, method } => {
                write!(f, "invoke-static/range {range}, {method}")
            }
            DexOp::InvokeInterfaceRange { range, method } => {
                write!(f, "invoke-interface/range {range}, {method}")
            }
            DexOp::Other(s) => write!(f, "{s}"),
        }
    }
}

fn parse_register(input: &str) -> IResult<&str, SmaliRegister> {
    let (input, (kind, n)) = pair(one_of("vp"), map_res(digit1, |d: &str| d.parse::<u16>()))(input)?;
    let reg = if kind == 'p' { SmaliRegister::Parameter(n) } else { SmaliRegister::Local(n) };
    Ok((input, reg))
}

/// Parses "{v0, v1, p2}" (possibly empty)
fn parse_register_list(input: &str) -> IResult<&str, Vec<SmaliRegister>> {
    delimited(
        pair(char('{'), space0),
        separated_list0(delimited(space0, char(','), space0), parse_register),
        pair(space0, char('}')),
    )(input)
}

/// Parses a register range enclosed in braces, e.g. "{v0 .. v6}".
fn parse_register_range(input: &str) -> IResult<&str, RegisterRange> {
    let (input, _) = pair(char('{'), space0)(input)?;
    let (input, start) = parse_register(input)?;
    let (input, _) = delimited(space0, tag(".."), space0)(input)?;
    let (input, end) = parse_register(input)?;
    let (input, _) = pair(space0, char('}'))(input)?;
    Ok((input, RegisterRange { start, end }))
}

pub(crate) fn parse_method_ref(input: &str) -> IResult<&str, MethodRef> {
    // Parse until the "->"
    let (input, class) = take_until("->")(input)?;
    let (input, _) = tag("->")(input)?;
    // Parse the method name (up to the opening parenthesis)
    let (input, name) = take_until("(")(input)?;
    let (input, signature) = parse_methodsignature(input)?;

    Ok((
        input,
        MethodRef {
            class: class.trim().to_owned(),
            name: name.trim().to_owned(),
            signature,
        },
    ))
}

fn parse_registers_and_method<F>(input: &str, constructor: F) -> IResult<&str, DexOp>
where
    F: Fn(Vec<SmaliRegister>, MethodRef) -> DexOp,
{
    let (input, _) = space1(input)?;
    let (input, registers) = parse_register_list(input)?;
    let (input, _) = delimited(space0, char(','), space0)(input)?;
    let (input, method) = parse_method_ref(input)?;
    Ok((input, constructor(registers, method)))
}

macro_rules! invoke_case {
    ($variant:ident, $input:expr) => {
        parse_registers_and_method($input, |registers, method| DexOp::$variant { registers, method })
    };
}

fn parse_range_and_method<F>(input: &str, constructor: F) -> IResult<&str, DexOp>
where
    F: Fn(RegisterRange, MethodRef) -> DexOp,
{
    let (input, _) = space1(input)?;
    let (input, range) = parse_register_range(input)?;
    let (input, _) = delimited(space0, char(','), space0)(input)?;
    let (input, method) = parse_method_ref(input)?;
    Ok((input, constructor(range, method)))
}

macro_rules! range_method_case {
    ($variant:ident, $input:expr) => {
        parse_range_and_method($input, |range, method| DexOp::$variant { range, method })
    };
}

/// Parses one instruction line. Anything that is not an invoke is returned as `DexOp::Other`.
pub fn parse_op(line: &str) -> IResult<&str, DexOp> {
    let line = line.trim();
    let (input, op) = take_while1(|c: char| c.is_alphanumeric() || c == '-' || c == '/')(line)?;
    let r = match op {
        "invoke-virtual" => invoke_case!(InvokeVirtual, input),
        "invoke-super" => invoke_case!(InvokeSuper, input),
        "invoke-direct" => invoke_case!(InvokeDirect, input),
        "invoke-static" => invoke_case!(InvokeStatic, input),
        "invoke-interface" => invoke_case!(InvokeInterface, input),
        "invoke-virtual/range" => range_method_case!(InvokeVirtualRange, input),
        "invoke-super/range" => range_method_case!(InvokeSuperRange, input),
        "invoke-direct/range" => range_method_case!(InvokeDirectRange, input),
        "invoke-static/range" => range_method_case!(InvokeStaticRange, input),
        "invoke-interface/range" => range_method_case!(InvokeInterfaceRange, input),
        _ => return Ok(("", DexOp::Other(line.to_string()))),
    };
    let (rest, dex_op) = r?;
    let (rest, _) = space0(rest)?;
    Ok((rest, dex_op))
}
