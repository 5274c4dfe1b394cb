/* Types for the parts of a smali class that the rewriter needs to understand. */
/* Object types are stored in the smali native (also JNI) format e.g. Ljava/lang/Object; */

use crate::error::RmPermError;
pub use crate::smali_ops::{DexOp, Label, MethodRef};
use crate::smali_parse::parse_class;
use crate::smali_write::write_class;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::char;
use nom::combinator::{all_consuming, value};
use nom::error::{Error, ErrorKind};
use nom::multi::many0;
use nom::IResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Represents a Java object identifier
///
/// # Examples
///
/// ```
/// use rmperm::types::ObjectIdentifier;
///
/// let o = ObjectIdentifier::from_java_type("android.location.LocationManager");
/// assert_eq!(o.as_jni_type(), "Landroid/location/LocationManager;");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectIdentifier {
    pub(crate) class_name: String,
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_jni_type())
    }
}

impl ObjectIdentifier {
    /// Accepts `Lfoo/Bar;`, tolerating a missing `L` or `;`.
    pub fn from_jni_type(t: &str) -> ObjectIdentifier {
        let t = t.trim();
        let t = t.strip_prefix('L').unwrap_or(t);
        let t = t.strip_suffix(';').unwrap_or(t);
        ObjectIdentifier {
            class_name: t.to_string(),
        }
    }

    pub fn from_java_type(t: &str) -> ObjectIdentifier {
        ObjectIdentifier {
            class_name: t.trim().replace('.', "/"),
        }
    }

    pub fn as_jni_type(&self) -> String {
        format!("L{};", self.class_name)
    }

    pub fn as_java_type(&self) -> String {
        self.class_name.replace('/', ".")
    }
}

/// Represents a Java type: array, object or primitive type
///
/// # Examples
///
/// ```
/// use rmperm::types::TypeSignature;
///
/// let t = TypeSignature::from_java("int[]").unwrap();
/// assert_eq!(t.to_jni(), "[I");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TypeSignature {
    Array(Box<TypeSignature>),
    Object(ObjectIdentifier),
    Int,
    Bool,
    Byte,
    Char,
    Short,
    Long,
    Float,
    Double,
    Void,
}

impl fmt::Display for TypeSignature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_jni())
    }
}

impl TypeSignature {
    pub fn from_jni(s: &str) -> Result<TypeSignature, RmPermError> {
        match all_consuming(parse_typesignature)(s.trim()) {
            Ok((_, ts)) => Ok(ts),
            Err(_) => Err(err!("Could not parse type descriptor {}", s)),
        }
    }

    /// Converts a Java source spelling (`java.lang.String`, `int`, `byte[][]`) to a type.
    pub fn from_java(s: &str) -> Result<TypeSignature, RmPermError> {
        let s = s.trim();
        if let Some(element) = s.strip_suffix("[]") {
            return Ok(TypeSignature::Array(Box::new(TypeSignature::from_java(element)?)));
        }
        Ok(match s {
            "boolean" => TypeSignature::Bool,
            "byte" => TypeSignature::Byte,
            "char" => TypeSignature::Char,
            "short" => TypeSignature::Short,
            "int" => TypeSignature::Int,
            "long" => TypeSignature::Long,
            "float" => TypeSignature::Float,
            "double" => TypeSignature::Double,
            "void" => TypeSignature::Void,
            "" => fail!("Empty Java type name"),
            _ => TypeSignature::Object(ObjectIdentifier::from_java_type(s)),
        })
    }

    pub fn to_jni(&self) -> String {
        match self {
            TypeSignature::Array(a) => "[".to_string() + &a.to_jni(),
            TypeSignature::Bool => "Z".to_string(),
            TypeSignature::Byte => "B".to_string(),
            TypeSignature::Char => "C".to_string(),
            TypeSignature::Short => "S".to_string(),
            TypeSignature::Int => "I".to_string(),
            TypeSignature::Long => "J".to_string(),
            TypeSignature::Float => "F".to_string(),
            TypeSignature::Double => "D".to_string(),
            TypeSignature::Object(o) => o.as_jni_type(),
            TypeSignature::Void => "V".to_string(),
        }
    }

    pub fn to_java(&self) -> String {
        match self {
            TypeSignature::Array(a) => format!("{}[]", a.to_java()),
            TypeSignature::Bool => "boolean".to_string(),
            TypeSignature::Byte => "byte".to_string(),
            TypeSignature::Char => "char".to_string(),
            TypeSignature::Short => "short".to_string(),
            TypeSignature::Int => "int".to_string(),
            TypeSignature::Long => "long".to_string(),
            TypeSignature::Float => "float".to_string(),
            TypeSignature::Double => "double".to_string(),
            TypeSignature::Object(o) => o.as_java_type(),
            TypeSignature::Void => "void".to_string(),
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, TypeSignature::Void)
    }
}

/// Represents a method prototype consisting of arguments and a return type
///
/// # Examples
///
/// ```
/// use rmperm::types::{MethodSignature, TypeSignature};
///
/// let m = MethodSignature::from_jni("([I)V").unwrap();
/// assert_eq!(m.result, TypeSignature::Void);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodSignature {
    pub args: Vec<TypeSignature>,
    pub result: TypeSignature,
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_jni())
    }
}

impl MethodSignature {
    pub fn from_jni(s: &str) -> Result<MethodSignature, RmPermError> {
        match all_consuming(parse_methodsignature)(s.trim()) {
            Ok((_, m)) => Ok(m),
            Err(_) => Err(err!("Could not parse method descriptor {}", s)),
        }
    }

    pub fn to_jni(&self) -> String {
        let mut s = String::from("(");
        for t in &self.args {
            s.push_str(&t.to_jni());
        }
        s.push(')');
        s.push_str(&self.result.to_jni());
        s
    }
}

pub(crate) fn parse_typesignature(smali: &str) -> IResult<&str, TypeSignature> {
    // Object
    let l: IResult<&str, char> = char('L')(smali);
    if let Ok((o, _)) = l {
        let (o, t) = take_while1(|x| x != ';' && x != '\n')(o)?;
        let (o, _) = char(';')(o)?;
        let object = ObjectIdentifier {
            class_name: t.to_string(),
        };
        return Ok((o, TypeSignature::Object(object)));
    }

    // Array
    let b: IResult<&str, char> = char('[')(smali);
    if let Ok((o, _)) = b {
        let (o, t) = parse_typesignature(o)?;
        return Ok((o, TypeSignature::Array(Box::new(t))));
    }

    // Primitive type
    let p: IResult<&str, TypeSignature> = alt((
        value(TypeSignature::Bool, tag("Z")),
        value(TypeSignature::Byte, tag("B")),
        value(TypeSignature::Char, tag("C")),
        value(TypeSignature::Short, tag("S")),
        value(TypeSignature::Int, tag("I")),
        value(TypeSignature::Long, tag("J")),
        value(TypeSignature::Float, tag("F")),
        value(TypeSignature::Double, tag("D")),
        value(TypeSignature::Void, tag("V")),
    ))(smali);
    if let Ok(r) = p {
        return Ok(r);
    }

    Err(nom::Err::Error(Error {
        input: smali,
        code: ErrorKind::Alt,
    }))
}

pub(crate) fn parse_methodsignature(smali: &str) -> IResult<&str, MethodSignature> {
    let (o, _) = tag("(")(smali)?;
    let (o, args) = many0(parse_typesignature)(o)?;
    let (o, _) = tag(")")(o)?;
    let (o, result) = parse_typesignature(o)?;
    Ok((o, MethodSignature { args, result }))
}

/// Simple enum to represent Java method, field and class modifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Public,
    Private,
    Protected,
    Static,
    Final,
    Synchronized,
    Volatile,
    Bridge,
    Transient,
    Varargs,
    Native,
    Interface,
    Abstract,
    Strict,
    Synthetic,
    Annotation,
    Enum,
    DeclaredSynchronized,
}

impl FromStr for Modifier {
    type Err = RmPermError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "public" => Self::Public,
            "protected" => Self::Protected,
            "private" => Self::Private,
            "static" => Self::Static,
            "final" => Self::Final,
            "abstract" => Self::Abstract,
            "interface" => Self::Interface,
            "synthetic" => Self::Synthetic,
            "transient" => Self::Transient,
            "volatile" => Self::Volatile,
            "synchronized" => Self::Synchronized,
            "declared-synchronized" => Self::DeclaredSynchronized,
            "native" => Self::Native,
            "varargs" => Self::Varargs,
            "annotation" => Self::Annotation,
            "enum" => Self::Enum,
            "strict" => Self::Strict,
            "bridge" => Self::Bridge,
            _ => fail!("Unknown modifier {}", s),
        })
    }
}

impl Modifier {
    pub fn to_str(&self) -> &str {
        match self {
            Self::Public => "public",
            Self::Protected => "protected",
            Self::Private => "private",
            Self::Static => "static",
            Self::Final => "final",
            Self::Abstract => "abstract",
            Self::Interface => "interface",
            Self::Synthetic => "synthetic",
            Self::Transient => "transient",
            Self::Volatile => "volatile",
            Self::Synchronized => "synchronized",
            Self::DeclaredSynchronized => "declared-synchronized",
            Self::Native => "native",
            Self::Varargs => "varargs",
            Self::Annotation => "annotation",
            Self::Enum => "enum",
            Self::Strict => "strict",
            Self::Bridge => "bridge",
        }
    }
}

/// Simple enum to represent annotation visibility: build, runtime, system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationVisibility {
    Build,
    Runtime,
    System,
}

impl AnnotationVisibility {
    pub fn to_str(&self) -> &str {
        match self {
            Self::Build => "build",
            Self::Runtime => "runtime",
            Self::System => "system",
        }
    }
}

impl FromStr for AnnotationVisibility {
    type Err = RmPermError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "build" => Self::Build,
            "runtime" => Self::Runtime,
            "system" => Self::System,
            _ => fail!("Unknown annotation visibility {}", s),
        })
    }
}

/// Annotation values can be a Single value, Array, Enum or another Annotation.
///
/// Single and array values are kept in their smali spelling, so strings keep their quotes.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationValue {
    Single(String),
    Array(Vec<String>),
    SubAnnotation(SmaliAnnotation),
    Enum(ObjectIdentifier, String),
}

impl AnnotationValue {
    /// The unescaped contents of a string literal value, or None for any other kind of value.
    pub fn as_string(&self) -> Option<String> {
        match self {
            AnnotationValue::Single(s) => {
                let inner = s.trim().strip_prefix('"')?.strip_suffix('"')?;
                Some(unescape(inner))
            }
            _ => None,
        }
    }
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(u) => out.push(u),
                    None => {
                        out.push_str("\\u");
                        out.push_str(&hex);
                    }
                }
            }
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Name, value pair for annotation elements. There can be several of these per annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationElement {
    pub name: String,
    pub value: AnnotationValue,
}

/// Struct representing a Java annotation, these can occur at class level, method level, within a field or within another annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct SmaliAnnotation {
    pub visibility: AnnotationVisibility,
    pub annotation_type: TypeSignature,
    pub elements: Vec<AnnotationElement>,
}

impl SmaliAnnotation {
    /// True if this annotation has the given JNI type descriptor.
    pub fn is_type(&self, descriptor: &str) -> bool {
        self.annotation_type.to_jni() == descriptor
    }
}

/// Struct representing a Java field
#[derive(Debug, Clone, PartialEq)]
pub struct SmaliField {
    /// Name of the field
    pub name: String,
    /// Any modifiers
    pub modifiers: Vec<Modifier>,
    /// Type signature of the field
    pub signature: TypeSignature,
    /// If an initialiser is included
    pub initial_value: Option<String>,
    /// Field level annotations
    pub annotations: Vec<SmaliAnnotation>,
}

/// An entry in a method body.
///
/// Only invocations are decoded; other instructions and directives are kept as written so the
/// body can be emitted again unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum SmaliOp {
    Label(Label),
    Line(u32),
    Op(DexOp),
    /// Any other directive (`.registers`, `.param`, `.catch`, switch payloads, ...). Blocks keep
    /// their inner lines separated by `\n`.
    Directive(String),
}

/// Struct representing a Java method
#[derive(Debug, Clone, PartialEq)]
pub struct SmaliMethod {
    /// Method name
    pub name: String,
    /// Method modifiers
    pub modifiers: Vec<Modifier>,
    /// Is it a constructor
    pub constructor: bool,
    /// Method signature
    pub signature: MethodSignature,
    /// The `.locals` count, absent for methods without code
    pub locals: Option<u32>,
    /// Any method level annotations
    pub annotations: Vec<SmaliAnnotation>,
    /// Method operations
    pub ops: Vec<SmaliOp>,
}

impl SmaliMethod {
    pub fn is_public(&self) -> bool {
        self.modifiers.contains(&Modifier::Public)
    }

    pub fn is_static(&self) -> bool {
        self.modifiers.contains(&Modifier::Static)
    }

    /// Abstract and native methods carry no code.
    pub fn has_body(&self) -> bool {
        self.locals.is_some() || !self.ops.is_empty()
    }
}

/// Represents a smali class i.e. the whole .smali file
///
/// # Examples
///
/// ```no_run
///  use std::path::Path;
///  use rmperm::types::SmaliClass;
///
///  let c = SmaliClass::read_from_file(Path::new("smali/com/cool/Class.smali")).expect("Uh oh, does the file exist?");
///  println!("Java class: {}", c.name.as_java_type());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SmaliClass {
    /// The name of this class
    pub name: ObjectIdentifier,
    /// Class modifiers
    pub modifiers: Vec<Modifier>,
    /// The source filename if included in the smali doc
    pub source: Option<String>,
    /// The class' superclass, absent only for java.lang.Object
    pub super_class: Option<ObjectIdentifier>,
    /// List of all the interfaces the class implements
    pub implements: Vec<ObjectIdentifier>,
    /// Class level annotations
    pub annotations: Vec<SmaliAnnotation>,
    /// All the fields defined by the class
    pub fields: Vec<SmaliField>,
    /// All the methods defined by the class
    pub methods: Vec<SmaliMethod>,
}

impl SmaliClass {
    /// Creates a SmaliClass from a String containing a valid smali document
    ///
    /// # Examples
    ///
    /// ```
    ///  use rmperm::types::SmaliClass;
    ///
    ///  let smali = ".class public Lcom/example/Main;\n.super Ljava/lang/Object;\n";
    ///  let c = SmaliClass::from_smali(smali).expect("Parse error");
    ///  assert_eq!(c.name.as_java_type(), "com.example.Main");
    /// ```
    pub fn from_smali(s: &str) -> Result<SmaliClass, RmPermError> {
        parse_class(s)
    }

    pub fn read_from_file(path: &Path) -> Result<SmaliClass, RmPermError> {
        let s = fs::read_to_string(path)
            .map_err(|e| err!("Error loading file {}: {}", path.display(), e))?;
        SmaliClass::from_smali(&s).map_err(|e| err!(e, context: "{}", path.display()))
    }

    /// Creates a smali document string from the current class
    pub fn to_smali(&self) -> String {
        write_class(self)
    }

    pub fn write_to_file(&self, path: &Path) -> Result<(), RmPermError> {
        fs::write(path, self.to_smali()).map_err(|e| err!("Error writing file {}: {}", path.display(), e))
    }

    /// Writes the class below `path`, creating sub-directories for packages as needed.
    /// Returns the path of the written file.
    pub fn write_to_directory(&self, path: &Path) -> Result<PathBuf, RmPermError> {
        let mut file = PathBuf::from(path);
        let mut segments = self.name.class_name.split('/').peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_some() {
                file.push(segment);
            } else {
                fs::create_dir_all(&file)
                    .map_err(|e| err!("Error creating directory {}: {}", file.display(), e))?;
                file.push(format!("{segment}.smali"));
            }
        }
        self.write_to_file(&file)?;
        Ok(file)
    }

    pub fn is_public(&self) -> bool {
        self.modifiers.contains(&Modifier::Public)
    }
}
