use crate::error::RmPermError;
use crate::smali_ops::{parse_label, parse_op};
use crate::types::*;
use nom::branch::alt;
use nom::bytes::complete::{escaped, is_not, tag, take_while, take_while1};
use nom::character::complete::{char, line_ending, multispace0, none_of, not_line_ending, one_of, space0, space1};
use nom::combinator::{map_res, opt, value};
use nom::error::{Error, ErrorKind};
use nom::multi::many1;
use nom::sequence::{delimited, pair, preceded, terminated};
use nom::Err::Failure;
use nom::IResult;
use std::str::FromStr;

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn quoted<'a>() -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    let esc = escaped(none_of("\\\""), '\\', one_of("'\"tbnrfu\\"));
    let esc_or_empty = alt((esc, tag("")));

    delimited(pair(space0, char('"')), esc_or_empty, char('"'))
}

fn fail_at<T>(input: &str) -> IResult<&str, T> {
    Err(Failure(Error { input, code: ErrorKind::Fail }))
}

fn comment(i: &str) -> IResult<&str, ()> {
    value((), pair(char('#'), opt(is_not("\n\r"))))(i)
}

fn take_until_eol(s: &str) -> IResult<&str, &str> {
    let (input, r) = not_line_ending(s)?;
    let (input, _) = opt(line_ending)(input)?;
    Ok((input, r))
}

/// Consumes leading modifier keywords, stopping at the first word that is not one.
fn parse_modifiers(smali: &str) -> IResult<&str, Vec<Modifier>> {
    let mut input = smali;
    let mut mods = vec![];
    loop {
        let word: IResult<&str, &str> = preceded(space0, terminated(take_while1(|c: char| c.is_alphanumeric() || c == '-'), space1))(input);
        match word {
            Ok((o, w)) => match Modifier::from_str(w) {
                Ok(m) => {
                    mods.push(m);
                    input = o;
                }
                Err(_) => break,
            },
            Err(_) => break,
        }
    }
    let (input, _) = space0(input)?;
    Ok((input, mods))
}

fn parse_visibility(smali: &str) -> IResult<&str, AnnotationVisibility> {
    map_res(ws(alt((tag("build"), tag("runtime"), tag("system")))), AnnotationVisibility::from_str)(smali)
}

fn parse_class_line(smali: &str) -> IResult<&str, (Vec<Modifier>, String)> {
    let (input, _) = terminated(tag(".class"), space1)(smali)?;
    let (input, modifiers) = parse_modifiers(input)?;
    let (input, class_type) = take_until_eol(input)?;
    Ok((input, (modifiers, class_type.trim().to_string())))
}

fn parse_super_line(smali: &str) -> IResult<&str, String> {
    let (input, _) = terminated(tag(".super"), space1)(smali)?;
    let (input, class_type) = take_until_eol(input)?;
    Ok((input, class_type.trim().to_string()))
}

fn parse_implements_line(smali: &str) -> IResult<&str, String> {
    let (input, _) = terminated(tag(".implements"), space1)(smali)?;
    let (input, class_type) = take_until_eol(input)?;
    Ok((input, class_type.trim().to_string()))
}

fn parse_source_line(smali: &str) -> IResult<&str, String> {
    let (input, _) = tag(".source")(smali)?;
    let (input, source) = quoted()(input)?;
    let (input, _) = take_until_eol(input)?;
    Ok((input, source.to_string()))
}

/// Collects the raw lines of a block up to and including the line starting with `end_tag`.
fn take_block<'a>(smali: &'a str, end_tag: &str) -> IResult<&'a str, String> {
    let mut lines = vec![];
    let mut input = smali;
    loop {
        if input.is_empty() {
            return fail_at(smali);
        }
        let (o, line) = take_until_eol(input)?;
        let line = line.trim();
        input = o;
        if !line.is_empty() {
            lines.push(line.to_string());
        }
        if line.starts_with(end_tag) {
            return Ok((input, lines.join("\n")));
        }
    }
}

fn parse_java_array(smali: &str) -> IResult<&str, Vec<String>> {
    let (o, _) = ws(tag("{"))(smali)?;
    let mut v = vec![];

    let mut input = o;
    loop {
        if let Ok((o, _)) = ws(tag::<_, _, Error<&str>>("}"))(input) {
            return Ok((o, v));
        }

        if let Ok((o, s)) = ws(quoted())(input) {
            v.push(format!("\"{}\"", s));
            input = o;
        } else if input.starts_with(".subannotation") {
            let (o, block) = take_block(input, ".end subannotation")?;
            v.push(block);
            input = o;
        } else {
            let (o, s) = ws(is_not(",}\n"))(input)?;
            v.push(s.trim().to_string());
            input = o;
        }

        if let Ok((o, _)) = ws(tag::<_, _, Error<&str>>(","))(input) {
            input = o;
        }
    }
}

fn parse_enum(smali: &str) -> IResult<&str, AnnotationValue> {
    let (input, _) = ws(tag(".enum"))(smali)?;
    let (input, object) = take_while1(|c| c != '-')(input)?;
    let (input, _) = tag("->")(input)?;
    let (input, field) = take_while(|x| x != ':' && x != '\n')(input)?;
    let (input, _) = take_until_eol(input)?;
    Ok((input, AnnotationValue::Enum(ObjectIdentifier::from_jni_type(object), field.to_string())))
}

fn parse_annotation_element(smali: &str) -> IResult<&str, AnnotationElement> {
    let (input, name) = ws(take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '$'))(smali)?;
    let (input, _) = terminated(char('='), space0)(input)?;

    let (rest, value) = if let Ok((i, e)) = parse_annotation(input, true) {
        (i, AnnotationValue::SubAnnotation(e))
    } else if let Ok((i, e)) = parse_enum(input) {
        (i, e)
    } else if let Ok((i, elements)) = parse_java_array(input) {
        (i, AnnotationValue::Array(elements))
    } else {
        let (i, v) = take_until_eol(input)?;
        (i, AnnotationValue::Single(v.trim().to_string()))
    };

    Ok((rest, AnnotationElement { name: name.to_string(), value }))
}

pub(crate) fn parse_annotation(smali: &str, subannotation: bool) -> IResult<&str, SmaliAnnotation> {
    let (input, visibility, end_tag) = if subannotation {
        let (o, _) = ws(tag(".subannotation"))(smali)?;
        (o, AnnotationVisibility::System, ".end subannotation")
    } else {
        let (o, _) = ws(tag(".annotation"))(smali)?;
        let (o, v) = parse_visibility(o)?;
        (o, v, ".end annotation")
    };

    let (input, type_sig) = take_until_eol(input)?;
    let annotation_type = match TypeSignature::from_jni(type_sig) {
        Ok(t) => t,
        Err(_) => return fail_at(input),
    };
    let mut annotation = SmaliAnnotation {
        visibility,
        annotation_type,
        elements: vec![],
    };

    let mut input = input;
    loop {
        if let Ok((o, _)) = ws(tag::<_, _, Error<&str>>(end_tag))(input) {
            return Ok((o, annotation));
        }

        match parse_annotation_element(input) {
            Ok((o, element)) => {
                annotation.elements.push(element);
                input = o;
            }
            Err(_) => return fail_at(input),
        }
    }
}

fn parse_field(smali: &str) -> IResult<&str, SmaliField> {
    let (input, _) = terminated(tag(".field"), space1)(smali)?;
    let (input, modifiers) = parse_modifiers(input)?;
    let (input, name) = take_while1(|c| c != ':' && c != '\n')(input)?;
    let (input, _) = char(':')(input)?;
    let (input, type_sig) = take_while1(|x: char| !x.is_whitespace() && x != '=')(input)?;
    let signature = match TypeSignature::from_jni(type_sig) {
        Ok(t) => t,
        Err(_) => return fail_at(input),
    };

    let (input, initial_value) = opt(preceded(delimited(space0, char('='), space0), not_line_ending))(input)?;
    let (mut input, _) = take_until_eol(input)?;

    let mut field = SmaliField {
        name: name.trim().to_string(),
        modifiers,
        signature,
        initial_value: initial_value.map(|s| s.trim().to_string()),
        annotations: vec![],
    };

    // Annotations only belong to the field when the block is closed by .end field
    let block: IResult<&str, Vec<SmaliAnnotation>> =
        terminated(many1(|i| parse_annotation(i, false)), ws(tag(".end field")))(input);
    if let Ok((o, annotations)) = block {
        field.annotations = annotations;
        input = o;
    }

    Ok((input, field))
}

fn is_block_directive(line: &str) -> Option<&'static str> {
    if line.starts_with(".array-data") {
        Some(".end array-data")
    } else if line.starts_with(".packed-switch") {
        Some(".end packed-switch")
    } else if line.starts_with(".sparse-switch") {
        Some(".end sparse-switch")
    } else {
        None
    }
}

/// Parses one entry of a method body, pushing it onto `method`.
fn parse_body_entry<'a>(smali: &'a str, method: &mut SmaliMethod) -> IResult<&'a str, ()> {
    if smali.starts_with('#') {
        let (o, _) = comment(smali)?;
        return Ok((o, ()));
    }

    if smali.starts_with(".annotation") {
        let (o, a) = parse_annotation(smali, false)?;
        method.annotations.push(a);
        return Ok((o, ()));
    }

    let (rest, line) = take_until_eol(smali)?;
    let line = line.trim();

    if let Some(n) = line.strip_prefix(".locals") {
        return match n.trim().parse::<u32>() {
            Ok(n) => {
                method.locals = Some(n);
                Ok((rest, ()))
            }
            Err(_) => fail_at(smali),
        };
    }

    if let Some(n) = line.strip_prefix(".line") {
        return match n.trim().parse::<u32>() {
            Ok(n) => {
                method.ops.push(SmaliOp::Line(n));
                Ok((rest, ()))
            }
            Err(_) => fail_at(smali),
        };
    }

    if line.starts_with(':') {
        return match parse_label(line) {
            Ok((_, l)) => {
                method.ops.push(SmaliOp::Label(l));
                Ok((rest, ()))
            }
            Err(_) => fail_at(smali),
        };
    }

    if let Some(end_tag) = is_block_directive(line) {
        let (o, block) = take_block(smali, end_tag)?;
        method.ops.push(SmaliOp::Directive(block));
        return Ok((o, ()));
    }

    if line.starts_with(".param") {
        // Annotations only belong to the parameter when the block is closed by .end param,
        // otherwise they are method annotations following a plain .param line
        let block: IResult<&str, Vec<SmaliAnnotation>> =
            terminated(many1(|i| parse_annotation(i, false)), ws(tag(".end param")))(rest);
        if block.is_ok() {
            let (o, block) = take_block(smali, ".end param")?;
            method.ops.push(SmaliOp::Directive(block));
            return Ok((o, ()));
        }
        method.ops.push(SmaliOp::Directive(line.to_string()));
        return Ok((rest, ()));
    }

    if line.starts_with('.') {
        method.ops.push(SmaliOp::Directive(line.to_string()));
        return Ok((rest, ()));
    }

    match parse_op(line) {
        Ok((_, op)) => {
            method.ops.push(SmaliOp::Op(op));
            Ok((rest, ()))
        }
        Err(_) => fail_at(smali),
    }
}

fn parse_method(smali: &str) -> IResult<&str, SmaliMethod> {
    let (input, _) = terminated(tag(".method"), space1)(smali)?;
    let (input, modifiers) = parse_modifiers(input)?;
    let (input, constructor) = opt(terminated(tag("constructor"), space1))(input)?;
    let (input, name) = take_while1(|c| c != '(' && c != '\n')(input)?;
    let (input, signature) = parse_methodsignature(input)?;
    let (input, _) = take_until_eol(input)?;

    let mut method = SmaliMethod {
        name: name.trim().to_string(),
        modifiers,
        constructor: constructor.is_some(),
        signature,
        locals: None,
        annotations: vec![],
        ops: vec![],
    };

    let mut input = input;
    loop {
        let (o, _) = multispace0(input)?;
        input = o;

        if let Ok((o, _)) = tag::<_, _, Error<&str>>(".end method")(input) {
            let (o, _) = take_until_eol(o)?;
            return Ok((o, method));
        }

        if input.is_empty() {
            return fail_at(smali);
        }

        let (o, _) = parse_body_entry(input, &mut method)?;
        input = o;
    }
}

fn line_number(whole: &str, rest: &str) -> usize {
    let consumed = whole.len().saturating_sub(rest.len());
    whole[..consumed].matches('\n').count() + 1
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("").trim()
}

/// Parses a complete smali document.
pub(crate) fn parse_class(smali: &str) -> Result<SmaliClass, RmPermError> {
    let mut input = smali;
    let mut name = None;

    let mut dex = SmaliClass {
        name: ObjectIdentifier::from_java_type("java.lang.Object"),
        super_class: None,
        source: None,
        implements: vec![],
        annotations: vec![],
        fields: vec![],
        methods: vec![],
        modifiers: vec![],
    };

    loop {
        let (o, _) = multispace0::<_, Error<&str>>(input).unwrap_or((input, ""));
        input = o;
        if input.is_empty() {
            break;
        }

        let parsed: Result<&str, nom::Err<Error<&str>>> = if input.starts_with('#') {
            comment(input).map(|(o, _)| o)
        } else if input.starts_with(".class") {
            parse_class_line(input).map(|(o, (m, c))| {
                dex.modifiers = m;
                name = Some(ObjectIdentifier::from_jni_type(&c));
                o
            })
        } else if input.starts_with(".super") {
            parse_super_line(input).map(|(o, c)| {
                dex.super_class = Some(ObjectIdentifier::from_jni_type(&c));
                o
            })
        } else if input.starts_with(".source") {
            parse_source_line(input).map(|(o, s)| {
                dex.source = Some(s);
                o
            })
        } else if input.starts_with(".implements") {
            parse_implements_line(input).map(|(o, c)| {
                dex.implements.push(ObjectIdentifier::from_jni_type(&c));
                o
            })
        } else if input.starts_with(".annotation") {
            parse_annotation(input, false).map(|(o, a)| {
                dex.annotations.push(a);
                o
            })
        } else if input.starts_with(".field") {
            parse_field(input).map(|(o, f)| {
                dex.fields.push(f);
                o
            })
        } else if input.starts_with(".method") {
            parse_method(input).map(|(o, m)| {
                dex.methods.push(m);
                o
            })
        } else {
            fail_at::<()>(input).map(|(o, _)| o)
        };

        match parsed {
            Ok(o) => input = o,
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
                // Report the statement that started the failing construct
                let at = if e.input.len() < input.len() { e.input } else { input };
                fail!("Unable to parse line {} `{}`", line_number(smali, at), first_line(at));
            }
            Err(nom::Err::Incomplete(_)) => fail!("Unexpected end of smali document"),
        }
    }

    match name {
        Some(n) => dex.name = n,
        None => fail!("Missing .class directive"),
    }
    Ok(dex)
}
