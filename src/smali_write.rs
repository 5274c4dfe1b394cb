use crate::types::{AnnotationValue, Modifier, SmaliAnnotation, SmaliClass, SmaliMethod, SmaliOp};

fn write_modifiers(mods: &[Modifier]) -> String
{
    let mut out = String::new();

    for m in mods
    {
        out.push_str(m.to_str());
        out.push(' ');
    }

    out
}

fn write_annotation(ann: &SmaliAnnotation, subannotation: bool, indent: &str) -> String
{
    let inset = "    ";

    let (mut out, end_tag) = if subannotation
    {
        (".subannotation ".to_string(), ".end subannotation")
    }
    else
    {
        (format!("{}.annotation {} ", indent, ann.visibility.to_str()), ".end annotation")
    };
    out.push_str(&ann.annotation_type.to_jni());
    out.push('\n');

    for i in &ann.elements
    {
        out.push_str(&format!("{}{}{} = ", indent, inset, i.name));
        match &i.value
        {
            AnnotationValue::Array(a) => {
                out.push_str("{\n");
                for (c, v) in a.iter().enumerate()
                {
                    for line in v.lines()
                    {
                        out.push_str(indent);
                        out.push_str(inset);
                        out.push_str(inset);
                        out.push_str(line);
                        out.push('\n');
                    }
                    if c + 1 < a.len()
                    {
                        // The separator goes after the element's last line
                        out.pop();
                        out.push_str(",\n");
                    }
                }
                out.push_str(&format!("{}{}}}\n", indent, inset));
            }
            AnnotationValue::SubAnnotation(s) => {
                let nested = format!("{}{}", indent, inset);
                out.push_str(&write_annotation(s, true, &nested));
            }
            AnnotationValue::Enum(o, s) => {
                out.push_str(&format!(".enum {}->{}:{}\n", o.as_jni_type(), s, o.as_jni_type()));
            }
            AnnotationValue::Single(s) => {
                out.push_str(s);
                out.push('\n');
            }
        }
    }

    out.push_str(indent);
    out.push_str(end_tag);
    out.push('\n');

    out
}

fn write_op(op: &SmaliOp) -> String
{
    match op
    {
        SmaliOp::Line(l) => format!("    .line {}\n", l),
        SmaliOp::Label(l) => format!("    {}\n", l),
        SmaliOp::Op(o) => format!("    {}\n\n", o),
        SmaliOp::Directive(d) => {
            let mut out = String::new();
            let last = d.lines().count().saturating_sub(1);
            for (n, line) in d.lines().enumerate()
            {
                // Inner lines of a block are indented one level further
                if n == 0 || n == last { out.push_str("    "); } else { out.push_str("        "); }
                out.push_str(line);
                out.push('\n');
            }
            out
        }
    }
}

fn write_method(method: &SmaliMethod) -> String
{
    let mut out = format!(".method {}", write_modifiers(&method.modifiers));
    if method.constructor { out.push_str("constructor "); }
    out.push_str(&format!("{}{}\n", method.name, method.signature.to_jni()));
    if let Some(locals) = method.locals
    {
        out.push_str(&format!("    .locals {}\n", locals));
    }

    for a in &method.annotations
    {
        out.push_str(&write_annotation(a, false, "    "));
    }

    for op in &method.ops
    {
        out.push_str(&write_op(op));
    }

    out.push_str(".end method\n\n");
    out
}

pub(crate) fn write_class(dex: &SmaliClass) -> String
{
    let mut out = format!(".class {}{}\n", write_modifiers(&dex.modifiers), dex.name.as_jni_type());
    if let Some(s) = &dex.super_class
    {
        out.push_str(&format!(".super {}\n", s.as_jni_type()));
    }
    if let Some(s) = &dex.source
    {
        out.push_str(&format!(".source \"{}\"\n", s));
    }

    if !dex.implements.is_empty()
    {
        out.push_str("\n# interfaces\n");
        for i in &dex.implements
        {
            out.push_str(".implements ");
            out.push_str(&i.as_jni_type());
            out.push('\n');
        }
    }

    if !dex.annotations.is_empty()
    {
        out.push_str("\n# annotations\n");
        for a in &dex.annotations
        {
            out.push_str(&write_annotation(a, false, ""));
            out.push('\n');
        }
    }

    if !dex.fields.is_empty()
    {
        out.push_str("\n# fields\n");
        for f in &dex.fields
        {
            out.push_str(&format!(".field {}{}:{}", write_modifiers(&f.modifiers), f.name, f.signature.to_jni()));
            if let Some(iv) = &f.initial_value
            {
                out.push_str(&format!(" = {}", iv));
            }
            out.push('\n');
            if !f.annotations.is_empty()
            {
                for a in &f.annotations { out.push_str(&write_annotation(a, false, "    ")); }
                out.push_str(".end field\n");
            }
            out.push('\n');
        }
    }

    if !dex.methods.is_empty()
    {
        out.push_str("\n# methods\n");
        for m in &dex.methods
        {
            out.push_str(&write_method(m));
        }
    }

    out
}
