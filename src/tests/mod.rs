mod pipeline_cases;

#[cfg(test)]
mod tests {
    use crate::smali_ops::{DexOp, MethodRef};
    use crate::types::{MethodSignature, ObjectIdentifier, SmaliClass, SmaliOp, TypeSignature};

    #[test]
    fn object_identifier_to_java() {
        let o = ObjectIdentifier::from_jni_type("Lcom/basic/Test;");
        assert_eq!(o.as_jni_type(), "Lcom/basic/Test;");
        assert_eq!(o.as_java_type(), "com.basic.Test");
    }

    #[test]
    fn signatures() {
        let t = TypeSignature::Bool;
        assert_eq!(t.to_jni(), "Z");
        let m = MethodSignature::from_jni("([I)V").unwrap();
        assert_eq!(m.result, TypeSignature::Void);
        assert_eq!(m.args, vec![TypeSignature::Array(Box::new(TypeSignature::Int))]);
    }

    #[test]
    fn call_site_matches_table_key() {
        let smali = r#".class public Lcom/example/Main;
.super Ljava/lang/Object;

.method public run(Landroid/hardware/Camera;)V
    .registers 3
    .prologue
    invoke-virtual {p1}, Landroid/hardware/Camera;->startPreview()V
    return-void
.end method
"#;
        let class = SmaliClass::from_smali(smali).unwrap();
        let key = MethodRef::new("Landroid/hardware/Camera;", "startPreview", vec![], TypeSignature::Void);
        let found = class.methods[0].ops.iter().any(|op| match op {
            SmaliOp::Op(o @ DexOp::InvokeVirtual { .. }) => o.invoked_method() == Some(&key),
            _ => false,
        });
        assert!(found);
    }
}
