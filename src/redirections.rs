//! Discovery of replacement methods in a replacement library.
//!
//! A replacement library is an ordinary module whose classes opt in with a class marker
//! annotation. Inside those classes, every public static method carrying the method marker
//! annotation replaces one framework method:
//!
//! ```text
//! .class public Lcom/example/custom/Location;
//! .annotation runtime Lit/unige/dibris/rmperm/annotations/CustomMethodClass;
//! .end annotation
//!
//! .method public static getLastKnownLocation(Landroid/location/LocationManager;Ljava/lang/String;)Landroid/location/Location;
//!     .annotation runtime Lit/unige/dibris/rmperm/annotations/MethodPermission;
//!         defClass = "android.location.LocationManager"
//!         permission = "android.permission.ACCESS_FINE_LOCATION"
//!     .end annotation
//! ```
//!
//! The first parameter stands for the receiver of the original instance call, so the call
//! `invoke-virtual {v1, v0}, LocationManager;->getLastKnownLocation(String)` can become
//! `invoke-static {v1, v0}, Location;->getLastKnownLocation(LocationManager, String)`.

use crate::error::RmPermError;
use crate::module::Module;
use crate::smali_ops::MethodRef;
use crate::types::{MethodSignature, SmaliAnnotation, SmaliClass, SmaliMethod, TypeSignature};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;

pub const CUSTOM_METHOD_CLASS_ANNOTATION: &str = "Lit/unige/dibris/rmperm/annotations/CustomMethodClass;";
pub const METHOD_PERMISSION_ANNOTATION: &str = "Lit/unige/dibris/rmperm/annotations/MethodPermission;";
const PERMISSION_ELEMENT: &str = "permission";
const DEFINING_CLASS_ELEMENT: &str = "defClass";

/// Descriptors of the two marker annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerAnnotations {
    pub class_marker: String,
    pub method_marker: String,
}

impl Default for MarkerAnnotations {
    fn default() -> Self {
        MarkerAnnotations {
            class_marker: CUSTOM_METHOD_CLASS_ANNOTATION.to_string(),
            method_marker: METHOD_PERMISSION_ANNOTATION.to_string(),
        }
    }
}

/// One replacement: calls to `original` become static calls to `replacement`, whose first
/// parameter is the receiver `original` was invoked on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodRedirection {
    pub original: MethodRef,
    pub replacement: MethodRef,
}

impl fmt::Display for MethodRedirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.original, self.replacement)
    }
}

/// Everything taken from the replacement libraries: the classes to ship with the rewritten
/// application and, per permission, the redirections they provide.
#[derive(Debug, Default, Clone)]
pub struct CustomMethods {
    pub classes: Vec<Rc<SmaliClass>>,
    pub redirections: BTreeMap<String, BTreeSet<MethodRedirection>>,
}

impl CustomMethods {
    pub fn redirection_count(&self) -> usize {
        self.redirections.values().map(BTreeSet::len).sum()
    }
}

/// The payload of a method marker.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PermissionMarker {
    permission: String,
    def_class: TypeSignature,
}

/// A marked method found during the first pass.
struct AnnotatedMethod<'a> {
    class: &'a SmaliClass,
    method: &'a SmaliMethod,
    annotation: &'a SmaliAnnotation,
}

impl AnnotatedMethod<'_> {
    fn full_name(&self) -> String {
        format!("{}->{}", self.class.name.as_jni_type(), self.method.name)
    }
}

fn extract_marker(annotation: &SmaliAnnotation) -> Result<PermissionMarker, RmPermError> {
    let mut permission = None;
    let mut def_class = None;
    for element in &annotation.elements {
        let value = match element.value.as_string() {
            Some(v) => v,
            None => fail!("Element {} of {} is not a string", element.name, annotation.annotation_type),
        };
        match element.name.as_str() {
            PERMISSION_ELEMENT => permission = Some(value),
            DEFINING_CLASS_ELEMENT => def_class = Some(TypeSignature::from_java(&value)?),
            other => fail!("Unexpected element {} in {}", other, annotation.annotation_type),
        }
    }
    match (permission, def_class) {
        (Some(permission), Some(def_class)) => Ok(PermissionMarker { permission, def_class }),
        _ => Err(err!(
            "{} needs both a {} and a {} element",
            annotation.annotation_type,
            PERMISSION_ELEMENT,
            DEFINING_CLASS_ELEMENT
        )),
    }
}

/// Builds the redirection for a marked method, or None (with a warning) when its signature
/// cannot stand in for an instance method of `def_class`.
fn create_redirection(found: &AnnotatedMethod, def_class: &TypeSignature) -> Option<MethodRedirection> {
    let args = &found.method.signature.args;
    let Some(receiver) = args.first() else {
        warn!("Ignoring {} because its signature is missing the receiver parameter", found.full_name());
        return None;
    };
    if receiver != def_class {
        warn!(
            "Ignoring {} because its receiver parameter has type {} instead of {}",
            found.full_name(),
            receiver,
            def_class
        );
        return None;
    }
    let result = found.method.signature.result.clone();
    let original = MethodRef {
        class: def_class.to_jni(),
        name: found.method.name.clone(),
        signature: MethodSignature {
            args: args[1..].to_vec(),
            result: result.clone(),
        },
    };
    let replacement = MethodRef {
        class: found.class.name.as_jni_type(),
        name: found.method.name.clone(),
        signature: MethodSignature {
            args: args.clone(),
            result,
        },
    };
    Some(MethodRedirection { original, replacement })
}

#[derive(Debug, Default, Clone)]
pub struct CustomMethodsLoader {
    markers: MarkerAnnotations,
}

impl CustomMethodsLoader {
    pub fn new(markers: MarkerAnnotations) -> CustomMethodsLoader {
        CustomMethodsLoader { markers }
    }

    /// Loads a single replacement library.
    pub fn build(&self, module: &Module, requested: &BTreeSet<String>) -> Result<CustomMethods, RmPermError> {
        let mut custom = CustomMethods::default();
        self.load_into(module, requested, &mut custom)?;
        Ok(custom)
    }

    /// Adds the marked classes and the redirections for `requested` permissions found in
    /// `module` to `custom`. Only a malformed marker payload is an error; anything else that
    /// is unusable is skipped with a warning.
    pub fn load_into(
        &self,
        module: &Module,
        requested: &BTreeSet<String>,
        custom: &mut CustomMethods,
    ) -> Result<(), RmPermError> {
        let classes = self.annotated_classes(module);
        let before = custom.redirection_count();

        // First pass: collect and decode every marker
        let mut markers = vec![];
        for found in self.annotated_methods(&classes) {
            let marker = extract_marker(found.annotation).map_err(|e| err!(e, context: "{}", found.full_name()))?;
            markers.push((found, marker));
        }

        // Second pass: validate and fold into the per-permission sets
        for (found, marker) in &markers {
            let Some(redirection) = create_redirection(found, &marker.def_class) else {
                continue;
            };
            if !requested.contains(&marker.permission) {
                debug!("[{}] Skipping redirection {}", marker.permission, redirection);
                continue;
            }
            debug!("[{}] Adding redirection {}", marker.permission, redirection);
            custom
                .redirections
                .entry(marker.permission.clone())
                .or_default()
                .insert(redirection);
        }

        info!(
            "Loaded {} custom classes and {} redirections",
            classes.len(),
            custom.redirection_count() - before
        );
        custom.classes.extend(classes);
        Ok(())
    }

    fn annotated_classes(&self, module: &Module) -> Vec<Rc<SmaliClass>> {
        let mut result = vec![];
        for class in &module.classes {
            if !class.annotations.iter().any(|a| a.is_type(&self.markers.class_marker)) {
                continue;
            }
            if class.is_public() {
                result.push(Rc::clone(class));
            } else {
                warn!("Ignoring class {} because it is not public", class.name.as_jni_type());
            }
        }
        result
    }

    fn annotated_methods<'a>(&self, classes: &'a [Rc<SmaliClass>]) -> Vec<AnnotatedMethod<'a>> {
        let mut result = vec![];
        for class in classes {
            for method in &class.methods {
                let Some(annotation) = method.annotations.iter().find(|a| a.is_type(&self.markers.method_marker)) else {
                    continue;
                };
                let found = AnnotatedMethod { class: class.as_ref(), method, annotation };
                if method.is_public() && method.is_static() {
                    result.push(found);
                } else {
                    warn!("Ignoring method {} because it is not static and public", found.full_name());
                }
            }
        }
        result
    }
}

/// The merged lookup used while rewriting: original method to replacement.
#[derive(Debug, Default, Clone)]
pub struct RedirectionTable {
    redirections: HashMap<MethodRef, MethodRef>,
}

impl RedirectionTable {
    pub fn new() -> RedirectionTable {
        RedirectionTable::default()
    }

    /// Merges the per-permission redirections. Permissions are visited in sorted order; when
    /// two of them redirect the same method differently the first one wins.
    pub fn from_custom_methods(custom: &CustomMethods) -> RedirectionTable {
        let mut merged: BTreeMap<&MethodRef, (&str, &MethodRef)> = BTreeMap::new();
        for (permission, redirections) in &custom.redirections {
            for r in redirections {
                match merged.entry(&r.original) {
                    Entry::Vacant(e) => {
                        e.insert((permission.as_str(), &r.replacement));
                    }
                    Entry::Occupied(e) => {
                        let (kept_permission, kept) = *e.get();
                        if kept != &r.replacement {
                            warn!(
                                "Conflicting redirections for {}: keeping {} ({}), dropping {} ({})",
                                r.original, kept, kept_permission, r.replacement, permission
                            );
                        }
                    }
                }
            }
        }

        let mut table = RedirectionTable::new();
        for (original, (_, replacement)) in merged {
            table.insert(original.clone(), replacement.clone());
        }
        table
    }

    pub fn insert(&mut self, original: MethodRef, replacement: MethodRef) {
        self.redirections.insert(original, replacement);
    }

    pub fn get(&self, original: &MethodRef) -> Option<&MethodRef> {
        self.redirections.get(original)
    }

    pub fn len(&self) -> usize {
        self.redirections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.redirections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOC: &str = "LOC";

    fn replacement_library(class_modifiers: &str, method_modifiers: &str, params: &str, elements: &str) -> Module {
        let smali = format!(
            r#".class {class_modifiers} Lcom/example/Replacement;
.super Ljava/lang/Object;

.annotation runtime Lit/unige/dibris/rmperm/annotations/CustomMethodClass;
.end annotation

.method {method_modifiers} track({params})V
    .locals 0
    .annotation runtime Lit/unige/dibris/rmperm/annotations/MethodPermission;
{elements}
    .end annotation

    return-void
.end method

.method public static helper()V
    .locals 0
    return-void
.end method
"#
        );
        Module::from_classes(vec![SmaliClass::from_smali(&smali).unwrap()])
    }

    fn standard_elements() -> &'static str {
        "        defClass = \"foo.Bar\"\n        permission = \"LOC\""
    }

    fn requested(perms: &[&str]) -> BTreeSet<String> {
        perms.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn builds_redirection_for_requested_permission() {
        let module = replacement_library("public", "public static", "Lfoo/Bar;I", standard_elements());
        let custom = CustomMethodsLoader::default().build(&module, &requested(&[LOC])).unwrap();
        assert_eq!(custom.classes.len(), 1);
        assert!(Rc::ptr_eq(&custom.classes[0], &module.classes[0]));

        let redirections = &custom.redirections[LOC];
        assert_eq!(redirections.len(), 1);
        let r = redirections.iter().next().unwrap();
        assert_eq!(r.original, MethodRef::new("Lfoo/Bar;", "track", vec![TypeSignature::Int], TypeSignature::Void));
        assert_eq!(
            r.replacement,
            MethodRef::new(
                "Lcom/example/Replacement;",
                "track",
                vec![TypeSignature::from_jni("Lfoo/Bar;").unwrap(), TypeSignature::Int],
                TypeSignature::Void
            )
        );

        let table = RedirectionTable::from_custom_methods(&custom);
        assert_eq!(table.get(&r.original), Some(&r.replacement));
    }

    #[test]
    fn unrequested_permission_adds_nothing_but_keeps_class() {
        let module = replacement_library("public", "public static", "Lfoo/Bar;I", standard_elements());
        let custom = CustomMethodsLoader::default().build(&module, &requested(&[])).unwrap();
        assert_eq!(custom.redirection_count(), 0);
        assert_eq!(custom.classes.len(), 1);
        assert!(RedirectionTable::from_custom_methods(&custom).is_empty());
    }

    #[test]
    fn non_public_class_is_skipped() {
        let module = replacement_library("final", "public static", "Lfoo/Bar;I", standard_elements());
        let custom = CustomMethodsLoader::default().build(&module, &requested(&[LOC])).unwrap();
        assert!(custom.classes.is_empty());
        assert_eq!(custom.redirection_count(), 0);
    }

    #[test]
    fn non_static_method_is_skipped() {
        let module = replacement_library("public", "public", "Lfoo/Bar;I", standard_elements());
        let custom = CustomMethodsLoader::default().build(&module, &requested(&[LOC])).unwrap();
        assert_eq!(custom.classes.len(), 1);
        assert_eq!(custom.redirection_count(), 0);
    }

    #[test]
    fn missing_or_wrong_receiver_is_skipped() {
        for params in ["", "Lfoo/Baz;I", "I"] {
            let module = replacement_library("public", "public static", params, standard_elements());
            let custom = CustomMethodsLoader::default().build(&module, &requested(&[LOC])).unwrap();
            assert_eq!(custom.redirection_count(), 0, "params {params}");
        }
    }

    #[test]
    fn malformed_marker_is_fatal() {
        let unknown = "        defClass = \"foo.Bar\"\n        permission = \"LOC\"\n        reason = \"x\"";
        let missing = "        permission = \"LOC\"";
        let not_a_string = "        defClass = \"foo.Bar\"\n        permission = 0x1";
        for elements in [unknown, missing, not_a_string] {
            let module = replacement_library("public", "public static", "Lfoo/Bar;I", elements);
            let e = CustomMethodsLoader::default().build(&module, &requested(&[LOC])).unwrap_err();
            assert!(e.to_string().contains("Lcom/example/Replacement;->track"), "{e}");
        }
    }

    #[test]
    fn custom_markers() {
        let smali = r#".class public Lcom/example/Other;
.super Ljava/lang/Object;
.annotation runtime Lcom/example/Replaces;
.end annotation

.method public static vibrate(Landroid/os/Vibrator;J)V
    .locals 0
    .annotation runtime Lcom/example/Gated;
        permission = "android.permission.VIBRATE"
        defClass = "android.os.Vibrator"
    .end annotation
    return-void
.end method
"#;
        let module = Module::from_classes(vec![SmaliClass::from_smali(smali).unwrap()]);
        let perms = requested(&["android.permission.VIBRATE"]);
        assert_eq!(CustomMethodsLoader::default().build(&module, &perms).unwrap().classes.len(), 0);

        let loader = CustomMethodsLoader::new(MarkerAnnotations {
            class_marker: "Lcom/example/Replaces;".to_string(),
            method_marker: "Lcom/example/Gated;".to_string(),
        });
        assert_eq!(loader.build(&module, &perms).unwrap().redirection_count(), 1);
    }

    #[test]
    fn merge_keeps_first_permission_on_conflict() {
        let original = MethodRef::from_smali("Lfoo/Bar;->track(I)V").unwrap();
        let first = MethodRef::from_smali("La/First;->track(Lfoo/Bar;I)V").unwrap();
        let second = MethodRef::from_smali("Lb/Second;->track(Lfoo/Bar;I)V").unwrap();
        let mut custom = CustomMethods::default();
        custom.redirections.entry("B".to_string()).or_default().insert(MethodRedirection {
            original: original.clone(),
            replacement: second,
        });
        custom.redirections.entry("A".to_string()).or_default().insert(MethodRedirection {
            original: original.clone(),
            replacement: first.clone(),
        });
        let table = RedirectionTable::from_custom_methods(&custom);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&original), Some(&first));
    }

    #[test]
    fn libraries_accumulate() {
        let module = replacement_library("public", "public static", "Lfoo/Bar;I", standard_elements());
        let loader = CustomMethodsLoader::default();
        let mut custom = CustomMethods::default();
        loader.load_into(&module, &requested(&[LOC]), &mut custom).unwrap();
        loader.load_into(&module, &requested(&[LOC]), &mut custom).unwrap();
        assert_eq!(custom.classes.len(), 2);
        assert_eq!(custom.redirection_count(), 1);
    }

    #[test]
    fn methods_with_debug_parameter_names() {
        let smali = r#".class public Lcom/example/custom/Location;
.super Ljava/lang/Object;
.source "Location.java"


# annotations
.annotation runtime Lit/unige/dibris/rmperm/annotations/CustomMethodClass;
.end annotation


# direct methods
.method public static getLastKnownLocation(Landroid/location/LocationManager;Ljava/lang/String;)Landroid/location/Location;
    .locals 1
    .param p0, "lm"    # Landroid/location/LocationManager;
    .param p1, "provider"    # Ljava/lang/String;
    .annotation runtime Lit/unige/dibris/rmperm/annotations/MethodPermission;
        defClass = "android.location.LocationManager"
        permission = "android.permission.ACCESS_FINE_LOCATION"
    .end annotation

    .line 14
    const/4 v0, 0x0

    return-object v0
.end method

.method public static requestSingleUpdate(Landroid/location/LocationManager;Ljava/lang/String;Landroid/location/LocationListener;Landroid/os/Looper;)V
    .locals 0
    .param p0, "lm"    # Landroid/location/LocationManager;
    .param p1, "provider"    # Ljava/lang/String;
    .param p2    # Landroid/location/LocationListener;
        .annotation build Landroidx/annotation/NonNull;
        .end annotation
    .end param
    .param p3, "looper"    # Landroid/os/Looper;
    .annotation runtime Lit/unige/dibris/rmperm/annotations/MethodPermission;
        defClass = "android.location.LocationManager"
        permission = "android.permission.ACCESS_FINE_LOCATION"
    .end annotation

    .line 20
    return-void
.end method
"#;
        let module = Module::from_classes(vec![SmaliClass::from_smali(smali).unwrap()]);
        let perms = requested(&["android.permission.ACCESS_FINE_LOCATION"]);
        let custom = CustomMethodsLoader::default().build(&module, &perms).unwrap();
        assert_eq!(custom.redirection_count(), 2);

        let table = RedirectionTable::from_custom_methods(&custom);
        let original = MethodRef::from_smali(
            "Landroid/location/LocationManager;->requestSingleUpdate(Ljava/lang/String;Landroid/location/LocationListener;Landroid/os/Looper;)V",
        )
        .unwrap();
        assert_eq!(table.get(&original).map(|m| m.class.as_str()), Some("Lcom/example/custom/Location;"));
    }
}
