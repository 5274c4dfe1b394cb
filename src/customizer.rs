//! The instruction rewriter.
//!
//! Every `invoke-virtual` whose callee is protected by a permission is either redirected to a
//! static replacement method, deleted when it returns nothing, or reported as unresolved.

use crate::module::Module;
use crate::permissions::PermissionTable;
use crate::redirections::RedirectionTable;
use crate::smali_ops::{DexOp, MethodRef};
use crate::types::{SmaliClass, SmaliMethod, SmaliOp};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::rc::Rc;

/// Call site counters for one rewrite.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteStats {
    pub redirected: usize,
    pub removed: usize,
    pub unresolved: usize,
}

impl RewriteStats {
    /// True when no gated call site was left in place.
    pub fn is_clean(&self) -> bool {
        self.unresolved == 0
    }
}

enum CallSite {
    Unchanged,
    Replaced(DexOp),
    Removed,
}

fn join_permissions(permissions: &BTreeSet<String>) -> String {
    permissions.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

/// The static call that takes the place of an instance call, with the receiver passed as the
/// first argument in the same register.
fn static_call(op: &DexOp, replacement: &MethodRef) -> Option<DexOp> {
    match op {
        DexOp::InvokeVirtual { registers, .. } => Some(DexOp::InvokeStatic {
            registers: registers.clone(),
            method: replacement.clone(),
        }),
        DexOp::InvokeVirtualRange { range, .. } => Some(DexOp::InvokeStaticRange {
            range: range.clone(),
            method: replacement.clone(),
        }),
        _ => None,
    }
}

pub struct Customizer<'a> {
    permissions: &'a PermissionTable,
    redirections: &'a RedirectionTable,
    auto_remove_void: bool,
}

impl<'a> Customizer<'a> {
    pub fn new(
        permissions: &'a PermissionTable,
        redirections: &'a RedirectionTable,
        auto_remove_void: bool,
    ) -> Customizer<'a> {
        Customizer {
            permissions,
            redirections,
            auto_remove_void,
        }
    }

    /// Rewrites every class of `module`. Classes without a rewritten call site are shared with
    /// the input module.
    pub fn customize(&self, module: &Module) -> (Module, RewriteStats) {
        let mut stats = RewriteStats::default();
        let classes = module
            .classes
            .iter()
            .map(|class| self.customize_class(class, &mut stats))
            .collect();

        let summary = format!(
            "{} calls redirected, {} calls removed, {} calls unresolved",
            stats.redirected, stats.removed, stats.unresolved
        );
        if stats.is_clean() {
            info!("{}", summary);
        } else {
            error!("{}", summary);
        }

        let module = Module {
            classes,
            api_level: module.api_level,
        };
        (module, stats)
    }

    fn customize_class(&self, class: &Rc<SmaliClass>, stats: &mut RewriteStats) -> Rc<SmaliClass> {
        let mut methods: Option<Vec<SmaliMethod>> = None;
        for (i, method) in class.methods.iter().enumerate() {
            let rewritten = match method.has_body() {
                true => self.customize_method(class, method, stats),
                false => None,
            };
            match (rewritten, methods.as_mut()) {
                (Some(m), Some(ms)) => ms.push(m),
                (Some(m), None) => {
                    let mut ms = class.methods[..i].to_vec();
                    ms.push(m);
                    methods = Some(ms);
                }
                (None, Some(ms)) => ms.push(method.clone()),
                (None, None) => {}
            }
        }

        match methods {
            None => Rc::clone(class),
            Some(methods) => Rc::new(SmaliClass {
                name: class.name.clone(),
                modifiers: class.modifiers.clone(),
                source: class.source.clone(),
                super_class: class.super_class.clone(),
                implements: class.implements.clone(),
                annotations: class.annotations.clone(),
                fields: class.fields.clone(),
                methods,
            }),
        }
    }

    /// Returns the rewritten method, or None if its body did not change.
    fn customize_method(&self, class: &SmaliClass, method: &SmaliMethod, stats: &mut RewriteStats) -> Option<SmaliMethod> {
        let caller = format!("{}->{}{}", class.name.as_jni_type(), method.name, method.signature.to_jni());
        let mut ops: Option<Vec<SmaliOp>> = None;

        for (i, op) in method.ops.iter().enumerate() {
            let site = match op {
                SmaliOp::Op(dex_op) => self.customize_call_site(&caller, dex_op, stats),
                _ => CallSite::Unchanged,
            };
            match site {
                CallSite::Unchanged => {
                    if let Some(ops) = ops.as_mut() {
                        ops.push(op.clone());
                    }
                }
                CallSite::Replaced(new_op) => ops
                    .get_or_insert_with(|| method.ops[..i].to_vec())
                    .push(SmaliOp::Op(new_op)),
                CallSite::Removed => {
                    ops.get_or_insert_with(|| method.ops[..i].to_vec());
                }
            }
        }

        ops.map(|ops| SmaliMethod {
            name: method.name.clone(),
            modifiers: method.modifiers.clone(),
            constructor: method.constructor,
            signature: method.signature.clone(),
            locals: method.locals,
            annotations: method.annotations.clone(),
            ops,
        })
    }

    fn customize_call_site(&self, caller: &str, op: &DexOp, stats: &mut RewriteStats) -> CallSite {
        let callee = match op {
            DexOp::InvokeVirtual { method, .. } | DexOp::InvokeVirtualRange { method, .. } => method,
            _ => return CallSite::Unchanged,
        };
        let Some(permissions) = self.permissions.get(callee) else {
            return CallSite::Unchanged;
        };
        debug!("{}: call to {} requires {}", caller, callee, join_permissions(permissions));

        if let Some(replacement) = self.redirections.get(callee) {
            if let Some(new_op) = static_call(op, replacement) {
                debug!("{}: redirecting {} to {}", caller, callee, replacement);
                stats.redirected += 1;
                return CallSite::Replaced(new_op);
            }
        }

        if self.auto_remove_void && callee.returns_void() {
            debug!("{}: removing call to {}", caller, callee);
            stats.removed += 1;
            return CallSite::Removed;
        }

        error!(
            "{}: no replacement for {} which requires {}",
            caller,
            callee,
            join_permissions(permissions)
        );
        stats.unresolved += 1;
        CallSite::Unchanged
    }
}
