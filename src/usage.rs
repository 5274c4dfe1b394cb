//! Inventory of the permission-protected calls an application makes.

use crate::module::Module;
use crate::permissions::PermissionTable;
use crate::smali_ops::MethodRef;
use crate::types::SmaliOp;
use log::info;
use std::collections::BTreeMap;

/// Permission to gated callee to number of call sites.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PermissionUsage {
    pub permissions: BTreeMap<String, BTreeMap<MethodRef, usize>>,
}

impl PermissionUsage {
    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }

    /// Number of call sites needing `permission`.
    pub fn call_count(&self, permission: &str) -> usize {
        self.permissions
            .get(permission)
            .map(|callees| callees.values().sum())
            .unwrap_or(0)
    }
}

/// Counts every invocation, of any kind, whose callee appears in `table`. A call to a method
/// needing two permissions is counted under both.
pub fn scan_permission_usage(module: &Module, table: &PermissionTable) -> PermissionUsage {
    let mut usage = PermissionUsage::default();
    let mut sites = 0;
    let callees = module
        .classes
        .iter()
        .flat_map(|c| c.methods.iter())
        .flat_map(|m| m.ops.iter())
        .filter_map(|op| match op {
            SmaliOp::Op(o) => o.invoked_method(),
            _ => None,
        });
    for callee in callees {
        let Some(permissions) = table.get(callee) else {
            continue;
        };
        sites += 1;
        for permission in permissions {
            *usage
                .permissions
                .entry(permission.clone())
                .or_default()
                .entry(callee.clone())
                .or_default() += 1;
        }
    }
    info!("Found {} gated call sites needing {} permissions", sites, usage.permissions.len());
    usage
}
