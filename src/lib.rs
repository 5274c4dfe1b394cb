//! # rmperm
//!
//! Removes calls to permission-protected Android APIs from decompiled (smali) applications.
//!
//! Each `invoke-virtual` of a gated framework method is either redirected to a static method
//! from a replacement library, deleted when the method returns nothing, or reported as
//! unresolved.
//!
//! ```no_run
//!  use rmperm::module::{ModuleCodec, SmaliDirectoryCodec};
//!  use rmperm::permissions::PermissionTable;
//!  use rmperm::usage::scan_permission_usage;
//!  use std::path::Path;
//!
//!  let table = PermissionTable::read_from_file(Path::new("permissions.txt")).unwrap();
//!  let module = SmaliDirectoryCodec::default().parse(Path::new("app/smali")).unwrap();
//!  for (permission, callees) in scan_permission_usage(&module, &table).permissions {
//!      println!("{}: {} APIs", permission, callees.len());
//!  }
//! ```

#[macro_use]
pub mod error;

pub mod customizer;
pub mod module;
pub mod permissions;
pub mod pipeline;
pub mod redirections;
pub mod smali_ops;
mod smali_parse;
mod smali_write;
mod tests;
pub mod types;
pub mod usage;

pub use error::RmPermError;
