//! End to end permission removal: load, rewrite, write.

use crate::customizer::{Customizer, RewriteStats};
use crate::error::RmPermError;
use crate::module::{Module, ModuleCodec};
use crate::permissions::PermissionTable;
use crate::redirections::{CustomMethods, CustomMethodsLoader, MarkerAnnotations, RedirectionTable};
use log::info;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::rc::Rc;

/// Inputs of one removal run.
#[derive(Debug, Clone)]
pub struct RemovalConfig {
    /// Module to rewrite
    pub input: PathBuf,
    /// Where the rewritten module is written
    pub output: PathBuf,
    /// Permission table file
    pub permission_table: PathBuf,
    /// Replacement library modules
    pub custom_libraries: Vec<PathBuf>,
    /// Permissions whose replacement methods are used
    pub permissions: BTreeSet<String>,
    pub auto_remove_void: bool,
    pub markers: MarkerAnnotations,
}

/// What a removal run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovalReport {
    pub stats: RewriteStats,
    pub classes_written: usize,
    pub custom_classes: usize,
    pub redirections: usize,
}

/// Rewrites `target` with the redirections of `custom` and puts the replacement classes in
/// front of the target's own classes.
pub fn rewrite_module(
    target: &Module,
    custom: &CustomMethods,
    table: &PermissionTable,
    auto_remove_void: bool,
) -> Result<(Module, RewriteStats), RmPermError> {
    let target_names: HashSet<_> = target.classes.iter().map(|c| &c.name).collect();
    if let Some(clash) = custom.classes.iter().find(|c| target_names.contains(&c.name)) {
        fail!(
            "Class {} is defined by both the application and a replacement library",
            clash.name.as_jni_type()
        );
    }

    let redirections = RedirectionTable::from_custom_methods(custom);
    let (rewritten, stats) = Customizer::new(table, &redirections, auto_remove_void).customize(target);

    let mut classes: Vec<_> = custom.classes.iter().map(Rc::clone).collect();
    classes.extend(rewritten.classes);
    let module = Module {
        classes,
        api_level: target.api_level,
    };
    module.check_unique_names()?;
    Ok((module, stats))
}

pub fn remove_permissions<C: ModuleCodec>(config: &RemovalConfig, codec: &C) -> Result<RemovalReport, RmPermError> {
    let table = PermissionTable::read_from_file(&config.permission_table)?;

    let loader = CustomMethodsLoader::new(config.markers.clone());
    let mut custom = CustomMethods::default();
    for library in &config.custom_libraries {
        let module = codec.parse(library)?;
        loader
            .load_into(&module, &config.permissions, &mut custom)
            .map_err(|e| err!(e, context: "{}", library.display()))?;
    }
    info!(
        "Using {} redirections from {} custom classes",
        custom.redirection_count(),
        custom.classes.len()
    );

    let target = codec.parse(&config.input)?;
    let (output, stats) = rewrite_module(&target, &custom, &table, config.auto_remove_void)?;
    codec.write(&config.output, &output)?;

    Ok(RemovalReport {
        stats,
        classes_written: output.classes.len(),
        custom_classes: custom.classes.len(),
        redirections: custom.redirection_count(),
    })
}
