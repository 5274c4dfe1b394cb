//! rmperm: removes permission-protected API calls from a decoded Android application.
//!
//! ```bash
//! # Redirect location calls to a replacement library and drop every other gated void call
//! rmperm remove -i app/smali -o out/smali -t permissions.txt -c custom/smali \
//!     -p android.permission.ACCESS_FINE_LOCATION
//!
//! # List the gated calls an application makes
//! rmperm list -i app/smali -t permissions.txt
//! ```

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use log::LevelFilter;
use rmperm::module::{ModuleCodec, SmaliDirectoryCodec};
use rmperm::permissions::PermissionTable;
use rmperm::pipeline::{remove_permissions, RemovalConfig};
use rmperm::redirections::MarkerAnnotations;
use rmperm::usage::scan_permission_usage;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "rmperm", author, version, about = "Remove permission-protected API calls from smali code")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// More output: -v for progress, -vv for every call site
    #[arg(long, short, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Rewrite an application so it no longer calls APIs gated by the given permissions
    Remove {
        /// Smali directory of the application
        #[arg(short, long)]
        input: PathBuf,

        /// Directory the rewritten smali is written to
        #[arg(short, long)]
        output: PathBuf,

        /// Permission table mapping API methods to the permissions they need
        #[arg(short = 't', long)]
        permission_table: PathBuf,

        /// Smali directory of a replacement library, may be repeated
        #[arg(short = 'c', long = "custom")]
        custom_libraries: Vec<PathBuf>,

        /// Permission to remove, may be repeated
        #[arg(short, long = "permission", required = true)]
        permissions: Vec<String>,

        /// Keep gated calls returning void that have no replacement
        #[arg(long)]
        no_auto_remove_void: bool,

        /// Write a JSON report of the run
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Show which gated APIs an application calls, per permission
    List {
        /// Smali directory of the application
        #[arg(short, long)]
        input: PathBuf,

        /// Permission table mapping API methods to the permissions they need
        #[arg(short = 't', long)]
        permission_table: PathBuf,
    },
}

const EXIT_UNRESOLVED: u8 = 2;

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .parse_default_env()
        .init();
}

fn run(command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Remove {
            input,
            output,
            permission_table,
            custom_libraries,
            permissions,
            no_auto_remove_void,
            report,
        } => {
            let config = RemovalConfig {
                input,
                output,
                permission_table,
                custom_libraries,
                permissions: permissions.into_iter().collect(),
                auto_remove_void: !no_auto_remove_void,
                markers: MarkerAnnotations::default(),
            };
            let result = remove_permissions(&config, &SmaliDirectoryCodec::default())?;

            if let Some(path) = report {
                let json = serde_json::to_string_pretty(&result)?;
                fs::write(&path, json).with_context(|| format!("writing report {}", path.display()))?;
            }

            let stats = result.stats;
            println!(
                "{} redirected, {} removed, {} unresolved; {} classes written to {}",
                stats.redirected,
                stats.removed,
                stats.unresolved,
                result.classes_written,
                config.output.display()
            );
            if stats.is_clean() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(EXIT_UNRESOLVED))
            }
        }
        Commands::List { input, permission_table } => {
            let table = PermissionTable::read_from_file(&permission_table)?;
            let module = SmaliDirectoryCodec::default().parse(&input)?;
            let usage = scan_permission_usage(&module, &table);
            if usage.is_empty() {
                println!("No permission-protected calls found");
            }
            for (permission, callees) in &usage.permissions {
                println!("{} ({} calls)", permission, usage.call_count(permission));
                for (callee, count) in callees {
                    println!("    {count:>4}  {callee}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
