//! # PointBridge CLI
//!
//! Read-only administrative queries over point declarations and stored state.

use anyhow::{bail, Context, Result};
use pointbridge_core::{
    PointDeclaration, PointId, PointRegistration, PointRegistry, PriorityState, RegistrationMeta,
};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::env;
use std::path::Path;

/// Owner recorded for declarations that do not name one.
const CONFIG_OWNER: &str = "config";

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "check" => {
            if args.len() < 4 {
                eprintln!("Usage: pointbridge check <points.json> <pointId> [ownerId]");
                std::process::exit(1);
            }
            let registry = load_registry(Path::new(&args[2]))?;
            let point_id: PointId = args[3]
                .parse()
                .with_context(|| format!("Invalid point id '{}'", args[3]))?;
            let check = registry.check(point_id, args.get(4).map(String::as_str));
            println!("{}", serde_json::to_string_pretty(&check)?);
        }
        "list" => {
            if args.len() < 3 {
                eprintln!("Usage: pointbridge list <points.json>");
                std::process::exit(1);
            }
            let registry = load_registry(Path::new(&args[2]))?;
            println!("{}", serde_json::to_string_pretty(&registry.list())?);
        }
        "state" => {
            if args.len() < 5 {
                eprintln!("Usage: pointbridge state <db> <store> <path>");
                std::process::exit(1);
            }
            let state = load_state(Path::new(&args[2]), &args[3], &args[4])?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        "registrations" => {
            if args.len() < 3 {
                eprintln!("Usage: pointbridge registrations <db>");
                std::process::exit(1);
            }
            let registrations = load_registrations(Path::new(&args[2]))?;
            println!("{}", serde_json::to_string_pretty(&registrations)?);
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Build a registry from a JSON array of point declarations.
///
/// Declarations are registered in file order, so a later declaration of an
/// id by another owner is reported and skipped.
fn load_registry(path: &Path) -> Result<PointRegistry> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let declarations: Vec<PointDeclaration> =
        serde_json::from_str(&raw).with_context(|| format!("Invalid declarations in {}", path.display()))?;

    let registry = PointRegistry::new(path.display().to_string());
    for declaration in declarations {
        let owner = declaration
            .owner_id
            .clone()
            .unwrap_or_else(|| CONFIG_OWNER.to_string());
        let mut meta = RegistrationMeta::writable(owner, declaration.store, declaration.path);
        if !declaration.writable {
            meta = meta.read_only();
        }
        if !registry.register(declaration.point_id, meta) {
            eprintln!("ID Conflict: point {} already declared by another owner", declaration.point_id);
        }
    }

    Ok(registry)
}

fn load_state(db: &Path, store: &str, key: &str) -> Result<PriorityState> {
    let conn = Connection::open_with_flags(db, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("Failed to open {}", db.display()))?;

    let json: Option<String> = conn
        .query_row(
            "SELECT state_json FROM priority_state WHERE namespace = ?1 AND key = ?2",
            (store, key),
            |row| row.get(0),
        )
        .optional()
        .context("Failed to query priority state")?;

    let Some(json) = json else {
        bail!("Point Not Found: no state for {store}/{key}");
    };
    serde_json::from_str(&json).with_context(|| format!("Point Not Found: unreadable state for {store}/{key}"))
}

/// Points an agent recorded as claimed, ordered by id.
fn load_registrations(db: &Path) -> Result<Vec<PointRegistration>> {
    let conn = Connection::open_with_flags(db, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("Failed to open {}", db.display()))?;

    let mut stmt = conn
        .prepare("SELECT point_id, owner_id, writable, store, path FROM registrations ORDER BY point_id ASC")
        .context("Failed to query registrations")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(PointRegistration {
                point_id: row.get(0)?,
                owner_id: row.get(1)?,
                writable: row.get(2)?,
                store: row.get(3)?,
                path: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("Failed to read registrations")?;

    Ok(rows)
}

fn print_help() {
    println!(
        r#"PointBridge CLI

USAGE:
    pointbridge <COMMAND> [OPTIONS]

COMMANDS:
    check <points.json> <pointId> [ownerId]  Show whether a point id can be claimed
    list <points.json>                       List registrations from a declaration file
    state <db> <store> <path>                Print the stored priority state
    registrations <db>                       List points recorded as claimed by an agent
    help                                     Show this help message

EXAMPLES:
    pointbridge check points.json 1 ctrlA
    pointbridge state ./pointbridge.db global zoneTemp
    pointbridge registrations ./pointbridge.db
"#
    );
}
