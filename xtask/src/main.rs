//! xtask - Development automation for the journey engine
//!
//! Usage: cargo xtask <command>

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use xshell::{cmd, Shell};

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "journey engine development automation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run all checks (clippy, tests) - fast pre-commit validation
    Check {
        /// Also run database integration tests
        #[arg(long)]
        db: bool,
    },

    /// Run clippy with and without the postgres backend
    Clippy {
        /// Fix warnings automatically
        #[arg(long)]
        fix: bool,
    },

    /// Run tests
    Test {
        /// Run only lib tests (faster)
        #[arg(long)]
        lib: bool,
        /// Run database integration tests (needs DATABASE_URL)
        #[arg(long)]
        db: bool,
        /// Filter test name
        #[arg(long)]
        filter: Option<String>,
    },

    /// Format code
    Fmt {
        /// Check only, don't modify
        #[arg(long)]
        check: bool,
    },

    /// Build the admin CLI
    Build {
        /// Build in release mode
        #[arg(long)]
        release: bool,
    },

    /// Dump the live schema to schema_export.sql
    SchemaExport,

    /// Full CI pipeline (fmt, clippy, test, build)
    Ci,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;
    sh.change_dir(project_root()?);

    match cli.command {
        Command::Check { db } => check(&sh, db),
        Command::Clippy { fix } => clippy(&sh, fix),
        Command::Test { lib, db, filter } => test(&sh, lib, db, filter),
        Command::Fmt { check } => fmt(&sh, check),
        Command::Build { release } => build(&sh, release),
        Command::SchemaExport => schema_export(&sh),
        Command::Ci => ci(&sh),
    }
}

fn project_root() -> Result<std::path::PathBuf> {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").context("CARGO_MANIFEST_DIR not set")?;
    let path = std::path::PathBuf::from(manifest_dir);
    // xtask sits one level below the workspace root
    path.parent()
        .map(|p| p.to_path_buf())
        .context("xtask has no parent directory")
}

fn check(sh: &Shell, db: bool) -> Result<()> {
    println!("Running checks...");

    println!("  Checking compilation...");
    cmd!(sh, "cargo check --workspace --all-features").run()?;

    println!("  Running clippy...");
    cmd!(sh, "cargo clippy --workspace --all-features -- -D warnings").run()?;

    println!("  Running tests...");
    test(sh, false, db, None)?;

    println!("All checks passed!");
    Ok(())
}

fn clippy(sh: &Shell, fix: bool) -> Result<()> {
    // Memory-only build, then with the postgres store compiled in.
    let variants: [&[&str]; 2] = [&[], &["--features", "database"]];

    for extra in variants {
        println!("Clippy for journey_core {}...", extra.join(" "));
        if fix {
            cmd!(sh, "cargo clippy -p journey_core {extra...} --fix --allow-dirty").run()?;
        } else {
            cmd!(sh, "cargo clippy -p journey_core {extra...} -- -D warnings").run()?;
        }
    }
    cmd!(sh, "cargo clippy -p journey_cli -- -D warnings").run()?;

    println!("Clippy clean!");
    Ok(())
}

fn test(sh: &Shell, lib: bool, db: bool, filter: Option<String>) -> Result<()> {
    let mut args = vec!["test", "-p", "journey_core"];
    if lib {
        args.push("--lib");
    }
    let filter_args: Vec<String> = filter.into_iter().flat_map(|f| ["--".to_string(), f]).collect();
    cmd!(sh, "cargo {args...} {filter_args...}").run()?;

    if db {
        if std::env::var("DATABASE_URL").is_err() {
            anyhow::bail!("--db needs DATABASE_URL");
        }
        println!("Running database integration tests...");
        cmd!(
            sh,
            "cargo test -p journey_core --features database --test postgres_store_integration"
        )
        .run()?;
    }
    Ok(())
}

fn fmt(sh: &Shell, check: bool) -> Result<()> {
    if check {
        cmd!(sh, "cargo fmt --all --check").run()?;
    } else {
        cmd!(sh, "cargo fmt --all").run()?;
    }
    Ok(())
}

fn build(sh: &Shell, release: bool) -> Result<()> {
    println!("Building journey-admin...");
    if release {
        cmd!(sh, "cargo build --release -p journey_cli").run()?;
    } else {
        cmd!(sh, "cargo build -p journey_cli").run()?;
    }
    Ok(())
}

fn schema_export(sh: &Shell) -> Result<()> {
    let url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    println!("Exporting database schema...");
    cmd!(
        sh,
        "pg_dump -d {url} --schema-only --no-owner --no-privileges -f schema_export.sql"
    )
    .run()?;
    println!("Schema exported to schema_export.sql");
    Ok(())
}

fn ci(sh: &Shell) -> Result<()> {
    println!("Running full CI pipeline...");

    println!("\n=== Format Check ===");
    fmt(sh, true)?;

    println!("\n=== Clippy ===");
    clippy(sh, false)?;

    println!("\n=== Tests ===");
    test(sh, false, false, None)?;

    println!("\n=== Build ===");
    build(sh, false)?;

    println!("\nCI pipeline passed!");
    Ok(())
}
