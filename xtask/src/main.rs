//! Workspace automation for keel.
//!
//! Run with `cargo xtask <command>`. Live PostgreSQL tests read their
//! connection settings from `KEEL_TEST_DB_*` variables.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use xshell::{Shell, cmd};

#[derive(Parser)]
#[command(name = "xtask", about = "Workspace automation for keel")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format check, lints, feature matrix and tests
    Ci,
    /// Check formatting
    Fmt,
    /// Clippy over every target, warnings denied
    Clippy,
    /// Build the pool and migration crates without the postgres backend
    Features,
    /// Run the offline test suite
    Test,
    /// Run the ignored tests against a live PostgreSQL server
    TestLive,
    /// Build API documentation
    Doc,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;
    sh.change_dir(workspace_root()?);

    match cli.command {
        Command::Ci => {
            fmt(&sh)?;
            clippy(&sh)?;
            features(&sh)?;
            test(&sh)?;
            println!("ci: ok");
        }
        Command::Fmt => fmt(&sh)?,
        Command::Clippy => clippy(&sh)?,
        Command::Features => features(&sh)?,
        Command::Test => test(&sh)?,
        Command::TestLive => test_live(&sh)?,
        Command::Doc => doc(&sh)?,
    }

    Ok(())
}

fn workspace_root() -> Result<PathBuf> {
    let output = std::process::Command::new("cargo")
        .args(["locate-project", "--workspace", "--message-format=plain"])
        .output()
        .context("failed to run cargo locate-project")?;

    let manifest = String::from_utf8(output.stdout).context("cargo printed invalid UTF-8")?;
    Ok(PathBuf::from(manifest.trim())
        .parent()
        .context("manifest path has no parent")?
        .to_path_buf())
}

fn fmt(sh: &Shell) -> Result<()> {
    cmd!(sh, "cargo fmt --all -- --check").run()?;
    Ok(())
}

fn clippy(sh: &Shell) -> Result<()> {
    cmd!(sh, "cargo clippy --workspace --all-features --all-targets -- -D warnings").run()?;
    Ok(())
}

fn features(sh: &Shell) -> Result<()> {
    for krate in ["keel-pool", "keel-migrate"] {
        cmd!(sh, "cargo check -p {krate} --no-default-features").run()?;
        cmd!(sh, "cargo check -p {krate} --features postgres").run()?;
    }
    Ok(())
}

fn test(sh: &Shell) -> Result<()> {
    cmd!(sh, "cargo test --workspace --all-features").run()?;
    Ok(())
}

fn test_live(sh: &Shell) -> Result<()> {
    if sh.var("KEEL_TEST_DB_HOST").is_err() {
        bail!("KEEL_TEST_DB_HOST is not set; point the KEEL_TEST_DB_* variables at a scratch database");
    }
    cmd!(sh, "cargo test -p keel --all-features --test live_postgres -- --ignored --test-threads=1")
        .run()?;
    Ok(())
}

fn doc(sh: &Shell) -> Result<()> {
    cmd!(sh, "cargo doc --workspace --all-features --no-deps").run()?;
    Ok(())
}
