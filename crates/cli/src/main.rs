//! treesync: peer-to-peer directory tree synchronization
//!
//! Scans directories into canonical trees, diffs them structurally, and
//! reconciles peers over a length-prefixed TCP protocol.

mod sync;

use std::path::PathBuf;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{builder::Styles, Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use tracing::info;

use treesync_core::{diff_trees, ChangeType, DirectoryTree, NodeDiff};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "treesync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Peer-to-peer directory tree synchronization")]
#[command(long_about = r#"
treesync scans a directory into a canonical tree, exchanges it with a remote
peer over TCP, diffs the two trees structurally, and transfers whole files to
reconcile the differences.

Examples:
  treesync scan ./project --format tree     Inspect a directory tree
  treesync diff ./old ./new                 Diff two local directories
  treesync serve ./mirror --port 9400       Receive pushes into ./mirror
  treesync push ./project example.org --port 9400
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScanFormat {
    Summary,
    Tree,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a directory and print its canonical tree
    Scan {
        /// Directory to scan
        path: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "summary")]
        format: ScanFormat,
    },

    /// Diff two local directories
    Diff {
        /// Old side of the comparison
        old: PathBuf,

        /// New side of the comparison
        new: PathBuf,

        /// Emit JSON records instead of the summary listing
        #[arg(long)]
        json: bool,
    },

    /// Accept pushes from remote peers into a local directory
    Serve {
        /// Directory to reconcile into
        root: PathBuf,

        /// Port to listen on
        #[arg(short, long, default_value = "9400")]
        port: u16,

        /// Also delete local entries the remote no longer has
        #[arg(long)]
        delete: bool,
    },

    /// Push a local directory to a serving peer
    Push {
        /// Directory to push
        root: PathBuf,

        /// Remote host
        host: String,

        /// Remote port
        #[arg(short, long, default_value = "9400")]
        port: u16,

        /// File chunk size in bytes
        #[arg(long, default_value = "1048576")]
        chunk_size: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Scan { path, format } => scan_command(&path, format)?,
        Commands::Diff { old, new, json } => diff_command(&old, &new, json)?,
        Commands::Serve { root, port, delete } => sync::serve(&root, port, delete).await?,
        Commands::Push {
            root,
            host,
            port,
            chunk_size,
        } => sync::push(&root, &host, port, chunk_size).await?,
    }

    Ok(())
}

fn scan_command(path: &PathBuf, format: ScanFormat) -> Result<()> {
    let tree = DirectoryTree::scan(path)?;

    match format {
        ScanFormat::Summary => {
            info!(
                root = %tree.root_path().display(),
                nodes = tree.node_count(),
                "scan complete"
            );
            let files = tree.paths().count() - 1;
            println!("{} entries under {}", files, tree.root_path().display());
        }
        ScanFormat::Tree => {
            let mut stdout = std::io::stdout().lock();
            tree.print_tree(&mut stdout)?;
        }
        ScanFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&tree)?);
        }
    }

    Ok(())
}

fn diff_command(old: &PathBuf, new: &PathBuf, json: bool) -> Result<()> {
    let mut old_tree = DirectoryTree::scan(old)?;
    let mut new_tree = DirectoryTree::scan(new)?;
    let diffs = diff_trees(&mut old_tree, &mut new_tree)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&diffs)?);
        return Ok(());
    }

    for diff in &diffs {
        println!("{} {}", change_letter(diff), diff.path().display());
    }
    println!("{} differences", diffs.len());
    Ok(())
}

fn change_letter(diff: &NodeDiff) -> char {
    match diff.change {
        ChangeType::Added => 'A',
        ChangeType::Deleted => 'D',
        ChangeType::Modified => 'M',
    }
}
