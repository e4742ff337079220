use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::Editor;

use quarrydb::common::types::RecordId;
use quarrydb::{StorageConfig, StorageEngine};

const HISTORY_FILE: &str = ".quarry_history";

#[derive(Parser)]
#[command(author, version, about = "quarry - operator tool for QuarryDB data directories")]
struct Cli {
    /// Data directory holding quarry.db and the WAL
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// JSON file with storage settings; --data-dir overrides its directory
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Buffer pool size in pages
    #[arg(short, long)]
    buffer_size: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Create (or recover) the store and exit
    Init,
    /// Create a table
    CreateTable { name: String },
    /// Drop a table
    DropTable { name: String },
    /// List tables in creation order
    Tables,
    /// Insert a record and print its id
    Insert {
        table: String,
        value: String,
        /// Treat VALUE as hex-encoded bytes
        #[arg(long)]
        hex: bool,
    },
    /// Print a record
    Get {
        table: String,
        id: RecordId,
        /// Print the payload hex-encoded
        #[arg(long)]
        hex: bool,
    },
    /// Replace a record's payload
    Update {
        table: String,
        id: RecordId,
        value: String,
        #[arg(long)]
        hex: bool,
    },
    /// Delete a record
    Delete { table: String, id: RecordId },
    /// Print engine statistics as JSON
    Stats,
    /// Take a checkpoint
    Checkpoint,
    /// Compact pages and free unused ones
    Vacuum,
    /// Check pages, catalog, heaps and indexes
    Verify,
    /// Start an interactive shell
    Shell,
}

/// One line typed into the shell
#[derive(Parser)]
#[command(no_binary_name = true)]
struct ShellLine {
    #[command(subcommand)]
    command: Commands,
}

fn load_config(cli: &Cli) -> Result<StorageConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => StorageConfig::default(),
    };
    config.data_directory = cli.data_dir.clone();
    if let Some(size) = cli.buffer_size {
        config.buffer_pool_size = size;
    }
    Ok(config)
}

fn parse_value(value: &str, hex: bool) -> Result<Vec<u8>> {
    if hex {
        return hex::decode(value).context("value is not valid hex");
    }
    Ok(value.as_bytes().to_vec())
}

/// Printable form of a payload: text when it is UTF-8, hex otherwise
fn format_payload(payload: &[u8], hex: bool) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) if !hex => text.to_string(),
        _ => hex::encode(payload),
    }
}

fn execute(engine: &StorageEngine, command: &Commands) -> Result<()> {
    match command {
        Commands::Init => {
            let stats = engine.get_statistics()?;
            println!("Store ready: {} tables, {} pages", stats.tables, stats.total_pages);
            if let Some(report) = engine.recovery_report() {
                println!(
                    "Recovery: {} records redone, {} undone, {} unfinished transactions rolled back",
                    report.records_redone,
                    report.records_undone,
                    report.losers.len()
                );
            }
        }
        Commands::CreateTable { name } => {
            engine.create_table(name)?;
            println!("Table '{}' created", name);
        }
        Commands::DropTable { name } => {
            engine.drop_table(name)?;
            println!("Table '{}' dropped", name);
        }
        Commands::Tables => {
            let tables = engine.list_tables()?;
            for name in &tables {
                println!("{}", name);
            }
            println!("({} tables)", tables.len());
        }
        Commands::Insert { table, value, hex } => {
            let id = engine.insert_record(table, &parse_value(value, *hex)?)?;
            println!("{}", id);
        }
        Commands::Get { table, id, hex } => {
            let payload = engine.get_record(table, *id)?;
            println!("{}", format_payload(&payload, *hex));
        }
        Commands::Update { table, id, value, hex } => {
            engine.update_record(table, *id, &parse_value(value, *hex)?)?;
            println!("Record {} updated", id);
        }
        Commands::Delete { table, id } => {
            engine.delete_record(table, *id)?;
            println!("Record {} deleted", id);
        }
        Commands::Stats => {
            println!("{}", serde_json::to_string_pretty(&engine.get_statistics()?)?);
        }
        Commands::Checkpoint => {
            let lsn = engine.checkpoint()?;
            println!("Checkpoint at LSN {}", lsn);
        }
        Commands::Vacuum => {
            println!("{}", serde_json::to_string_pretty(&engine.vacuum()?)?);
        }
        Commands::Verify => {
            println!("{}", serde_json::to_string_pretty(&engine.verify_integrity()?)?);
        }
        Commands::Shell => bail!("already in the shell"),
    }
    Ok(())
}

/// Split a shell line into words; double quotes group words and a
/// backslash escapes the next character
fn split_words(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let Some(next) = chars.next() else {
                    bail!("line ends with a backslash");
                };
                current.push(next);
                in_word = true;
            }
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if quoted {
        bail!("unterminated quote");
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn run_shell(engine: &StorageEngine) -> Result<()> {
    println!("QuarryDB shell. Type 'help' for commands or 'exit' to quit.");

    let mut rl = Editor::<(), DefaultHistory>::new()?;
    if rl.load_history(HISTORY_FILE).is_err() {
        log::debug!("No shell history loaded");
    }

    loop {
        match rl.readline("quarry> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);

                match line {
                    "exit" | "quit" => break,
                    "help" => {
                        print_help();
                        continue;
                    }
                    _ => {}
                }

                let parsed = split_words(line).and_then(|words| Ok(ShellLine::try_parse_from(words)?));
                match parsed {
                    Ok(ShellLine { command }) => {
                        if let Err(err) = execute(engine, &command) {
                            println!("Error: {:#}", err);
                        }
                    }
                    Err(err) => println!("{}", err),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                println!("Error: {}", err);
                break;
            }
        }
    }

    if let Err(err) = rl.save_history(HISTORY_FILE) {
        println!("Error saving history: {}", err);
    }
    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("  create-table <name>                 - Create a table");
    println!("  drop-table <name>                   - Drop a table");
    println!("  tables                              - List tables");
    println!("  insert <table> <value> [--hex]      - Insert a record");
    println!("  get <table> <id> [--hex]            - Print a record");
    println!("  update <table> <id> <value> [--hex] - Replace a record");
    println!("  delete <table> <id>                 - Delete a record");
    println!("  stats | checkpoint | vacuum | verify");
    println!("  help | exit");
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let engine = StorageEngine::open(config).context("Failed to open the store")?;

    let result = match &cli.command {
        Some(Commands::Shell) | None => run_shell(&engine),
        Some(command) => execute(&engine, command),
    };
    engine.shutdown().context("Failed to shut down cleanly")?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_words_handles_quotes() {
        let words = split_words(r#"insert users "alice smith" --hex"#).unwrap();
        assert_eq!(words, vec!["insert", "users", "alice smith", "--hex"]);
        assert_eq!(split_words(r#"insert t a\ b"#).unwrap(), vec!["insert", "t", "a b"]);
        assert_eq!(split_words(r#"insert t """#).unwrap(), vec!["insert", "t", ""]);
        assert!(split_words(r#"insert "open"#).is_err());
    }

    #[test]
    fn test_shell_line_parses_commands() {
        let line = ShellLine::try_parse_from(["get", "users", "42", "--hex"]).unwrap();
        assert_eq!(
            line.command,
            Commands::Get {
                table: "users".to_string(),
                id: 42,
                hex: true
            }
        );
        assert!(ShellLine::try_parse_from(["get", "users", "not-a-number"]).is_err());
    }

    #[test]
    fn test_payload_formatting() {
        assert_eq!(format_payload(b"plain", false), "plain");
        assert_eq!(format_payload(b"plain", true), "706c61696e");
        assert_eq!(format_payload(&[0xff, 0x00], false), "ff00");
        assert_eq!(parse_value("ff00", true).unwrap(), vec![0xff, 0x00]);
        assert!(parse_value("zz", true).is_err());
    }
}
