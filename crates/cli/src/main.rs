//! # ebbtool — command-line tool for ebbkv databases
//!
//! ```text
//! ebbtool [options] <file> show [<prefix>]     list entries
//! ebbtool [options] <file> get <key>           fetch and print one value
//! ebbtool [options] <file> set <key> <value>   store a pair
//! ebbtool [options] <file> delete <key>        delete a key
//! ebbtool [options] <file> dump [<detail>]     internal format listing
//! ebbtool [options] <file> consistent          check database consistency
//! ebbtool [options] <file> repack              compact the database
//! ebbtool [options] <file> damage              write then exit dirty (testing)
//! ebbtool [options] <file> batch               run commands from stdin
//! ```
//!
//! Batch mode reads tab-separated lines: `BEGIN`, `COMMIT`, `ABORT`,
//! `GET\tkey`, `SET\tkey\tvalue`, `DELETE\tkey`, `SHOW[\tprefix]`. Output
//! for `show`/`get` is `key<TAB>value` per line.

use std::io::{self, BufRead, Write};
use std::ops::ControlFlow;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ebbkv::{ChecksumKind, Db, Txn};

#[derive(Debug, Parser)]
#[command(name = "ebbtool")]
#[command(about = "Inspect and maintain ebbkv databases", long_about = None)]
struct Cli {
    /// Create the database if it doesn't exist
    #[arg(short = 'n', long)]
    create: bool,

    /// Open the database read-only
    #[arg(short = 'R', long)]
    readonly: bool,

    /// Disable checksums (creates with the null engine)
    #[arg(short = 'N', long)]
    no_checksum: bool,

    /// Don't fsync writes (dangerous)
    #[arg(short = 'S', long)]
    no_sync: bool,

    /// Wrap the whole action in a single transaction
    #[arg(short = 'T', long)]
    use_txn: bool,

    /// Database file (absolute path recommended)
    file: PathBuf,

    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// List all entries, or those matching a prefix
    Show { prefix: Option<String> },
    /// Fetch and print one value
    Get { key: String },
    /// Store a key/value pair
    Set { key: String, value: String },
    /// Delete a key
    Delete { key: String },
    /// Dump the internal record layout
    Dump {
        #[arg(default_value_t = 1)]
        detail: u32,
    },
    /// Check database consistency
    Consistent,
    /// Repack (compact) the database
    Repack,
    /// Begin a write, store a record, and exit without committing
    /// (recovery testing)
    Damage,
    /// Execute tab-separated commands from stdin
    Batch,
}

fn open_db(cli: &Cli) -> Result<Db> {
    let mut opts = Db::options()
        .create(cli.create)
        .read_only(cli.readonly)
        .no_sync(cli.no_sync);
    if cli.no_checksum {
        opts = opts.no_checksum(true).checksum(ChecksumKind::Null);
    }
    opts.open(&cli.file)
        .with_context(|| format!("can't open database {}", cli.file.display()))
}

fn print_pair(out: &mut impl Write, key: &[u8], value: &[u8]) {
    let _ = out.write_all(key);
    let _ = out.write_all(b"\t");
    let _ = out.write_all(value);
    let _ = out.write_all(b"\n");
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let db = open_db(&cli)?;
    let mut out = io::stdout().lock();

    match &cli.action {
        Action::Show { prefix } => {
            let prefix = prefix.as_deref().unwrap_or("").as_bytes().to_vec();
            run_maybe_txn(&db, cli.use_txn, |txn| {
                txn.foreach(&prefix, |k, v| {
                    print_pair(&mut out, k, v);
                    ControlFlow::Continue(())
                })
            })?;
        }
        Action::Get { key } => {
            // absent keys produce no output and a zero exit
            if let Some(value) = db.fetch(key.as_bytes())? {
                print_pair(&mut out, key.as_bytes(), &value);
            }
        }
        Action::Set { key, value } => {
            db.store(key.as_bytes(), value.as_bytes())?;
        }
        Action::Delete { key } => {
            db.delete(key.as_bytes())?;
        }
        Action::Dump { detail } => {
            db.dump(&mut out, *detail)?;
        }
        Action::Consistent => match db.check_consistency() {
            Ok(()) => println!("Yes, consistent"),
            Err(e) => {
                println!("No, not consistent: {e}");
                std::process::exit(1);
            }
        },
        Action::Repack => {
            db.repack()?;
        }
        Action::Damage => {
            let mut txn = db.begin_write()?;
            txn.store(b"INVALID", b"CRASHME")?;
            // leave the DIRTY bit set, as a crashed process would
            txn.abandon();
            std::process::exit(0);
        }
        Action::Batch => {
            batch_commands(&db, &mut out)?;
        }
    }
    Ok(())
}

/// Runs `body` inside one write transaction when `-T` was given, or an
/// ephemeral read transaction otherwise.
fn run_maybe_txn<F>(db: &Db, use_txn: bool, body: F) -> Result<()>
where
    F: FnOnce(&mut Txn<'_>) -> ebbkv::Result<()>,
{
    let mut txn = if use_txn {
        db.begin_write()?
    } else {
        db.begin_read()?
    };
    body(&mut txn)?;
    txn.commit()?;
    Ok(())
}

/// Batch mode: one command per stdin line, fields separated by tabs.
fn batch_commands(db: &Db, out: &mut impl Write) -> Result<()> {
    let stdin = io::stdin();
    let mut txn: Option<Txn<'_>> = None;

    for (lineno, line) in stdin.lock().lines().enumerate() {
        let lineno = lineno + 1;
        let line = line?;
        let line = line.trim_end_matches(['\n', '\r']);
        if line.is_empty() {
            continue;
        }

        let mut fields = line.splitn(3, '\t');
        let cmd = fields.next().unwrap_or("");
        let key = fields.next();
        let value = fields.next();

        match cmd {
            "BEGIN" => {
                if txn.is_some() {
                    bail!("line {lineno}: already in transaction");
                }
                txn = Some(db.begin_write()?);
            }
            "COMMIT" => match txn.take() {
                Some(t) => t.commit().with_context(|| format!("line {lineno}: COMMIT"))?,
                None => bail!("line {lineno}: not in transaction"),
            },
            "ABORT" => match txn.take() {
                Some(t) => t.abort().with_context(|| format!("line {lineno}: ABORT"))?,
                None => bail!("line {lineno}: not in transaction"),
            },
            "GET" => {
                let key = key.with_context(|| format!("line {lineno}: GET requires a key"))?;
                let found = match txn.as_mut() {
                    Some(t) => t.fetch(key.as_bytes())?.map(<[u8]>::to_vec),
                    None => db.fetch(key.as_bytes())?,
                };
                if let Some(v) = found {
                    print_pair(out, key.as_bytes(), &v);
                    out.flush()?;
                }
            }
            "SET" => {
                let (key, value) = match (key, value) {
                    (Some(k), Some(v)) => (k, v),
                    _ => bail!("line {lineno}: SET requires key and value"),
                };
                match txn.as_mut() {
                    Some(t) => t.store(key.as_bytes(), value.as_bytes())?,
                    None => db.store(key.as_bytes(), value.as_bytes())?,
                }
            }
            "DELETE" => {
                let key = key.with_context(|| format!("line {lineno}: DELETE requires a key"))?;
                match txn.as_mut() {
                    Some(t) => t.delete(key.as_bytes())?,
                    None => db.delete(key.as_bytes())?,
                }
            }
            "SHOW" => {
                let prefix = key.unwrap_or("").as_bytes();
                let emit = |k: &[u8], v: &[u8]| {
                    print_pair(out, k, v);
                    ControlFlow::Continue(())
                };
                match txn.as_mut() {
                    Some(t) => t.foreach(prefix, emit)?,
                    None => db.foreach(prefix, emit)?,
                }
                out.flush()?;
            }
            other => bail!("line {lineno}: unknown command '{other}'"),
        }
    }

    if let Some(t) = txn.take() {
        t.commit().context("final COMMIT")?;
    }
    Ok(())
}
