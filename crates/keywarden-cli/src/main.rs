use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use keywarden_core::format::xml::write_entry_list;
use keywarden_core::format::{open_file, save_file};
use keywarden_core::keys::{transform_key_benchmark, CompositeKey, FileKey, PasswordKey, UserKey};
use keywarden_core::model::Database;
use keywarden_core::rand_pool::RandomPool;
use keywarden_core::status::NullStatusLogger;
use keywarden_core::sync::{merge_in, MergeMethod};

#[derive(Parser)]
#[command(name = "keywarden")]
#[command(about = "Encrypted password database tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum MergeMode {
    /// Two-way synchronize.
    Sync,
    /// Adopt objects absent locally, leave the rest untouched.
    Keep,
    /// Import everything under fresh identities.
    Rekey,
}

impl From<MergeMode> for MergeMethod {
    fn from(mode: MergeMode) -> Self {
        match mode {
            MergeMode::Sync => MergeMethod::Synchronize,
            MergeMode::Keep => MergeMethod::KeepExisting,
            MergeMode::Rekey => MergeMethod::CreateNewUuids,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new empty database
    Create {
        file: PathBuf,
        /// Master password
        #[arg(long)]
        password: String,
        /// Database name
        #[arg(long, default_value = "Passwords")]
        name: String,
        /// Key file to add as a second factor
        #[arg(long)]
        key_file: Option<PathBuf>,
    },

    /// Print database statistics as JSON
    Info {
        file: PathBuf,
        #[arg(long)]
        password: String,
        #[arg(long)]
        key_file: Option<PathBuf>,
    },

    /// Merge a source database into a destination database
    Merge {
        dest: PathBuf,
        source: PathBuf,
        /// Password for the destination (and the source, unless overridden)
        #[arg(long)]
        password: String,
        /// Password for the source database
        #[arg(long)]
        source_password: Option<String>,
        #[arg(long, value_enum, default_value = "sync")]
        mode: MergeMode,
    },

    /// Measure how many key-transformation rounds fit a time budget
    Benchmark {
        /// Wall-clock budget in milliseconds
        #[arg(long, default_value_t = 1000)]
        millis: u64,
        /// Round-count step between timer checks
        #[arg(long, default_value_t = 1000)]
        step: u64,
    },

    /// Dump all entries as plain XML (no encryption — trusted output only)
    ExportXml {
        file: PathBuf,
        #[arg(long)]
        password: String,
        #[arg(long)]
        key_file: Option<PathBuf>,
    },
}

fn build_key(password: &str, key_file: Option<&PathBuf>) -> Result<CompositeKey> {
    let mut key = CompositeKey::new();
    key.add_user_key(UserKey::Password(PasswordKey::new(password)));
    if let Some(path) = key_file {
        let file_key = FileKey::open(path)
            .with_context(|| format!("load key file {}", path.display()))?;
        key.add_user_key(UserKey::KeyFile(file_key));
    }
    Ok(key)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Create {
            file,
            password,
            name,
            key_file,
        } => {
            let key = build_key(&password, key_file.as_ref())?;
            let db = Database::new(&name);
            save_file(&db, &key, &RandomPool::new(), &file, &NullStatusLogger)
                .with_context(|| format!("create {}", file.display()))?;
            println!("created {}", file.display());
        }

        Commands::Info {
            file,
            password,
            key_file,
        } => {
            let key = build_key(&password, key_file.as_ref())?;
            let db = open_file(&file, &key, &NullStatusLogger)
                .with_context(|| format!("open {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&db.stats())?);
        }

        Commands::Merge {
            dest,
            source,
            password,
            source_password,
            mode,
        } => {
            let dest_key = build_key(&password, None)?;
            let source_key =
                build_key(source_password.as_deref().unwrap_or(&password), None)?;
            let mut db = open_file(&dest, &dest_key, &NullStatusLogger)
                .with_context(|| format!("open {}", dest.display()))?;
            let incoming = open_file(&source, &source_key, &NullStatusLogger)
                .with_context(|| format!("open {}", source.display()))?;

            let stats = merge_in(&mut db, &incoming, mode.into(), &NullStatusLogger);
            save_file(&db, &dest_key, &RandomPool::new(), &dest, &NullStatusLogger)
                .with_context(|| format!("save {}", dest.display()))?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Commands::Benchmark { millis, step } => {
            let rounds = transform_key_benchmark(Duration::from_millis(millis), step);
            println!(
                "{}",
                serde_json::json!({ "millis": millis, "rounds": rounds })
            );
        }

        Commands::ExportXml {
            file,
            password,
            key_file,
        } => {
            let key = build_key(&password, key_file.as_ref())?;
            let db = open_file(&file, &key, &NullStatusLogger)
                .with_context(|| format!("open {}", file.display()))?;
            let mut entries = Vec::new();
            db.root.for_each_entry(&mut |e| entries.push(e.clone()));
            let mut out = Vec::new();
            write_entry_list(&entries, &mut out)?;
            std::io::stdout().write_all(&out)?;
            println!();
        }
    }
    Ok(())
}
