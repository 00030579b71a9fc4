use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use phistore_core::{
    Actor, ByteStream, OperationContext, StorageClass, StorageConfig, StorageManager,
    StoragePath, StoragePrefix, WorkspaceReaper,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

#[derive(Parser)]
#[command(name = "phistore")]
#[command(about = "PHI Store operator CLI")]
struct Cli {
    /// Actor recorded in the audit ledger: `system` or `user:<id>`
    #[arg(long, global = true, default_value = "system")]
    actor: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a local file as an object
    Save {
        class: String,
        path: String,
        /// File to upload
        file: PathBuf,
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Fetch an object; writes to stdout unless --output is given
    Get {
        class: String,
        path: String,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Delete one object
    Delete { class: String, path: String },
    /// Delete every object under a prefix
    DeletePrefix { class: String, prefix: String },
    /// Check whether an object exists
    Exists { class: String, path: String },
    /// List objects under a prefix
    List {
        class: String,
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Print the audit ledger records for one object, oldest first
    History { class: String, path: String },
    /// Ask the reaper to remove an object after a delay
    ScheduleCleanup {
        class: String,
        path: String,
        /// Seconds from now
        #[arg(long, default_value_t = 0)]
        after_secs: u64,
    },
    /// Run one reaper pass now
    Reap,
    /// Check that every storage class accepts writes
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        println!("Use 'phistore --help' for commands");
        return Ok(());
    };

    let actor: Actor = cli.actor.parse()?;
    let ctx = OperationContext::new(actor.clone());
    let manager = Arc::new(StorageManager::new(StorageConfig::from_env()?)?);

    match command {
        Commands::Save {
            class,
            path,
            file,
            content_type,
        } => {
            let driver = manager.get_storage(&StorageClass::new(&class)?)?;
            let path = StoragePath::parse(&path)?;
            let source = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("cannot open {}", file.display()))?;
            let content: ByteStream = Box::pin(ReaderStream::new(source));
            let stored = driver.save(&path, content, content_type, &ctx).await?;
            println!("Saved {}/{}", class, stored);
        }
        Commands::Get {
            class,
            path,
            output,
        } => {
            let driver = manager.get_storage(&StorageClass::new(&class)?)?;
            let mut stream = driver.get(&StoragePath::parse(&path)?, &ctx).await?;
            let mut sink: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match &output {
                Some(target) => Box::new(tokio::fs::File::create(target).await?),
                None => Box::new(tokio::io::stdout()),
            };
            while let Some(chunk) = stream.next().await {
                sink.write_all(&chunk?).await?;
            }
            sink.flush().await?;
        }
        Commands::Delete { class, path } => {
            let driver = manager.get_storage(&StorageClass::new(&class)?)?;
            driver.delete(&StoragePath::parse(&path)?, &ctx).await?;
            println!("Deleted {}/{}", class, path);
        }
        Commands::DeletePrefix { class, prefix } => {
            let driver = manager.get_storage(&StorageClass::new(&class)?)?;
            let count = driver
                .delete_prefix(&StoragePrefix::parse(&prefix)?, &ctx)
                .await?;
            println!("Deleted {} object(s) under {}/{}", count, class, prefix);
        }
        Commands::Exists { class, path } => {
            let driver = manager.get_storage(&StorageClass::new(&class)?)?;
            println!("{}", driver.exists(&StoragePath::parse(&path)?).await?);
        }
        Commands::List { class, prefix } => {
            let driver = manager.get_storage(&StorageClass::new(&class)?)?;
            let paths = driver.list(&StoragePrefix::parse(&prefix)?).await?;
            if paths.is_empty() {
                println!("No objects found.");
            }
            for path in paths {
                println!("{}", path);
            }
        }
        Commands::History { class, path } => {
            let ledger = manager
                .ledger()
                .context("this role keeps no local audit ledger")?;
            for record in ledger.history(&StorageClass::new(&class)?, &path)? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Commands::ScheduleCleanup {
            class,
            path,
            after_secs,
        } => {
            let ledger = manager
                .ledger()
                .context("this role keeps no local audit ledger")?;
            let deadline = Utc::now() + chrono::Duration::seconds(after_secs.min(i64::MAX as u64) as i64);
            let record = ledger.schedule_cleanup(
                &StorageClass::new(&class)?,
                &StoragePath::parse(&path)?,
                deadline,
                actor,
            )?;
            println!("Scheduled cleanup of {}/{} at {}", class, path, deadline);
            println!("Record: {}", record.id);
        }
        Commands::Reap => {
            let report = WorkspaceReaper::new(Arc::clone(&manager))
                .run_once(Utc::now())
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Health => {
            let mut healthy = true;
            for class in manager.classes() {
                match manager.get_storage(class)?.health().await {
                    Ok(()) => println!("{}: ok", class),
                    Err(e) => {
                        healthy = false;
                        println!("{}: {}", class, e);
                    }
                }
            }
            if !healthy {
                anyhow::bail!("storage is not healthy");
            }
        }
    }

    Ok(())
}
