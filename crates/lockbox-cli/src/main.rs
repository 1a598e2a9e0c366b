use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use lockbox_core::paths::{config_path, data_dir};
use lockbox_core::{DocumentStore, StoreConfig, StoreError};
use std::io::{Read, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "lockbox")]
#[command(about = "Per-user encrypted document store", long_about = None)]
struct Cli {
    /// Caller identity; every operation is checked against document ownership
    #[arg(short, long)]
    user: String,

    /// Store root (defaults to the platform data directory)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Config file (defaults to the platform config path)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new document from a file or stdin
    Create {
        name: String,
        /// Read content from this file instead of stdin
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Print a document's content
    Read {
        name: String,
        #[arg(long)]
        password: Option<String>,
        /// Write content to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Replace a document's content from a file or stdin
    Update {
        name: String,
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        password: Option<String>,
    },

    /// Password-protect a document (cannot be undone)
    Protect {
        name: String,
        #[arg(long)]
        password: Option<String>,
    },

    /// Delete a document
    Delete { name: String },

    /// List owned documents
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config_file = match &cli.config {
        Some(path) => path.clone(),
        None => config_path()?,
    };
    let mut config = StoreConfig::load_or_default(&config_file)?;
    if cli.data_dir.is_some() {
        config.data_dir = cli.data_dir.clone();
    }
    let root = match &config.data_dir {
        Some(dir) => dir.clone(),
        None => data_dir()?,
    };
    let store = DocumentStore::open(&root, config.engine())?;
    let user = cli.user.as_str();

    match cli.command {
        Commands::Create { name, file } => {
            let content = read_content(&file)?;
            store.create(user, &name, &content).await?;
            println!("created {name} ({} bytes plaintext)", content.len());
        }
        Commands::Read {
            name,
            password,
            output,
        } => {
            let content = read_with_prompt(&store, user, &name, password).await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &content)
                        .with_context(|| format!("write {}", path.display()))?;
                }
                None => std::io::stdout().write_all(&content)?,
            }
        }
        Commands::Update {
            name,
            file,
            password,
        } => {
            let content = read_content(&file)?;
            let password = match password {
                Some(pw) => Some(pw),
                None if store.list(user).iter().any(|r| r.name == name && r.protected) => {
                    Some(rpassword::prompt_password("Document password: ")?)
                }
                None => None,
            };
            store.update(user, &name, &content, password.as_deref()).await?;
            println!("updated {name}");
        }
        Commands::Protect { name, password } => {
            let password = match password {
                Some(pw) => pw,
                None => prompt_password_twice("Protection password")?,
            };
            store.protect(user, &name, &password).await?;
            println!("protected {name}");
        }
        Commands::Delete { name } => {
            store.delete(user, &name).await?;
            println!("deleted {name}");
        }
        Commands::List => {
            let mut records = store.list(user);
            records.sort_by(|a, b| a.name.cmp(&b.name));
            for record in records {
                println!(
                    "{}\t{} bytes\t{}\tmodified {}",
                    record.name,
                    record.size,
                    if record.protected { "protected" } else { "open" },
                    record.last_modified.to_rfc3339()
                );
            }
        }
    }
    Ok(())
}

async fn read_with_prompt(
    store: &DocumentStore,
    user: &str,
    name: &str,
    password: Option<String>,
) -> Result<Vec<u8>> {
    match store.read(user, name, password.as_deref()).await {
        Ok(content) => Ok(content),
        Err(StoreError::PasswordRequired(_)) if password.is_none() => {
            let password = rpassword::prompt_password("Document password: ")?;
            Ok(store.read(user, name, Some(&password)).await?)
        }
        Err(e) => Err(e.into()),
    }
}

fn read_content(file: &Option<PathBuf>) -> Result<Vec<u8>> {
    match file {
        Some(path) => {
            std::fs::read(path).with_context(|| format!("read {}", path.display()))
        }
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}

fn prompt_password_twice(label: &str) -> Result<String> {
    let first = rpassword::prompt_password(format!("{label}: "))?;
    let second = rpassword::prompt_password(format!("{label} (again): "))?;
    if first != second {
        return Err(anyhow!("passwords do not match"));
    }
    Ok(first)
}
