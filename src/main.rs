use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stowage::{
    config::Config,
    object_store::{FromReader, ObjectPath},
    open_store,
};

#[derive(Parser)]
#[command(name = "stowage", about = "Namespaced object storage", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a namespace (no-op if it exists)
    CreateNamespace { namespace: String },
    /// Delete a namespace and every object in it
    DeleteNamespace { namespace: String },
    /// Store an object, reading its content from a file or stdin
    Put {
        namespace: String,
        /// Slash-separated object path
        path: ObjectPath,
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Fetch an object into a file or stdout
    Get {
        namespace: String,
        path: ObjectPath,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete an object
    Rm { namespace: String, path: ObjectPath },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; stdout carries object data
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer().with_writer(std::io::stderr))
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false)
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "stowage starting");

    let config = Config::load()?;
    info!(system = %config.system_name, "Loaded configuration");

    let store = open_store(&config).await?;

    match cli.command {
        Command::CreateNamespace { namespace } => {
            store.create_namespace(&namespace).await?;
            info!(namespace = %namespace, "Namespace ready");
        }
        Command::DeleteNamespace { namespace } => {
            store.delete_namespace(&namespace).await?;
            info!(namespace = %namespace, "Namespace deleted");
        }
        Command::Put {
            namespace,
            path,
            file,
        } => {
            match file {
                Some(file) => {
                    let reader = tokio::fs::File::open(&file).await?;
                    store
                        .write(&namespace, &path, &mut FromReader(reader))
                        .await?;
                }
                None => {
                    store
                        .write(&namespace, &path, &mut FromReader(tokio::io::stdin()))
                        .await?;
                }
            }
            info!(namespace = %namespace, path = %path, "Object stored");
        }
        Command::Get {
            namespace,
            path,
            output,
        } => {
            let mut reader = store.read(&namespace, &path).await?;
            match output {
                Some(output) => {
                    let mut file = tokio::fs::File::create(&output).await?;
                    tokio::io::copy(&mut reader, &mut file).await?;
                    file.flush().await?;
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    tokio::io::copy(&mut reader, &mut stdout).await?;
                    stdout.flush().await?;
                }
            }
        }
        Command::Rm { namespace, path } => {
            store.delete(&namespace, &path).await?;
            info!(namespace = %namespace, path = %path, "Object deleted");
        }
    }

    Ok(())
}
