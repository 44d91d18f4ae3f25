use thiserror::Error;

pub mod cli;
pub mod config;
pub mod diff;
pub mod graph;
pub mod ignore;
pub mod logging;
pub mod model;
pub mod mount;
pub mod overlay;
pub mod store;

pub use model::{NodeId, ObjectHash, ROOT_NODE_ID};

pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("overlay storage error: {0}")]
    Storage(String),
    #[error("overlay at {0} is in use by another process")]
    OverlayLocked(String),
    #[error("corrupt overlay record for node {node}: {reason}")]
    Corruption { node: NodeId, reason: String },
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("invalid path component: {0:?}")]
    InvalidName(String),
    #[error("invalid rename: {0}")]
    InvalidRename(String),
    #[error("object {0} not found in object store")]
    ObjectNotFound(ObjectHash),
    #[error("failed to fetch object {hash}: {reason}")]
    Fetch { hash: ObjectHash, reason: String },
    #[error("diff cancelled")]
    Cancelled,
    #[error("serialization error")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cli error: {0}")]
    Cli(String),
}

/// Entry point for the library, called by the CLI thin wrapper.
pub fn run<I, S>(args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    logging::init_logging(logging::LogFormat::Human)?;

    let cli_args = cli::parse_args(args.into_iter().map(Into::into))?;
    cli::dispatch(cli_args)
}
