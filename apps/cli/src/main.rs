mod logging;

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use app_settings::AppSettings;
use catalog::{parse_tag_text, CatalogService, ErrorKind, StoreError};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{info_span, warn};

/// Failures of one command: store errors, or local file I/O around them.
#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0:#}")]
    Io(anyhow::Error),
}

impl CliError {
    fn status_code(&self) -> Option<u16> {
        match self {
            CliError::Store(err) => Some(err.status_code()),
            CliError::Io(_) => None,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, CliError::Store(err) if err.is_retryable())
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Content-addressed image store with tag indexing.", long_about = None)]
struct Cli {
    /// Settings file to use instead of the per-user one
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Store an image file, tagging it with the given tag text
    Upload {
        file: PathBuf,
        #[arg(long)]
        tags: Option<String>,
    },
    /// Replace the tags of a stored image; omitting --tags clears them
    Edit {
        blob_reference: String,
        #[arg(long)]
        tags: Option<String>,
    },
    /// Remove an image and its blob
    Delete { blob_reference: String },
    /// Show one image
    Show { blob_reference: String },
    /// Write the stored bytes of an image to a file or stdout
    Cat {
        blob_reference: String,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// List images, newest first, optionally only those carrying all of --tags
    Images {
        #[arg(long)]
        tags: Option<String>,
    },
    /// List images matching every token of a query
    Search { query: String },
    /// List images without tags
    Tagless,
    /// List all tags by name
    Tags,
    /// List tags no image refers to
    ImagelessTags,
    /// Print the effective settings
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("failed to load settings: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = logging::init(&settings.log_filter) {
        eprintln!("failed to initialise logging: {err}");
    }

    let outcome = run(&cli.command, &settings);
    let (response, code) = match outcome {
        Ok(Some(response)) => (response, ExitCode::SUCCESS),
        Ok(None) => return ExitCode::SUCCESS,
        Err(err) => {
            if err.is_retryable() {
                warn!(error = %err, "operation failed; it may succeed when retried");
            }
            (error_response(&err), ExitCode::from(exit_code(&err)))
        }
    };

    let mut stdout = std::io::stdout().lock();
    let written = serde_json::to_writer_pretty(&mut stdout, &response)
        .map_err(std::io::Error::from)
        .and_then(|()| writeln!(stdout));
    if written.is_err() {
        return ExitCode::FAILURE;
    }
    code
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<AppSettings> {
    match path {
        Some(path) => AppSettings::load_from(path)
            .with_context(|| format!("cannot read {}", path.display())),
        None => AppSettings::load().context("cannot read per-user settings"),
    }
}

/// Executes one command. `Ok(None)` means the output was already written.
fn run(command: &Command, settings: &AppSettings) -> Result<Option<Value>, CliError> {
    if *command == Command::Config {
        return Ok(Some(json!(settings)));
    }

    let span = info_span!("tagstore");
    let service = CatalogService::open(settings, span)?;

    let response = match command {
        Command::Upload { file, tags } => {
            let bytes = std::fs::read(file)
                .with_context(|| format!("cannot read upload {}", file.display()))
                .map_err(CliError::Io)?;
            let image = service.upload(&bytes, tags.as_deref())?;
            json!({ "success": true, "image": image })
        }
        Command::Edit {
            blob_reference,
            tags,
        } => {
            let image = service.edit(blob_reference, tags.as_deref())?;
            json!({ "success": true, "image": image })
        }
        Command::Delete { blob_reference } => {
            service.delete(blob_reference)?;
            json!({ "success": true })
        }
        Command::Show { blob_reference } => {
            json!({ "success": true, "image": service.find_image(blob_reference)? })
        }
        Command::Cat {
            blob_reference,
            output,
        } => {
            let (bytes, mime_type) = service.read_blob(blob_reference)?;
            match output {
                Some(path) => {
                    std::fs::write(path, &bytes)
                        .with_context(|| format!("cannot write {}", path.display()))
                        .map_err(CliError::Io)?;
                    json!({ "success": true, "mime_type": mime_type, "size": bytes.len() })
                }
                None => {
                    std::io::stdout()
                        .lock()
                        .write_all(&bytes)
                        .context("cannot write blob to stdout")
                        .map_err(CliError::Io)?;
                    return Ok(None);
                }
            }
        }
        Command::Images { tags } => {
            let required: BTreeSet<String> = parse_tag_text(tags.as_deref());
            json!({ "object_list": service.list_images(&required)? })
        }
        Command::Search { query } => json!({ "object_list": service.search(query)? }),
        Command::Tagless => json!({ "object_list": service.list_tagless_images()? }),
        Command::Tags => json!({ "object_list": service.list_tags()? }),
        Command::ImagelessTags => json!({ "object_list": service.list_imageless_tags()? }),
        Command::Config => json!(settings),
    };
    Ok(Some(response))
}

fn error_response(err: &CliError) -> Value {
    json!({
        "success": false,
        "status": err.status_code(),
        "retryable": err.is_retryable(),
        "errors": err.to_string(),
    })
}

/// Process exit status per error class. Local I/O failures use `EX_IOERR`.
fn exit_code(err: &CliError) -> u8 {
    let err = match err {
        CliError::Store(err) => err,
        CliError::Io(_) => return 74,
    };
    match err.kind() {
        ErrorKind::Input => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::Conflict => 4,
        ErrorKind::Persistence => 5,
        ErrorKind::Integrity => 6,
    }
}
