//! Command-line entry point: `start`s the server, or edits a config file's
//! `library` blocks without starting anything.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tape_ingestd::config::Config;
use tape_ingestd::server::Server;

#[derive(Parser)]
#[command(name = "tape-ingestd", version, about = "Tape archive ingestion server")]
struct Cli {
    /// Path to the block-structured configuration file.
    #[arg(long, global = true, default_value = "/etc/tape-ingestd/config.cfg")]
    config: PathBuf,

    /// Raise the default log level to debug.
    #[arg(long, global = true)]
    debug: bool,

    /// Replace every changer and LTFS mount with the in-memory mock, ignoring
    /// what the config's `changer` blocks say.
    #[arg(long, global = true)]
    mock: bool,

    /// Reconcile the inventory against every configured library's changer
    /// before doing anything else.
    #[arg(long, global = true)]
    audit: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start serving HTTP traffic.
    Start {
        /// Address the HTTP listener binds to.
        #[arg(long, default_value = "127.0.0.1:8007")]
        listen: SocketAddr,
    },
    /// Add or modify a `library` block in the configuration file.
    Library {
        #[command(subcommand)]
        action: LibraryAction,
    },
    /// Print the build version and exit.
    Version,
}

#[derive(Subcommand)]
enum LibraryAction {
    Add(LibrarySpec),
    Modify(LibrarySpec),
}

#[derive(Args)]
struct LibrarySpec {
    /// Library name (the block's label).
    #[arg(long)]
    name: String,
    /// Changer device path, e.g. `/dev/sg0`.
    #[arg(long)]
    changer_device: String,
    /// Changer kind: `mtx` or `mock`.
    #[arg(long, default_value = "mtx")]
    changer_type: String,
    /// One drive, repeatable: `<device>:<read|write>:<slot>[:<group>]`.
    #[arg(long = "drive", required = true)]
    drives: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_logging(cli.debug) {
        eprintln!("failed to initialize logging: {err}");
        return ExitCode::FAILURE;
    }

    let result = match &cli.command {
        Command::Version => {
            println!("tape-ingestd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Library { action } => run_library_command(&cli.config, action),
        Command::Start { listen } => run_start(&cli, *listen),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// `--debug` raises the default level; `TAPE_INGESTD_LOG_TARGET=syslog`
/// switches the destination from stderr to the local syslog daemon.
fn init_logging(debug: bool) -> Result<(), anyhow::Error> {
    let default_level = if debug { "debug" } else { "info" };

    let target = std::env::var("TAPE_INGESTD_LOG_TARGET").unwrap_or_else(|_| "stderr".to_string());
    if target == "syslog" {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process: "tape-ingestd".into(),
            pid: std::process::id() as i32,
        };
        let logger = syslog::unix(formatter).map_err(|err| anyhow::anyhow!("connecting to syslog: {err}"))?;
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map_err(|err| anyhow::anyhow!("installing syslog logger: {err}"))?;
        let level = if debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };
        log::set_max_level(level);
        Ok(())
    } else {
        let env = env_logger::Env::default().default_filter_or(default_level);
        env_logger::Builder::from_env(env).format_timestamp_millis().init();
        Ok(())
    }
}

fn run_start(cli: &Cli, listen: SocketAddr) -> Result<(), anyhow::Error> {
    let config = Config::load(&cli.config)?;
    log::info!(
        "resolved topology: {} libraries, {} total drives",
        config.libraries.len(),
        config.libraries.iter().map(|l| l.drives.len()).sum::<usize>()
    );

    let server = Arc::new(Server::build(&config, cli.mock)?);

    if cli.audit {
        for library in &config.libraries {
            match server.audit(&library.name) {
                Ok(()) => log::info!("audit of library '{}' complete", library.name),
                Err(err) => log::error!("audit of library '{}' failed: {err}", library.name),
            }
        }
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let shutdown = async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("received shutdown signal, draining connections");
        };
        tape_ingestd::api::serve(listen, server, shutdown).await
    })?;

    Ok(())
}

fn run_library_command(config_path: &Path, action: &LibraryAction) -> Result<(), anyhow::Error> {
    let (spec, replace) = match action {
        LibraryAction::Add(spec) => (spec, false),
        LibraryAction::Modify(spec) => (spec, true),
    };

    let text = std::fs::read_to_string(config_path)
        .map_err(|err| anyhow::anyhow!("reading {config_path:?}: {err}"))?;

    let existing = find_library_block(&text, &spec.name);
    if existing.is_some() && !replace {
        anyhow::bail!("library '{}' already exists in {config_path:?}", spec.name);
    }
    if existing.is_none() && replace {
        anyhow::bail!("library '{}' not found in {config_path:?}", spec.name);
    }

    let block = render_library_block(spec)?;
    let updated = match existing {
        Some((start, end)) => format!("{}{}{}", &text[..start], block, &text[end..]),
        None => {
            let mut updated = text;
            if !updated.ends_with('\n') {
                updated.push('\n');
            }
            updated.push('\n');
            updated.push_str(&block);
            updated
        }
    };

    // Parse before writing back, so a malformed spec never corrupts a
    // previously-valid configuration file.
    Config::parse(&updated)?;
    std::fs::write(config_path, updated).map_err(|err| anyhow::anyhow!("writing {config_path:?}: {err}"))?;
    log::info!("library '{}' {} in {config_path:?}", spec.name, if replace { "updated" } else { "added" });
    Ok(())
}

fn render_library_block(spec: &LibrarySpec) -> Result<String, anyhow::Error> {
    let mut out = format!(
        "library \"{}\" {{\n  changer \"{}\" {{ type = \"{}\" }}\n",
        spec.name, spec.changer_device, spec.changer_type
    );

    for raw in &spec.drives {
        let parts: Vec<&str> = raw.split(':').collect();
        let (device, kind, slot) = match parts.as_slice() {
            [device, kind, slot] => (*device, *kind, *slot),
            [device, kind, slot, _group] => (*device, *kind, *slot),
            _ => anyhow::bail!("malformed --drive spec '{raw}', expected <device>:<read|write>:<slot>[:<group>]"),
        };
        slot.parse::<u32>()
            .map_err(|_| anyhow::anyhow!("malformed slot in --drive spec '{raw}'"))?;

        out.push_str(&format!("  drive \"{device}\" {{ type = \"{kind}\" slot = {slot}"));
        if let [_, _, _, group] = parts.as_slice() {
            out.push_str(&format!(" group = \"{group}\""));
        }
        out.push_str(" }\n");
    }

    out.push_str("}\n");
    Ok(out)
}

/// Find the byte range of a top-level `library "name" { ... }` block,
/// including its trailing newline if present.
fn find_library_block(text: &str, name: &str) -> Option<(usize, usize)> {
    let needle = format!("library \"{name}\"");
    let start = text.find(&needle)?;
    let brace_start = text[start..].find('{')? + start;

    let mut depth = 0usize;
    let mut end = None;
    for (offset, ch) in text[brace_start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(brace_start + offset + 1);
                    break;
                }
            }
            _ => {}
        }
    }

    let mut end = end?;
    if text[end..].starts_with('\n') {
        end += 1;
    }
    Some((start, end))
}
