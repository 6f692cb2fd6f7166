use std::{
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use clap::{command, CommandFactory, Parser};
use slotserve_core::{dummy::DummyRuntime, Server, Task, TaskResult};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
};

use crate::{config::Config, ticker::Ticker};

mod config;
mod ticker;

const DEFAULT_CONFIG: &str = "assets/configs/Config.toml";

pub async fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut contents = String::new();
    reader.read_to_string(&mut contents).await?;
    Ok(toml::from_str(&contents)?)
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Override the number of slots.
    #[arg(long, short)]
    slots: Option<usize>,
    /// Log level of the slotserve crates.
    #[arg(long, short, value_name = "LEVEL")]
    log_level: Option<String>,
}

/// One line typed into the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Complete(String),
    Embed(String),
    Save(u32, String),
    Restore(u32, String),
    Erase(u32),
    Metrics,
    Help,
    Quit,
}

impl std::str::FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let Some(line) = line.strip_prefix('/') else {
            return Ok(Self::Complete(line.to_string()));
        };
        let mut words = line.split_whitespace();
        let name = words.next().unwrap_or_default();
        let mut slot = || -> Result<u32> {
            let word = words.next().ok_or_else(|| anyhow!("missing slot id"))?;
            Ok(word.parse()?)
        };
        let command = match name {
            "embed" => Self::Embed(line["embed".len()..].trim_start().to_string()),
            "save" => Self::Save(slot()?, file_name(line)?),
            "restore" => Self::Restore(slot()?, file_name(line)?),
            "erase" => Self::Erase(slot()?),
            "metrics" => Self::Metrics,
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => bail!("unknown command /{name}"),
        };
        Ok(command)
    }
}

fn file_name(line: &str) -> Result<String> {
    line.split_whitespace()
        .nth(2)
        .map(ToString::to_string)
        .ok_or_else(|| anyhow!("missing file name"))
}

const HELP: &str = "\
<text>                    complete the text
/embed <text>             embed the text
/save <slot> <file>       save a slot to a file
/restore <slot> <file>    restore a slot from a file
/erase <slot>             clear a slot
/metrics                  print and reset scheduler metrics
/quit                     exit";

/// Run one task to completion, printing streamed text as it arrives.
async fn drive(server: &Server, task: Task, tick: Duration) -> Result<()> {
    let mut reader = server.reader();
    let id = reader.post_task(task)?;
    let mut ticker = Some(Ticker::spawn(tick));
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            Some(frame) = ticker::next_frame(&ticker) => {
                eprint!("\r{frame}");
            }
            result = reader.next_async() => {
                if ticker.take().is_some() {
                    eprint!("\r");
                }
                let Some(result) = result else {
                    break;
                };
                match result {
                    TaskResult::Partial(partial) => {
                        print!("{}", partial.content_delta);
                        stdout.flush()?;
                    }
                    TaskResult::Final(result) => {
                        println!("{}", result.content);
                        let timings = result.timings;
                        log::info!(
                            "[task: {id}][stop: {:?}][cached: {}][prompt: {} at {:.1}/s][predicted: {} at {:.1}/s]",
                            result.stop,
                            timings.cache_n,
                            timings.prompt_n,
                            timings.prompt_per_second(),
                            timings.predicted_n,
                            timings.predicted_per_second(),
                        );
                    }
                    TaskResult::Embedding(embedding) => println!("{:?}", embedding.vector),
                    TaskResult::Rerank(rerank) => println!("[{}] {}", rerank.index, rerank.score),
                    TaskResult::SlotOp(op) => println!(
                        "slot {}: {} tokens, {} bytes in {:?}",
                        op.slot, op.n_tokens, op.n_bytes, op.elapsed
                    ),
                    TaskResult::Progress(progress) => log::debug!(
                        "[task: {id}][progress: {}/{}][cached: {}]",
                        progress.processed,
                        progress.total,
                        progress.cache,
                    ),
                    TaskResult::Metrics(result) => {
                        println!("{}", toml::to_string_pretty(&result.metrics)?)
                    }
                    TaskResult::Error(err) => eprintln!("error ({}): {}", err.kind, err.message),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                reader.cancel(id)?;
                eprintln!("\ncancelled");
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = match &args.log_level {
        Some(level) => level
            .parse()
            .map_err(|_| anyhow!("invalid log level {level}"))?,
        None => log::LevelFilter::Info,
    };
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .with_module_level("slotserve", level)
        .with_module_level("slotserve_core", level)
        .init()?;

    let cmd = Args::command();
    let version = cmd.get_version().unwrap_or("0.0.1");
    let bin_name = cmd.get_bin_name().unwrap_or("slotserve");
    log::info!("{}\tversion: {}", bin_name, version);

    let config = match &args.config {
        Some(path) => {
            log::info!("reading config {}...", path.to_string_lossy());
            load_config(path).await?
        }
        None if Path::new(DEFAULT_CONFIG).exists() => {
            log::info!("reading config {DEFAULT_CONFIG}...");
            load_config(DEFAULT_CONFIG).await?
        }
        None => Config::default(),
    };
    let config = config.resolve(args.slots);

    if let Some(path) = &config.scheduler.slot_save_path {
        if !path.exists() {
            std::fs::create_dir_all(path)?;
        }
    }

    let runtime = DummyRuntime::new(config.dummy.clone());
    let server = Server::spawn(config.scheduler.clone(), runtime)?;
    let tick = Duration::from_millis(config.driver.tick_ms);
    eprintln!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(err) => {
                eprintln!("{err}");
                continue;
            }
        };

        let id = server.new_id();
        let task = match command {
            Command::Complete(text) => Task::completion(
                id,
                DummyRuntime::tokenize(&text),
                config.params.clone(),
            ),
            Command::Embed(text) => Task::embedding(id, DummyRuntime::tokenize(&text)),
            Command::Save(slot, file) => Task::slot_save(id, slot, file),
            Command::Restore(slot, file) => Task::slot_restore(id, slot, file),
            Command::Erase(slot) => Task::slot_erase(id, slot),
            Command::Metrics => Task::metrics(id, true),
            Command::Help => {
                eprintln!("{HELP}");
                continue;
            }
            Command::Quit => break,
        };
        drive(&server, task, tick).await?;
    }

    server.shutdown();
    Ok(())
}
