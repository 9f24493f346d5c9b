//! heapdig - Inspect the managed heap of a captured process image
//!
//! This tool scans the writable memory of a process image for JavaScript
//! heap objects and reports type histograms, instance listings, reverse
//! references, process metadata and heap snapshots.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use heapdig_core::{
    HeapSnapshot, ProcessImage, ProcessReport, ScanConfig, ScanSession, SearchKey, TaggedLayout,
};
use std::fs;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

/// Inspect the managed heap of a captured process image
#[derive(Parser, Debug)]
#[command(name = "heapdig")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Process image directory (image.json + regions/)
    #[arg(short, long, env = "HEAPDIG_IMAGE")]
    image: PathBuf,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Property names shown per detailed histogram row (0 = all)
    #[arg(long, default_value = "3")]
    preview: usize,

    /// Indentation per level of recursive reference output
    #[arg(long, default_value = "2")]
    padding: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Print a histogram of heap object types
    Objects {
        /// Group by object shape and show sample, property and element columns
        #[arg(short, long)]
        detailed: bool,
    },

    /// List the instances of one type, a page at a time
    Instances {
        /// Type name as shown by `objects`
        type_name: String,

        /// Instances per page (0 = all)
        #[arg(short = 'n', long, default_value = "0")]
        limit: usize,

        /// Show the properties of every instance
        #[arg(short, long)]
        detailed: bool,
    },

    /// Find the objects that reference a value, property name or string
    Refs(RefsArgs),

    /// Print the runtime's process metadata
    Nodeinfo,

    /// Write a heap snapshot for heap-snapshot viewers
    Snapshot {
        /// Output file
        #[arg(short, long, default_value = "core-dump.heapsnapshot")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Read commands from stdin, keeping scan state between them
    Shell,
}

#[derive(Args, Debug, Clone)]
struct RefsArgs {
    /// Search by value: QUERY is an address (default)
    #[arg(short = 'v', long, group = "mode")]
    value: bool,

    /// Search by property name
    #[arg(short = 'n', long, group = "mode")]
    name: bool,

    /// Search by string content
    #[arg(short = 's', long, group = "mode")]
    string: bool,

    /// Expand every referrer recursively
    #[arg(short, long)]
    recursive: bool,

    /// Address (hex with 0x, or decimal), property name or string
    query: String,
}

/// One line of shell input
#[derive(Parser, Debug)]
#[command(no_binary_name = true, disable_version_flag = true)]
struct ShellLine {
    #[command(subcommand)]
    command: Command,
}

/// Image, session and output sink for a run of commands
struct App<W: Write> {
    image: ProcessImage,
    session: ScanSession,
    out: W,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let config = ScanConfig::new()
        .preview_properties(cli.preview)
        .tree_padding(cli.padding);
    let mut app = App::open(&cli.image, config, io::stdout().lock())?;

    match cli.command {
        Command::Shell => {
            let stdin = io::stdin();
            app.shell(stdin.lock())
        }
        command => app.run(&command),
    }
}

impl<W: Write> App<W> {
    fn open(path: &Path, config: ScanConfig, out: W) -> Result<Self> {
        if !path.is_dir() {
            bail!("Image directory does not exist: {}", path.display());
        }
        let image = ProcessImage::load_dir(path)
            .with_context(|| format!("Failed to load process image: {}", path.display()))?;
        info!("Loaded image {} from {}", image_id(&image), path.display());

        Ok(Self {
            image,
            session: ScanSession::new(config),
            out,
        })
    }

    fn run(&mut self, command: &Command) -> Result<()> {
        let layout = TaggedLayout::for_image(&self.image);
        let inventory = self
            .session
            .scan_heap(&self.image, &layout)
            .context("Failed to scan the heap")?;

        match command {
            Command::Objects { detailed: false } => {
                write!(self.out, "{}", inventory.histogram.table())?;
            }
            Command::Objects { detailed: true } => {
                write!(self.out, "{}", inventory.detailed.table())?;
            }
            Command::Instances {
                type_name,
                limit,
                detailed,
            } => match self.session.list_instances(&layout, type_name, *limit, *detailed) {
                Some(listing) => write!(self.out, "{}", listing)?,
                None => bail!("No objects found with type name {}", type_name),
            },
            Command::Refs(args) => {
                let key = search_key(args)?;
                let events = self
                    .session
                    .find_references(&layout, &key, args.recursive)
                    .with_context(|| format!("Failed to search references to {}", args.query))?;
                debug!("{} reference events", events.len());
                write!(self.out, "{}", self.session.render_references(&events))?;
            }
            Command::Nodeinfo => {
                let infos = self.session.process_info(&layout);
                write!(self.out, "{}", ProcessReport(&infos))?;
            }
            Command::Snapshot { output, force } => {
                let snapshot = self.session.heap_snapshot(&layout);
                write_snapshot_file(output, &snapshot, *force)?;
                writeln!(
                    self.out,
                    "Wrote {} ({} nodes, {} edges)",
                    output.display(),
                    snapshot.nodes.len(),
                    snapshot.edges.len()
                )?;
            }
            Command::Shell => bail!("Already in a shell"),
        }
        Ok(())
    }

    /// Run one command per input line until EOF or `quit`
    fn shell<R: BufRead>(&mut self, input: R) -> Result<()> {
        for line in input.lines() {
            let line = line.context("Failed to read command")?;
            let words = split_words(&line);
            match words.first().map(String::as_str) {
                None => continue,
                Some("quit" | "exit") => break,
                Some(_) => {}
            }

            match ShellLine::try_parse_from(&words) {
                Ok(parsed) => {
                    if let Err(e) = self.run(&parsed.command) {
                        writeln!(self.out, "error: {:#}", e)?;
                    }
                }
                Err(e) => write!(self.out, "{}", e.render())?,
            }
            self.out.flush()?;
        }
        Ok(())
    }
}

fn image_id(image: &ProcessImage) -> String {
    use heapdig_core::MemoryProvider;
    image.identity().to_string()
}

/// Turn `refs` arguments into a search key
fn search_key(args: &RefsArgs) -> Result<SearchKey> {
    if args.name {
        Ok(SearchKey::Property(args.query.clone()))
    } else if args.string {
        Ok(SearchKey::Text(args.query.clone()))
    } else {
        parse_address(&args.query).map(SearchKey::Value)
    }
}

/// Parse `0x`-prefixed hex or decimal
fn parse_address(text: &str) -> Result<u64> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("Invalid address: {}", text))
}

/// Split a shell line on whitespace, keeping quoted runs together
fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote = None;
    let mut in_word = false;

    for c in line.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Write a snapshot file, refusing to clobber unless forced
fn write_snapshot_file(output_path: &Path, snapshot: &HeapSnapshot, force: bool) -> Result<()> {
    // Create parent directories
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    // Check if file exists
    if output_path.exists() && !force {
        bail!(
            "File already exists: {} (use --force to overwrite)",
            output_path.display()
        );
    }

    let file = fs::File::create(output_path)
        .with_context(|| format!("Failed to create file: {}", output_path.display()))?;
    let mut writer = BufWriter::new(file);
    snapshot
        .write_json(&mut writer)
        .with_context(|| format!("Failed to write file: {}", output_path.display()))?;
    writer
        .flush()
        .with_context(|| format!("Failed to write file: {}", output_path.display()))?;
    Ok(())
}
