use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;

use paradise_organizer::pdf::page_metadata;
use paradise_organizer::{
    AppError, AppResult, DeliveryOutcome, FsBackend, InputFile, OrganizerSession, PageRange,
    PdfEngine, Settings, SortDirection, SplitMode, SplitSession,
};

#[derive(Parser)]
#[command(name = "paradise-organizer")]
#[command(about = "Reorder, assemble and split PDF documents")]
#[command(version)]
struct Cli {
    /// JSON settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print page count and page sizes
    Info { pdf: PathBuf },

    /// Split into one file per range, or into fixed-size chunks
    Split {
        pdf: PathBuf,

        /// Page range such as 1-3 or 5; repeatable
        #[arg(long = "range", required_unless_present = "every")]
        ranges: Vec<PageRange>,

        /// Also write the pages no range covers
        #[arg(long)]
        include_remainder: bool,

        /// Pages per chunk
        #[arg(long, conflicts_with = "ranges")]
        every: Option<u32>,

        /// Output folder
        #[arg(long)]
        out: PathBuf,
    },

    /// Build a new document from the pages of one
    Organize {
        pdf: PathBuf,

        /// Final order, e.g. "3,1,blank,2". Unlisted pages are dropped.
        #[arg(long)]
        order: Option<String>,

        /// FILE@POS: insert a PDF or image before position POS (0-based); repeatable
        #[arg(long = "insert")]
        inserts: Vec<Insert>,

        /// Reverse the final order
        #[arg(long)]
        reverse: bool,

        /// Output file
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderToken {
    Page(u32),
    Blank,
}

impl FromStr for OrderToken {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("blank") {
            return Ok(OrderToken::Blank);
        }
        match s.parse::<u32>() {
            Ok(n) if n > 0 => Ok(OrderToken::Page(n)),
            _ => Err(format!("Invalid order entry: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
struct Insert {
    file: PathBuf,
    position: usize,
}

impl FromStr for Insert {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (file, position) = s
            .rsplit_once('@')
            .ok_or_else(|| format!("Expected FILE@POS, got {}", s))?;
        let position = position
            .parse()
            .map_err(|_| format!("Invalid insert position: {}", position))?;
        Ok(Insert {
            file: PathBuf::from(file),
            position,
        })
    }
}

fn report(outcome: DeliveryOutcome) {
    match outcome {
        DeliveryOutcome::Saved { paths } => {
            for path in paths {
                println!("{}", path.display());
            }
        }
        DeliveryOutcome::Canceled => println!("Canceled"),
    }
}

fn info(engine: PdfEngine, pdf: PathBuf) -> AppResult<()> {
    let doc = engine.load_file(&pdf)?;
    let pages = page_metadata(&doc);
    println!("{}: {} pages", pdf.display(), pages.len());
    for page in pages {
        println!(
            "  {:>4}  {:>7.1} x {:<7.1}{}",
            page.page_number,
            page.width,
            page.height,
            if page.is_landscape { "  landscape" } else { "" }
        );
    }
    Ok(())
}

async fn split(
    engine: PdfEngine,
    settings: Settings,
    pdf: PathBuf,
    ranges: Vec<PageRange>,
    include_remainder: bool,
    every: Option<u32>,
    out: PathBuf,
) -> AppResult<()> {
    let file = InputFile::read(&pdf)?;
    let mut session = SplitSession::open(engine, settings, file.bytes)?;
    session.set_mode(match every {
        Some(pages_per_chunk) => SplitMode::Fixed { pages_per_chunk },
        None => SplitMode::Custom { ranges },
    });
    for unit in session.preview(include_remainder)? {
        log::info!("{} <- pages {}", unit.name, unit.page_range);
    }
    report(session.execute(&FsBackend::into_folder(out), include_remainder).await?);
    Ok(())
}

async fn organize(
    engine: PdfEngine,
    settings: Settings,
    pdf: PathBuf,
    order: Option<String>,
    inserts: Vec<Insert>,
    reverse: bool,
    out: PathBuf,
) -> AppResult<()> {
    let file = InputFile::read(&pdf)?;
    let mut session = OrganizerSession::open(engine, settings, file.bytes)?;

    if let Some(order) = order {
        let tokens = order
            .split(',')
            .map(OrderToken::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map_err(AppError::Config)?;
        let originals = session.sequence().ids();
        let mut listed = vec![false; originals.len()];
        for token in &tokens {
            if let OrderToken::Page(n) = token {
                let slot = listed.get_mut(*n as usize - 1).ok_or_else(|| {
                    AppError::Config(format!("Page {} does not exist", n))
                })?;
                if *slot {
                    return Err(AppError::Config(format!("Page {} is listed twice", n)));
                }
                *slot = true;
            }
        }
        for (id, keep) in originals.iter().zip(&listed) {
            if !keep {
                session.remove(*id);
            }
        }
        for (position, token) in tokens.iter().enumerate() {
            match token {
                OrderToken::Page(n) => {
                    session.move_page(originals[*n as usize - 1], position);
                }
                OrderToken::Blank => {
                    session.insert_blank(position);
                }
            }
        }
    }

    for insert in inserts {
        let file = InputFile::read(&insert.file)?;
        let added = session.insert_files(insert.position, vec![file]);
        if added == 0 {
            log::warn!("{} contributed no pages", insert.file.display());
        }
    }

    if reverse {
        session.sort(SortDirection::Descending);
    }

    report(session.save(&FsBackend::save_to(out)).await?);
    Ok(())
}

async fn run(cli: Cli) -> AppResult<()> {
    let settings = Settings::load_or_default(cli.config.as_deref())?;
    let engine = PdfEngine::init()?;
    match cli.command {
        Command::Info { pdf } => info(engine, pdf),
        Command::Split {
            pdf,
            ranges,
            include_remainder,
            every,
            out,
        } => split(engine, settings, pdf, ranges, include_remainder, every, out).await,
        Command::Organize {
            pdf,
            order,
            inserts,
            reverse,
            out,
        } => organize(engine, settings, pdf, order, inserts, reverse, out).await,
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
