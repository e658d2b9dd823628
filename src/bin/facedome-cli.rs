//! FACEDOME CLI
//!
//! Manage face libraries stored in a snapshot directory. Embeddings are
//! given as comma-separated floats; image inference is not linked in.

use anyhow::Context;
use clap::{Parser, Subcommand};
use facedome::{EngineConfig, FaceEngine, FixedEmbedder, Snapshot, SnapshotConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// FACEDOME CLI - Face Library Management
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Snapshot directory
    #[arg(short, long, default_value = "./data/snapshots")]
    data_dir: PathBuf,

    /// Embedding dimension for a new store (default: first member added)
    #[arg(long)]
    dimension: Option<usize>,

    /// Number of snapshots to keep
    #[arg(long, default_value_t = 5)]
    keep: usize,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Library management
    #[command(subcommand)]
    Library(LibraryCmd),

    /// Member management
    #[command(subcommand)]
    Member(MemberCmd),

    /// Search a library for the closest faces
    Search {
        library: u64,
        /// Query embedding, e.g. "0.1,0.2,0.3"
        #[arg(short, long, allow_hyphen_values = true)]
        embedding: String,
        #[arg(short = 'k', long, default_value_t = 10)]
        top_k: usize,
        #[arg(short, long, default_value_t = 0.5)]
        threshold: f32,
    },

    /// Compare two embeddings
    Compare {
        #[arg(allow_hyphen_values = true)]
        a: String,
        #[arg(allow_hyphen_values = true)]
        b: String,
    },
}

#[derive(Subcommand, Debug)]
enum LibraryCmd {
    Create {
        name: String,
        #[arg(short, long)]
        description: Option<String>,
    },
    List,
    Rename {
        id: u64,
        name: String,
    },
    Delete {
        id: u64,
    },
}

#[derive(Subcommand, Debug)]
enum MemberCmd {
    Add {
        library: u64,
        name: String,
        #[arg(short, long, allow_hyphen_values = true)]
        embedding: String,
        /// Reference to the source photo
        #[arg(short, long)]
        image: Option<String>,
    },
    List {
        library: u64,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 10)]
        page_size: usize,
    },
    Delete {
        library: u64,
        member: u64,
    },
}

fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("facedome=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let snapshot = Snapshot::new(
        SnapshotConfig::default()
            .with_dir(&args.data_dir)
            .with_max_snapshots(args.keep),
    )?;

    let mut config = EngineConfig::default();
    config.dimension = args.dimension;
    let embedder = Arc::new(FixedEmbedder::default());

    let engine = match snapshot.load_latest()? {
        Some(data) => FaceEngine::from_snapshot(config, embedder, data)
            .context("failed to restore snapshot")?,
        None => {
            info!("No snapshot in {}, starting empty", args.data_dir.display());
            FaceEngine::new(config, embedder)
        }
    };

    let mutated = run(&engine, args.command)?;
    if mutated {
        snapshot.save(&engine.snapshot()?)?;
    }
    info!("{}", engine.metrics().summary());

    Ok(())
}

/// Execute one command; returns whether state changed
fn run(engine: &FaceEngine, command: Cmd) -> anyhow::Result<bool> {
    match command {
        Cmd::Library(LibraryCmd::Create { name, description }) => {
            let lib = engine.create_library(&name, description)?;
            println!("Created library {} ({})", lib.id, lib.name);
            Ok(true)
        }

        Cmd::Library(LibraryCmd::List) => {
            for lib in engine.list_libraries() {
                let members = engine.store().count(lib.id).unwrap_or(0);
                println!(
                    "{:>6}  {:<30}  {:>6} members  {}",
                    lib.id,
                    lib.name,
                    members,
                    lib.description.unwrap_or_default()
                );
            }
            Ok(false)
        }

        Cmd::Library(LibraryCmd::Rename { id, name }) => {
            let lib = engine.rename_library(id, &name)?;
            println!("Renamed library {} to {}", lib.id, lib.name);
            Ok(true)
        }

        Cmd::Library(LibraryCmd::Delete { id }) => {
            let removed = engine.delete_library(id)?;
            println!("Deleted library {} and {} members", id, removed);
            Ok(true)
        }

        Cmd::Member(MemberCmd::Add {
            library,
            name,
            embedding,
            image,
        }) => {
            let embedding = parse_embedding(&embedding)?;
            let member = engine.add_member_embedding(library, &name, embedding, image)?;
            println!("Added member {} ({}) to library {}", member.id, member.name, library);
            Ok(true)
        }

        Cmd::Member(MemberCmd::List {
            library,
            page,
            page_size,
        }) => {
            let listing = engine.list_members(library, page, page_size)?;
            println!("{} members total", listing.total);
            for m in listing.items {
                println!(
                    "{:>8}  {:<30}  {}  {}",
                    m.id,
                    m.name,
                    m.created_at.to_rfc3339(),
                    m.source_image.unwrap_or_default()
                );
            }
            Ok(false)
        }

        Cmd::Member(MemberCmd::Delete { library, member }) => {
            let removed = engine.delete_member(library, member)?;
            println!("Deleted member {} ({})", removed.id, removed.name);
            Ok(true)
        }

        Cmd::Search {
            library,
            embedding,
            top_k,
            threshold,
        } => {
            let query = parse_embedding(&embedding)?;
            let results = engine.search_embedding(library, &query, top_k, threshold)?;
            if results.is_empty() {
                println!("No matches");
            }
            for (rank, r) in results.iter().enumerate() {
                println!(
                    "{:>3}. {:<30} id={:<8} cosine={:.4} similarity={:.2}%",
                    rank + 1,
                    r.name,
                    r.member_id,
                    r.similarity_score,
                    r.similarity_percent
                );
            }
            Ok(false)
        }

        Cmd::Compare { a, b } => {
            let c = engine.compare(&parse_embedding(&a)?, &parse_embedding(&b)?)?;
            println!("Cosine Similarity: {:.4}", c.cosine_similarity);
            println!("Similarity: {:.2}%", c.similarity_percent);
            println!("Euclidean Distance: {:.4}", c.euclidean_distance);
            println!("Same Person: {}", c.same_identity);
            Ok(false)
        }
    }
}

fn parse_embedding(input: &str) -> anyhow::Result<Vec<f32>> {
    let values = input
        .split(',')
        .map(|part| {
            let part = part.trim();
            part.parse::<f32>()
                .with_context(|| format!("invalid embedding component: {:?}", part))
        })
        .collect::<anyhow::Result<Vec<f32>>>()?;

    if values.is_empty() {
        anyhow::bail!("Empty embedding");
    }
    Ok(values)
}
