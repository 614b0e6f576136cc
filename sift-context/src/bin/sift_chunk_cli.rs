use clap::Parser;
use serde::Serialize;
use sift_context::text::{
    Chunker, ChunkerConfig, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE, TextChunk,
};
use std::fs;
use std::io::{self, Read};
use std::process;

/// A CLI tool to split a text file into overlapping chunks and print them as JSON.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input text file. If not provided, reads from stdin.
    #[arg(short, long)]
    input: Option<String>,

    /// Document id used to derive chunk ids.
    #[arg(short, long, default_value = "stdin")]
    document_id: String,

    /// Maximum number of characters per chunk.
    #[arg(short = 's', long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Number of characters shared by consecutive chunks.
    #[arg(short, long, default_value_t = DEFAULT_CHUNK_OVERLAP)]
    overlap: usize,

    /// How far back to look for whitespace when ending a chunk.
    #[arg(short, long)]
    lookback: Option<usize>,
}

#[derive(Serialize)]
struct SerializableChunk<'a> {
    chunk_id: String,
    #[serde(flatten)]
    chunk: &'a TextChunk,
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    let content = if let Some(input_path) = args.input {
        fs::read_to_string(input_path)?
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    };

    let mut config = ChunkerConfig::new(args.chunk_size, args.overlap);
    if let Some(lookback) = args.lookback {
        config = config.with_lookback(lookback);
    }

    let chunker = match Chunker::new(config) {
        Ok(chunker) => chunker,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    let chunks = chunker.split(&content);
    let serializable: Vec<SerializableChunk> = chunks
        .iter()
        .map(|chunk| SerializableChunk {
            chunk_id: format!("{}_chunk_{:06}", args.document_id, chunk.sequence),
            chunk,
        })
        .collect();

    let json_output = serde_json::to_string_pretty(&serializable)?;
    println!("{json_output}");

    Ok(())
}
