//! CLI tool for packing code-edit samples into training token streams.
//!
//! Reads `.json` edit samples (orig/dest text per file plus a commit
//! message), packs each into a token+mask pair with the wire format from
//! `tokdiff-core`, and writes JSONL splits suitable for SFT training. Token
//! ids come from a HuggingFace tokenizer extended with the protocol's
//! special tokens.

use std::path::PathBuf;

use clap::Parser;
use tokenizers::{AddedToken, Tokenizer as HfTokenizer};

use tokdiff_core::pipeline::{process_all_samples, write_jsonl_output, PipelineConfig};
use tokdiff_core::{Encoding, Format, Token};

const ESCAPE_TOKEN: &str = "<|escape|>";
const EOT_TOKEN: &str = "<|endoftext|>";
const CURSOR_TOKEN: &str = "<|cursor|>";
const KEYWORDS: &[&str] = &["FILE", "/FILE", "CHUNK", "LINE", "SYSTEM", "USER", "ASSISTANT"];

/// Pack edit samples into token streams for model training.
#[derive(Parser, Debug)]
#[command(name = "tokdiff-serialize")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Root directory containing .json edit samples
    #[arg(long)]
    input_root: PathBuf,

    /// Output directory for JSONL files
    #[arg(long)]
    output_dir: PathBuf,

    /// HuggingFace tokenizer model name or path
    #[arg(long)]
    tokenizer: String,

    /// Token budget for required file context
    #[arg(long, default_value = "2048")]
    limit_ctx_n: usize,

    /// Token budget for optional (point-of-interest) file context
    #[arg(long, default_value = "512")]
    limit_aux_n: usize,

    /// Equal runs up to this many lines are joined into one chunk
    #[arg(long, default_value = "3")]
    join_threshold: usize,

    /// Untouched lines added around each edit
    #[arg(long, default_value = "0")]
    padding: usize,

    /// Fraction of samples for validation (0.0-1.0)
    #[arg(long, default_value = "0.1")]
    val_ratio: f64,

    /// Training mode: stochastic context growth, budgets not enforced
    #[arg(long)]
    for_training: bool,
}

/// Wrapper around HuggingFace tokenizers providing the protocol's named
/// special tokens.
///
/// Uses the Rust-native tokenizers library, which is `Send + Sync` and
/// enables parallel packing without the Python GIL.
struct HfEncoding {
    inner: HfTokenizer,
    escape: Token,
    eot: Token,
    cursor: Token,
}

impl HfEncoding {
    /// Load a tokenizer and register the separator, end-of-text and cursor
    /// tokens plus the single-token protocol keywords.
    fn load(model_name: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let mut inner = HfTokenizer::from_pretrained(model_name, None)
            .map_err(|e| e as Box<dyn std::error::Error>)?;
        inner.add_special_tokens(&[
            AddedToken::from(ESCAPE_TOKEN, true),
            AddedToken::from(EOT_TOKEN, true),
            AddedToken::from(CURSOR_TOKEN, true),
        ]);
        let keywords: Vec<AddedToken> = KEYWORDS
            .iter()
            .map(|w| AddedToken::from(*w, false))
            .collect();
        inner.add_tokens(&keywords);
        let lookup = |name: &str| -> Result<Token, Box<dyn std::error::Error>> {
            inner
                .token_to_id(name)
                .ok_or_else(|| format!("tokenizer did not register {}", name).into())
        };
        let escape = lookup(ESCAPE_TOKEN)?;
        let eot = lookup(EOT_TOKEN)?;
        let cursor = lookup(CURSOR_TOKEN)?;
        Ok(Self {
            inner,
            escape,
            eot,
            cursor,
        })
    }
}

impl Encoding for HfEncoding {
    fn encode(&self, text: &str) -> Vec<Token> {
        self.inner
            .encode(text, false)
            .expect("Failed to encode text with tokenizer")
            .get_ids()
            .to_vec()
    }

    fn decode(&self, tokens: &[Token]) -> String {
        self.inner
            .decode(tokens, false)
            .expect("Failed to decode tokens with tokenizer")
    }

    fn escape(&self) -> Token {
        self.escape
    }

    fn eot(&self) -> Token {
        self.eot
    }

    fn cursor(&self) -> Token {
        self.cursor
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    println!("Loading tokenizer from {}...", args.tokenizer);
    let enc = HfEncoding::load(&args.tokenizer)?;
    let fmt = Format::new(enc)?;

    let config = PipelineConfig {
        limit_ctx_n: args.limit_ctx_n,
        limit_aux_n: args.limit_aux_n,
        for_training: args.for_training,
        join_threshold: args.join_threshold,
        padding: args.padding,
        val_ratio: args.val_ratio,
    };

    println!("Packing samples from {:?}...", args.input_root);
    let records = process_all_samples(&args.input_root, &fmt, &config)?;
    let packed = records.len();
    let over_budget = records.iter().filter(|r| r.minimal_context_too_big).count();
    println!("Packed {} samples", packed);

    println!("Writing output to {:?}...", args.output_dir);
    let result = write_jsonl_output(records, &args.output_dir, args.val_ratio)?;

    let metadata_path = args.output_dir.join("metadata.json");
    let metadata = serde_json::json!({
        "config": {
            "input_root": args.input_root.to_string_lossy(),
            "output_dir": args.output_dir.to_string_lossy(),
            "tokenizer": args.tokenizer,
            "limit_ctx_n": args.limit_ctx_n,
            "limit_aux_n": args.limit_aux_n,
            "join_threshold": args.join_threshold,
            "padding": args.padding,
            "val_ratio": args.val_ratio,
            "for_training": args.for_training,
        },
        "counts": {
            "total_samples": result.total_samples,
            "train_records": result.train_records,
            "val_records": result.val_records,
            "over_budget": over_budget,
        },
        "stats": {
            "total_tokens": result.total_tokens,
            "avg_tokens_per_sample": if result.total_samples > 0 {
                result.total_tokens as f64 / result.total_samples as f64
            } else {
                0.0
            },
        },
        "files": {
            "train_path": args.output_dir.join("training.jsonl").to_string_lossy(),
            "val_path": args.output_dir.join("validation.jsonl").to_string_lossy(),
        },
    });
    std::fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?)?;

    println!("\n[summary]");
    println!("  Total samples packed: {}", result.total_samples);
    println!("  Train records: {}", result.train_records);
    println!("  Val records: {}", result.val_records);
    println!("  Over budget: {}", over_budget);
    println!("  Total tokens: {}", result.total_tokens);
    println!("  Output: {:?}/{{training,validation}}.jsonl", args.output_dir);
    println!("  Metadata: {:?}", metadata_path);

    Ok(())
}
