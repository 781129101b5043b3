//! Interactive GPT-2 Prompt Loop
//!
//! Reads one prompt per line from stdin and streams the model's greedy
//! continuation to stdout, one token at a time.
//!
//! ## Usage
//!
//! ```bash
//! # Expects models/124M/{hparams.json,encoder.json,vocab.bpe,124M.msgpack}
//! cargo run --release --example chat
//!
//! # Another variant, shorter responses, with loader logging
//! RUST_LOG=info cargo run --release --example chat -- --variant 355M --max-tokens 40
//! ```
//!
//! Ctrl-C while a response is streaming stops that response. Ctrl-C at the
//! prompt exits.

use anyhow::{Context, Result};
use clap::Parser;
use gpt2_lazy::{generate, room_left, BPETokenizer, ModelFiles, GPT2};
use std::io::{self, BufRead, Write};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "chat", about = "Stream greedy GPT-2 continuations of stdin prompts")]
struct Args {
    /// Directory holding one sub-directory per model variant
    #[arg(long, default_value = "models")]
    models_dir: String,

    /// Model variant to load
    #[arg(long, default_value = "124M")]
    variant: String,

    /// Stop each response after this many tokens (default: fill the context)
    #[arg(long)]
    max_tokens: Option<usize>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let files = ModelFiles::new(&args.models_dir, &args.variant);
    let tokenizer = BPETokenizer::from_files(&files.encoder, &files.merges)
        .with_context(|| format!("loading tokenizer from {}", files.dir.display()))?;
    let model = GPT2::load(&files)
        .with_context(|| format!("loading checkpoint {}", files.checkpoint.display()))?;
    let n_ctx = model.hparams().n_ctx;

    let running = Arc::new(AtomicBool::new(false));
    let aborted = Arc::new(AtomicBool::new(false));
    {
        let running = Arc::clone(&running);
        let aborted = Arc::clone(&aborted);
        ctrlc::set_handler(move || {
            if !running.load(Ordering::SeqCst) {
                println!();
                std::process::exit(0);
            }
            aborted.store(true, Ordering::SeqCst);
        })
        .context("installing Ctrl-C handler")?;
    }

    println!(
        "GPT-2 [{}]. Type your prompt and hit enter. Ctrl-C aborts the response.",
        args.variant
    );

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    print!("> ");
    stdout.flush()?;

    for line in stdin.lock().lines() {
        let prompt = line?;
        if !prompt.is_empty() {
            let ids = tokenizer.encode(&prompt)?;
            let n_tokens = match room_left(ids.len(), n_ctx) {
                Ok(room) => args.max_tokens.map_or(room, |max| max.min(room)),
                Err(e) => {
                    eprintln!("{e}");
                    print!("> ");
                    stdout.flush()?;
                    continue;
                }
            };

            running.store(true, Ordering::SeqCst);
            let mut write_error = None;
            generate(&model, &ids, n_tokens, |id| {
                if aborted.load(Ordering::SeqCst) {
                    return ControlFlow::Break(());
                }
                let fragment = tokenizer.decode(&[id]);
                if let Err(e) = stdout.write_all(fragment.as_bytes()).and_then(|_| stdout.flush()) {
                    write_error = Some(e);
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            })?;
            running.store(false, Ordering::SeqCst);
            aborted.store(false, Ordering::SeqCst);

            if let Some(e) = write_error {
                return Err(e).context("writing response");
            }
            println!();
        }

        print!("> ");
        stdout.flush()?;
    }

    println!();
    Ok(())
}
