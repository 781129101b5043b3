//! Print the structure of a checkpoint without reading any tensor data
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --example inspect -- models/124M/124M.msgpack
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use gpt2_lazy::{Entry, LazyReader, Thunk, Value};

#[derive(Parser)]
#[command(name = "inspect", about = "Show the layout and tensor shapes of a checkpoint")]
struct Args {
    /// Path to a `.msgpack` checkpoint
    checkpoint: String,

    /// Print at most this many elements of any array
    #[arg(long, default_value_t = 16)]
    max_items: usize,
}

fn describe_thunk(thunk: &Thunk) -> String {
    match thunk {
        Thunk::Tensor(t) => format!("tensor f32 {:?} ({} bytes)", t.shape(), t.byte_len()),
        Thunk::Blob(b) => format!("binary ({} bytes at offset {})", b.len(), b.offset()),
    }
}

fn describe_scalar(value: &Value) -> Option<String> {
    Some(match value {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Str(s) => format!("{s:?}"),
        Value::Bin(b) => format!("binary ({} bytes)", b.len()),
        Value::Tensor(t) => format!("tensor f32 {:?}", t.shape),
        Value::Deferred(thunk) => describe_thunk(thunk),
        Value::Array(_) | Value::Map(_) => return None,
    })
}

fn print_value(label: &str, value: &Value, indent: usize, max_items: usize) {
    let pad = "  ".repeat(indent);
    if let Some(text) = describe_scalar(value) {
        println!("{pad}{label}: {text}");
        return;
    }

    match value {
        Value::Map(map) => {
            println!("{pad}{label}: map ({} entries)", map.len());
            for (key, entry) in map.iter() {
                match entry {
                    Entry::Resolved(inner) => print_value(key, inner, indent + 1, max_items),
                    Entry::Deferred(thunk) => println!("{pad}  {key}: {}", describe_thunk(thunk)),
                }
            }
        }
        Value::Array(items) => {
            println!("{pad}{label}: array ({} items)", items.len());
            for (i, item) in items.iter().take(max_items).enumerate() {
                print_value(&i.to_string(), item, indent + 1, max_items);
            }
            if items.len() > max_items {
                println!("{pad}  ... {} more", items.len() - max_items);
            }
        }
        _ => {}
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut reader = LazyReader::open(&args.checkpoint)
        .with_context(|| format!("opening {}", args.checkpoint))?;
    let tree = reader
        .parse()
        .with_context(|| format!("parsing {}", args.checkpoint))?;

    print_value("root", &tree, 0, args.max_items);
    println!(
        "\n{} payloads ({:.1} MiB) left unread",
        reader.deferred_count(),
        reader.deferred_bytes() as f64 / (1024.0 * 1024.0)
    );

    let trailing = reader.finish();
    if trailing > 0 {
        println!("warning: {trailing} trailing bytes after the root value");
    }
    Ok(())
}
