//! Greedy decoding example.
//!
//! Feeds a prompt of token ids and extends it by always picking the most
//! likely next token. With a model directory (holding `params.json` and
//! `.safetensors` weights) it decodes with real weights; without one it uses
//! a small randomly initialised model.
//!
//! Run with:
//! ```bash
//! cargo run -p rotor --example greedy_decode -- /path/to/llama-2-7b
//! ```

use anyhow::Result;
use rotor::prelude::*;
use std::path::Path;
use std::time::Instant;

const PROMPT: [u32; 4] = [1, 15043, 29892, 590];
const NEW_TOKENS: usize = 16;

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let session = match args.get(1) {
        Some(dir) => {
            let dir = Path::new(dir);
            Session::builder()
                .config_path(dir.join("params.json"))
                .weights_path(dir)
                .build()?
        }
        None => {
            println!("No model directory given, using random weights");
            Session::builder()
                .config(ModelConfig {
                    dim: 128,
                    n_layers: 4,
                    n_heads: 8,
                    n_kv_heads: Some(2),
                    multiple_of: 32,
                    max_batch_size: 1,
                    max_seq_len: 64,
                    ..ModelConfig::default()
                })
                .random_weights()
                .build()?
        }
    };

    let start = Instant::now();
    let mut logits = session.feed(&PROMPT)?;
    println!("Prompt: {:?} ({:.2?})", PROMPT, start.elapsed());

    let mut generated = Vec::with_capacity(NEW_TOKENS);
    let start = Instant::now();
    while generated.len() < NEW_TOKENS && session.remaining() > 0 {
        let next = logits.argmax(1)?.to_vec1::<u32>()?[0];
        generated.push(next);
        logits = session.step(&[next])?;
    }

    let elapsed = start.elapsed();
    println!("Generated: {:?}", generated);
    println!(
        "{} steps in {:.2?} ({:.1} tok/s)",
        generated.len(),
        elapsed,
        generated.len() as f64 / elapsed.as_secs_f64()
    );

    Ok(())
}
