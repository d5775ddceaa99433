use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use wasm_sandbox::{ModuleInstance, Runtime, RuntimeConfig, SharedHeap};

#[derive(Parser)]
#[command(name = "wasm-sandbox")]
#[command(about = "Instantiate WASM modules and inspect their sandboxed memory layout")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Instantiate {
        #[arg(help = "Input WASM or WAT file")]
        input: PathBuf,

        #[arg(long, help = "App heap size in bytes (0 disables the heap)")]
        heap_size: Option<u32>,

        #[arg(long, help = "Attach a shared heap of this many bytes")]
        shared_heap_size: Option<u32>,

        #[arg(long, help = "Grow the default memory by this many pages")]
        grow: Option<u32>,

        #[arg(long, help = "Print the layout as JSON")]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Instantiate {
            input,
            heap_size,
            shared_heap_size,
            grow,
            json,
        } => {
            let wasm = read_wasm(&input)?;

            let mut config = RuntimeConfig::new();
            if let Some(size) = heap_size {
                config = config.with_heap_size(size);
            }
            let runtime = Runtime::new(config);

            let module = runtime
                .load(&wasm)
                .with_context(|| format!("Failed to load {}", input.display()))?;
            let inst = runtime
                .instantiate(&module)
                .context("Instantiation failed")?;
            tracing::info!(
                memories = inst.memory_count(),
                pages = inst.memory_size(),
                "instantiated {}",
                input.display()
            );

            let shared_heap = if let Some(size) = shared_heap_size {
                let heap = runtime
                    .create_shared_heap(size)
                    .context("Failed to create shared heap")?;
                inst.attach_shared_heap(Arc::clone(&heap))
                    .context("Failed to attach shared heap")?;
                tracing::info!(
                    start = heap.start_offset(),
                    size = heap.size(),
                    "attached shared heap"
                );
                Some(heap)
            } else {
                None
            };

            let grow_result = grow.map(|pages| {
                let result = inst.memory_grow(pages);
                if result < 0 {
                    tracing::warn!("growing memory 0 by {pages} pages failed");
                } else {
                    tracing::info!(previous_pages = result, "grew memory 0 by {pages} pages");
                }
                result
            });

            let layout = describe(&inst, shared_heap.as_deref(), grow_result);
            if json {
                println!("{}", serde_json::to_string_pretty(&layout)?);
            } else {
                print_layout(&input, &layout);
            }

            inst.deinstantiate();
        }
    }

    Ok(())
}

fn read_wasm(path: &Path) -> Result<Vec<u8>> {
    let contents = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

    if path.extension().is_some_and(|e| e == "wat") {
        wat::parse_bytes(&contents)
            .map(std::borrow::Cow::into_owned)
            .map_err(|e| anyhow::anyhow!("WAT parse error: {e}"))
    } else {
        Ok(contents)
    }
}

fn describe(
    inst: &ModuleInstance,
    shared_heap: Option<&SharedHeap>,
    grow_result: Option<i32>,
) -> serde_json::Value {
    let memories: Vec<_> = (0..inst.memory_count())
        .filter_map(|idx| u32::try_from(idx).ok())
        .filter_map(|idx| inst.memory(idx).ok())
        .map(|memory| {
            serde_json::json!({
                "pages": memory.page_count(),
                "max_pages": memory.max_page_count(),
                "shared": memory.is_shared(),
                "heap_base": memory.heap_base_offset(),
                "heap_size": memory.heap_size(),
            })
        })
        .collect();

    let unlinked: Vec<_> = inst
        .unlinked_imports()
        .into_iter()
        .map(|(module, name)| format!("{module}.{name}"))
        .collect();

    serde_json::json!({
        "memories": memories,
        "shared_heap": shared_heap.map(|heap| serde_json::json!({
            "start": heap.start_offset(),
            "size": heap.size(),
        })),
        "unlinked_imports": unlinked,
        "grow": grow_result,
    })
}

fn print_layout(input: &Path, layout: &serde_json::Value) {
    println!("{}", input.display());

    let memories = layout["memories"].as_array().map_or(&[][..], Vec::as_slice);
    if memories.is_empty() {
        println!("  no linear memory");
    }
    for (idx, memory) in memories.iter().enumerate() {
        println!(
            "  memory {idx}: {} pages (max {}){}",
            memory["pages"],
            memory["max_pages"],
            if memory["shared"] == true { ", shared" } else { "" }
        );
        if memory["heap_size"] != 0 {
            println!(
                "    app heap: base {:#x}, {} bytes",
                memory["heap_base"].as_u64().unwrap_or_default(),
                memory["heap_size"]
            );
        }
    }

    if let Some(heap) = layout["shared_heap"].as_object() {
        println!(
            "  shared heap: start {:#x}, {} bytes",
            heap["start"].as_u64().unwrap_or_default(),
            heap["size"]
        );
    }

    if let Some(unlinked) = layout["unlinked_imports"].as_array()
        && !unlinked.is_empty()
    {
        println!("  unlinked imports:");
        for name in unlinked {
            println!("    {}", name.as_str().unwrap_or_default());
        }
    }

    if let Some(result) = layout["grow"].as_i64() {
        if result < 0 {
            println!("  grow: failed");
        } else {
            println!("  grow: ok, previous size {result} pages");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_reports_heap_above_declared_pages() {
        let wasm = wat::parse_str("(module (import \"env\" \"f\" (func)) (memory 1 2))")
            .expect("wat");
        let runtime = Runtime::new(RuntimeConfig::new());
        let module = runtime.load(&wasm).expect("load");
        let inst = runtime.instantiate(&module).expect("instantiate");
        let grow = inst.memory_grow(1);

        let layout = describe(&inst, None, Some(grow));
        assert_eq!(layout["memories"][0]["pages"], 3);
        assert_eq!(layout["memories"][0]["heap_base"], 65536);
        assert_eq!(layout["unlinked_imports"][0], "env.f");
        assert_eq!(layout["grow"], 2);
        assert!(layout["shared_heap"].is_null());
    }
}
