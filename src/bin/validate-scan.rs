/// End-to-end validation tool
/// Tests: DirTree read → totals invariants → independent walk → cache round trip
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use rayon::prelude::*;

use dirstat_rs::tree::aggregate::verify_totals;
use dirstat_rs::tree::arena::{FileTree, NodeId};
use dirstat_rs::{DirTree, ReadConfig, ReadState};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dirstat_rs=info".parse()?),
        )
        .init();

    let scan_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║           DIRSTAT-RS SCAN VALIDATION TOOL                    ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Target: {}", scan_path.display());
    println!();

    // === STAGE 1: READ ===
    println!("┌─ STAGE 1: INCREMENTAL READ ────────────────────────────────┐");
    let mut tree = DirTree::new(ReadConfig::default());
    let start = Instant::now();
    tree.start_reading(&scan_path);
    let mut steps = 0u64;
    while tree.step() {
        steps += 1;
    }
    let read_duration = start.elapsed();

    let Some(top) = tree.first_toplevel() else {
        println!("  ✗ FAILED: {} could not be read", scan_path.display());
        return Ok(());
    };
    let totals = tree.totals(top);
    println!("  ✓ Read completed in {:.2}s ({} steps)", read_duration.as_secs_f64(), steps);
    println!(
        "  ✓ Items:    {} ({} dirs, {} files)",
        totals.items, totals.sub_dirs, totals.files
    );
    println!("  ✓ Total:    {:.2} GB", totals.size as f64 / 1_073_741_824.0);
    if totals.error_dirs > 0 {
        println!("  ⚠ {} directories could not be read", totals.error_dirs);
    }
    println!("└────────────────────────────────────────────────────────────┘");
    println!();

    // === STAGE 2: INVARIANTS ===
    println!("┌─ STAGE 2: TREE INVARIANTS ─────────────────────────────────┐");
    let mismatches = verify_totals(tree.nodes(), top);
    for mismatch in mismatches.iter().take(5) {
        println!(
            "  ✗ Totals of '{}' are stale: cached {} bytes, counted {}",
            tree.nodes().node_path(mismatch.node).display(),
            mismatch.actual.size,
            mismatch.expected.size
        );
    }
    let unfinished = tree
        .nodes()
        .node_ids()
        .filter(|&id| {
            matches!(
                tree.nodes().read_state(id),
                Some(ReadState::Queued | ReadState::Reading)
            )
        })
        .count();

    if !mismatches.is_empty() || unfinished > 0 {
        println!(
            "  ✗ FAILED: {} stale totals, {} directories never finished",
            mismatches.len(),
            unfinished
        );
        return Ok(());
    }
    println!("  ✓ Cached totals match a full recount");
    println!("  ✓ Every directory reached a final read state");
    println!("└────────────────────────────────────────────────────────────┘");
    println!();

    // === STAGE 3: INDEPENDENT WALK ===
    println!("┌─ STAGE 3: JWALK CROSS-CHECK ───────────────────────────────┐");
    let start = Instant::now();
    let (walk_files, walk_bytes) = independent_walk(&tree.url().unwrap_or(scan_path));
    let walk_duration = start.elapsed();
    let (tree_files, tree_bytes) = readable_files(tree.nodes(), top);

    println!("  ✓ Walked in {:.2}s", walk_duration.as_secs_f64());
    println!("    tree:  {} files, {} bytes", tree_files, tree_bytes);
    println!("    jwalk: {} files, {} bytes", walk_files, walk_bytes);
    if (tree_files, tree_bytes) == (walk_files, walk_bytes) {
        println!("  ✓ File counts and sizes agree");
    } else {
        println!("  ⚠ Counts differ (the filesystem may have changed during the scan)");
    }
    println!("└────────────────────────────────────────────────────────────┘");
    println!();

    // === STAGE 4: CACHE ROUND TRIP ===
    println!("┌─ STAGE 4: CACHE ROUND TRIP ────────────────────────────────┐");
    let mut cache_duration = 0.0;
    for name in ["validate-scan.cache", "validate-scan.cache.gz"] {
        let path = std::env::temp_dir().join(format!("{}-{}", std::process::id(), name));
        let start = Instant::now();
        let result = cache_round_trip(&tree, &path);
        cache_duration += start.elapsed().as_secs_f64();
        let _ = std::fs::remove_file(&path);

        match result {
            Ok((written, reloaded)) if reloaded == totals => {
                println!("  ✓ {}: {} entries, totals identical", name, written);
            }
            Ok((_, reloaded)) => {
                println!("  ✗ FAILED: {} reloaded as {:?}", name, reloaded);
                return Ok(());
            }
            Err(e) => {
                println!("  ✗ FAILED: {}: {:#}", name, e);
                return Ok(());
            }
        }
    }
    println!("└────────────────────────────────────────────────────────────┘");
    println!();

    // === FINAL SUMMARY ===
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                    ✓ ALL CHECKS PASSED                       ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Pipeline summary:");
    println!("  • Read:         {:.2}s", read_duration.as_secs_f64());
    println!("  • Cross-check:  {:.2}s", walk_duration.as_secs_f64());
    println!("  • Cache:        {:.2}s", cache_duration);

    Ok(())
}

/// Count regular files and their sizes with jwalk, staying on the device of `root`.
fn independent_walk(root: &Path) -> (u64, u64) {
    let paths: Vec<PathBuf> = jwalk::WalkDir::new(root)
        .skip_hidden(false)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| !e.file_type().is_dir())
        .map(|e| e.path())
        .collect();

    let root_device = device_of(root);
    paths
        .par_iter()
        .filter_map(|path| std::fs::symlink_metadata(path).ok())
        .filter(|md| device_of_metadata(md) == root_device)
        .map(|md| (1, md.len()))
        .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1))
}

#[cfg(unix)]
fn device_of_metadata(md: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    md.dev()
}

#[cfg(not(unix))]
fn device_of_metadata(_md: &std::fs::Metadata) -> u64 {
    0
}

fn device_of(path: &Path) -> u64 {
    std::fs::metadata(path)
        .map(|md| device_of_metadata(&md))
        .unwrap_or(0)
}

/// Non-directory nodes that were stat()ed successfully, and their sizes.
fn readable_files(tree: &FileTree, top: NodeId) -> (u64, u64) {
    let mut stack = vec![top];
    let mut count = 0;
    let mut bytes = 0;
    while let Some(id) = stack.pop() {
        let node = tree.get(id);
        if node.dir_info().is_some() {
            stack.extend(tree.entries(id));
        } else if !node.read_error {
            count += 1;
            bytes += node.size;
        }
    }
    (count, bytes)
}

fn cache_round_trip(tree: &DirTree, path: &Path) -> anyhow::Result<(u64, dirstat_rs::Totals)> {
    let written = tree.write_cache(path)?;
    let mut reloaded = DirTree::new(ReadConfig::default().with_local_dir_reader(false));
    reloaded.read_cache(path)?;
    reloaded.run_to_completion();
    let top = reloaded
        .first_toplevel()
        .context("cache file produced an empty tree")?;
    Ok((written, reloaded.totals(top)))
}
