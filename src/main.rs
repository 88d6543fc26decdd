use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use dirstat_rs::config::CliArgs;
use dirstat_rs::report;
use dirstat_rs::{DirTree, ReadState, ScanWorker, TreeEvent};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("dirstat_rs=warn".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();
    let config = args.read_config()?;
    let tree = DirTree::new(config);

    let start = Instant::now();
    let tree = if args.background {
        read_in_background(tree, &args)?
    } else {
        read_in_foreground(tree, &args)?
    };
    let elapsed = start.elapsed();

    print_report(&tree, &args, elapsed)?;

    if let Some(out) = &args.write_cache {
        let count = tree
            .write_cache(out)
            .with_context(|| format!("Failed to write cache file {}", out.display()))?;
        eprintln!("Wrote {} entries to {}", count, out.display());
    }
    Ok(())
}

fn scan_path(args: &CliArgs) -> PathBuf {
    args.path.clone().unwrap_or_else(|| PathBuf::from("."))
}

fn read_in_foreground(mut tree: DirTree, args: &CliArgs) -> Result<DirTree> {
    let events = tree.subscribe();
    match &args.read_cache {
        Some(cache) => tree
            .read_cache(cache)
            .with_context(|| format!("Failed to open cache file {}", cache.display()))?,
        None => tree.start_reading(scan_path(args)),
    }

    while tree.step() {
        for event in events.try_iter() {
            if let TreeEvent::ProgressInfo(text) = event {
                eprintln!("{}", text);
            }
        }
    }
    Ok(tree)
}

fn read_in_background(tree: DirTree, args: &CliArgs) -> Result<DirTree> {
    let worker = ScanWorker::spawn(tree)?;
    match &args.read_cache {
        Some(cache) => worker
            .read_cache(cache.clone())
            .with_context(|| format!("Failed to open cache file {}", cache.display()))?,
        None => worker.start_reading(scan_path(args))?,
    }

    loop {
        match worker.next_event(Duration::from_millis(500)) {
            Some(TreeEvent::Finished | TreeEvent::Aborted) => break,
            Some(TreeEvent::ProgressInfo(text)) => eprintln!("{}", text),
            Some(_) => {}
            None => {
                let (nodes, busy) = worker.inspect(|tree| (tree.nodes().len(), tree.is_busy()))?;
                if !busy {
                    break;
                }
                eprintln!("  ... {} entries so far", nodes);
            }
        }
    }
    worker.shutdown()
}

fn print_report(tree: &DirTree, args: &CliArgs, elapsed: Duration) -> Result<()> {
    let top = tree.first_toplevel().context("Nothing was read")?;
    let summary = report::build_summary(tree.nodes(), top);

    println!("{}", summary.full_path);
    println!(
        "  Size:       {} ({} allocated)",
        summary.size_display, summary.allocated_display
    );
    println!(
        "  Items:      {} ({} files, {} directories)",
        summary.items, summary.files, summary.sub_dirs
    );
    if summary.error_dirs > 0 {
        println!("  Unreadable: {} directories", summary.error_dirs);
    }
    if let Some(state) = summary.state.filter(|s| *s != ReadState::Finished) {
        println!("  State:      {}", report::state_label(state));
    }
    if summary.read_error {
        println!("  (the toplevel itself could not be read)");
    }
    println!("  Read in {:.2}s", elapsed.as_secs_f64());
    println!();

    for line in report::largest_children(tree.nodes(), top, args.top) {
        println!("{}", line);
    }
    Ok(())
}
