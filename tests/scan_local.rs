use std::fs;
use std::path::Path;

use dirstat_rs::tree::aggregate::verify_totals;
use dirstat_rs::{DirTree, ReadConfig, ReadState, ScanWorker, TreeEvent};

fn populate(root: &Path) {
    fs::create_dir_all(root.join("docs/drafts")).unwrap();
    fs::create_dir_all(root.join("empty")).unwrap();
    fs::write(root.join("readme.txt"), vec![b'r'; 1000]).unwrap();
    fs::write(root.join("docs/a.md"), vec![b'a'; 300]).unwrap();
    fs::write(root.join("docs/drafts/b with space.md"), vec![b'b'; 200]).unwrap();
    fs::write(root.join("docs/drafts/100%.txt"), vec![b'c'; 50]).unwrap();
}

/// Sum of the sizes of all regular files below `root`, measured directly.
fn file_bytes(tree: &DirTree) -> u64 {
    let nodes = tree.nodes();
    nodes
        .node_ids()
        .map(|id| nodes.get(id))
        .filter(|node| node.dir_info().is_none())
        .map(|node| node.size)
        .sum()
}

#[test]
fn reads_a_real_directory_tree() {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path());

    let mut tree = DirTree::new(ReadConfig::default());
    let events = tree.subscribe();
    tree.start_reading(dir.path());
    tree.run_to_completion();

    let top = tree.first_toplevel().unwrap();
    let totals = tree.totals(top);
    assert_eq!(totals.files, 4);
    assert_eq!(totals.sub_dirs, 3);
    assert_eq!(totals.items, 7);
    assert_eq!(file_bytes(&tree), 1550);
    assert!(totals.size >= 1550);
    assert!(verify_totals(tree.nodes(), top).is_empty());
    assert_eq!(tree.nodes().read_state(top), Some(ReadState::Finished));

    let events: Vec<TreeEvent> = events.try_iter().collect();
    assert_eq!(events.iter().filter(|e| **e == TreeEvent::Finished).count(), 1);
    let root = tree.root();
    let finished_dirs = events
        .iter()
        .filter(|e| matches!(e, TreeEvent::ReadJobFinished(id) if *id != root))
        .count();
    assert_eq!(finished_dirs, 4);
}

#[test]
fn cache_files_reproduce_the_scan() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    populate(&data);

    let mut tree = DirTree::new(ReadConfig::default());
    tree.start_reading(&data);
    tree.run_to_completion();
    let expected = tree.totals(tree.first_toplevel().unwrap());

    for name in ["scan.cache", "scan.cache.gz"] {
        let cache = dir.path().join(name);
        assert_eq!(tree.write_cache(&cache).unwrap(), 8);

        // Reading a cache needs no filesystem access beyond the file itself
        let mut loaded = DirTree::new(ReadConfig::default().with_local_dir_reader(false));
        loaded.read_cache(&cache).unwrap();
        loaded.run_to_completion();

        let top = loaded.first_toplevel().unwrap();
        assert_eq!(loaded.url(), tree.url());
        assert_eq!(loaded.totals(top), expected);
        assert!(verify_totals(loaded.nodes(), top).is_empty());
    }

    let compressed = fs::read(dir.path().join("scan.cache.gz")).unwrap();
    assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
    let plain = fs::read_to_string(dir.path().join("scan.cache")).unwrap();
    assert!(plain.starts_with("[dirstat-rs 1.0 cache file]"));
    assert!(plain.contains("F b%20with%20space.md 200 "));
    assert!(plain.contains("F 100%25.txt 50 "));
}

#[test]
fn refresh_picks_up_changes_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path());

    let mut tree = DirTree::new(ReadConfig::default());
    tree.start_reading(dir.path());
    tree.run_to_completion();
    let before = file_bytes(&tree);

    let docs = tree
        .nodes()
        .node_ids()
        .find(|&id| tree.nodes().get(id).name == "docs")
        .unwrap();
    fs::write(dir.path().join("docs/new.bin"), vec![0u8; 4096]).unwrap();
    fs::remove_file(dir.path().join("docs/drafts/100%.txt")).unwrap();

    tree.refresh(Some(docs));
    tree.run_to_completion();
    assert_eq!(file_bytes(&tree), before + 4096 - 50);
    let top = tree.first_toplevel().unwrap();
    assert!(verify_totals(tree.nodes(), top).is_empty());
}

#[cfg(unix)]
#[test]
fn unreadable_directories_are_reported() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    populate(dir.path());
    let locked = dir.path().join("empty");
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
    // Root can list anything; nothing to check then
    let listable = fs::read_dir(&locked).is_ok();

    let mut tree = DirTree::new(ReadConfig::default());
    tree.start_reading(dir.path());
    tree.run_to_completion();
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

    if !listable {
        let top = tree.first_toplevel().unwrap();
        assert_eq!(tree.totals(top).error_dirs, 1);
    }
}

#[cfg(unix)]
#[test]
fn names_that_are_not_utf8_survive_refresh_and_cache() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    fs::create_dir_all(&data).unwrap();
    let odd = data.join(OsStr::from_bytes(b"caf\xE9"));
    if fs::create_dir(&odd).is_err() {
        // The filesystem insists on UTF-8 names
        return;
    }
    fs::write(odd.join("f"), vec![b'f'; 500]).unwrap();

    let mut tree = DirTree::new(ReadConfig::default());
    tree.start_reading(&data);
    tree.run_to_completion();
    let sub = tree
        .nodes()
        .node_ids()
        .find(|&id| tree.nodes().node_path(id) == odd)
        .unwrap();
    assert_eq!(tree.nodes().get(sub).name, "caf\u{FFFD}");

    fs::write(odd.join("g"), vec![b'g'; 20]).unwrap();
    tree.refresh(Some(sub));
    tree.run_to_completion();
    let top = tree.first_toplevel().unwrap();
    assert_eq!(tree.totals(top).files, 2);
    assert_eq!(file_bytes(&tree), 520);

    let cache = dir.path().join("odd.cache");
    tree.write_cache(&cache).unwrap();
    let text = fs::read_to_string(&cache).unwrap();
    assert!(text.contains("D caf%E9 "));

    let mut loaded = DirTree::new(ReadConfig::default().with_local_dir_reader(false));
    loaded.read_cache(&cache).unwrap();
    loaded.run_to_completion();
    assert!(loaded
        .nodes()
        .node_ids()
        .any(|id| loaded.nodes().node_path(id) == odd));
    assert_eq!(file_bytes(&loaded), 520);
}

#[test]
fn background_worker_reports_completion() {
    let dir = tempfile::tempdir().unwrap();
    populate(dir.path());

    let worker = ScanWorker::spawn(DirTree::new(ReadConfig::default())).unwrap();
    worker.start_reading(dir.path()).unwrap();
    loop {
        match worker.next_event(std::time::Duration::from_secs(10)) {
            Some(TreeEvent::Finished) => break,
            Some(_) => {}
            None => panic!("worker did not finish"),
        }
    }
    let tree = worker.shutdown().unwrap();
    assert_eq!(file_bytes(&tree), 1550);
}
