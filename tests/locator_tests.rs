//! Library search against real on-disk layouts.

#![cfg(unix)]

use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use gpu_probe::discovery::locator::{
    find_libraries, resolve_links, search_patterns, MAX_LINK_HOPS,
};

/// A temp dir and its canonical path. Results are canonical, and the temp
/// root itself may sit behind a symlink.
fn scratch() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(dir.path()).unwrap();
    (dir, root)
}

/// libfoo.so -> libfoo.so.1 -> libfoo.so.1.2.3
fn versioned_layout(dir: &Path) {
    fs::write(dir.join("libfoo.so.1.2.3"), b"not really a library").unwrap();
    symlink("libfoo.so.1.2.3", dir.join("libfoo.so.1")).unwrap();
    symlink("libfoo.so.1", dir.join("libfoo.so")).unwrap();
}

fn pattern(dir: &Path, name: &str) -> String {
    dir.join(name).to_string_lossy().into_owned()
}

#[test]
fn test_symlink_chain_resolves_to_one_file() {
    let (_dir, root) = scratch();
    versioned_layout(&root);

    let found = find_libraries("libfoo.so", &[pattern(&root, "libfoo.so*")]);
    assert_eq!(found, vec![root.join("libfoo.so.1.2.3")]);
}

#[test]
fn test_overlapping_patterns_are_deduplicated() {
    let (_dir, root) = scratch();
    versioned_layout(&root);

    let patterns = vec![
        pattern(&root, "libfoo.so.1"),
        pattern(&root, "libfoo.so*"),
        pattern(&root, "libfoo.so"),
    ];
    let found = find_libraries("libfoo.so", &patterns);
    assert_eq!(found.len(), 1);
}

#[test]
fn test_directory_symlink_alias_is_deduplicated() {
    // Merged-/usr style layout: lib -> lib64.
    let (_dir, root) = scratch();
    let lib64 = root.join("lib64");
    fs::create_dir(&lib64).unwrap();
    fs::write(lib64.join("libfoo.so.1"), b"").unwrap();
    symlink("lib64", root.join("lib")).unwrap();

    let patterns = vec![
        pattern(&lib64, "libfoo.so*"),
        pattern(&root.join("lib"), "libfoo.so*"),
    ];
    let found = find_libraries("libfoo.so", &patterns);
    assert_eq!(found, vec![lib64.join("libfoo.so.1")]);

    // Alias listed first still reports the real location.
    let found = find_libraries("libfoo.so", &[pattern(&root.join("lib"), "libfoo.so*")]);
    assert_eq!(found, vec![lib64.join("libfoo.so.1")]);
}

#[test]
fn test_results_follow_pattern_order() {
    let (_first, first) = scratch();
    let (_second, second) = scratch();
    fs::write(first.join("libbar.so.2"), b"").unwrap();
    fs::write(second.join("libbar.so.1"), b"").unwrap();

    let found = find_libraries(
        "libbar.so",
        &[pattern(&second, "libbar.so*"), pattern(&first, "libbar.so*")],
    );
    assert_eq!(found, vec![second.join("libbar.so.1"), first.join("libbar.so.2")]);
}

#[test]
fn test_link_cycle_is_dropped() {
    let (_dir, root) = scratch();
    symlink("libloop.so.b", root.join("libloop.so.a")).unwrap();
    symlink("libloop.so.a", root.join("libloop.so.b")).unwrap();
    fs::write(root.join("libloop.so.real"), b"").unwrap();

    assert_eq!(resolve_links(&root.join("libloop.so.a")), None);

    let found = find_libraries("libloop.so", &[pattern(&root, "libloop.so*")]);
    assert_eq!(found, vec![root.join("libloop.so.real")]);
}

#[test]
fn test_long_chain_within_bound_resolves() {
    let (_dir, root) = scratch();
    fs::write(root.join("link0"), b"").unwrap();
    for i in 1..=MAX_LINK_HOPS {
        symlink(format!("link{}", i - 1), root.join(format!("link{i}"))).unwrap();
    }

    let top = root.join(format!("link{MAX_LINK_HOPS}"));
    assert_eq!(resolve_links(&top), Some(root.join("link0")));

    symlink(
        format!("link{MAX_LINK_HOPS}"),
        root.join(format!("link{}", MAX_LINK_HOPS + 1)),
    )
    .unwrap();
    let too_long = root.join(format!("link{}", MAX_LINK_HOPS + 1));
    assert_eq!(resolve_links(&too_long), None);
}

#[test]
fn test_absolute_link_target() {
    let (_lib_dir, lib_root) = scratch();
    let (_link_dir, link_root) = scratch();
    let real = lib_root.join("libnvidia-ml.so.550.54");
    fs::write(&real, b"").unwrap();
    symlink(&real, link_root.join("libnvidia-ml.so.1")).unwrap();

    let found = find_libraries("libnvidia-ml.so", &[pattern(&link_root, "libnvidia-ml.so*")]);
    assert_eq!(found, vec![real]);
}

#[test]
fn test_search_path_with_glob_metacharacters() {
    let (_dir, root) = scratch();
    let dir = root.join("cuda[12]");
    fs::create_dir(&dir).unwrap();
    fs::write(dir.join("libcudart.so.12"), b"").unwrap();

    let patterns = search_patterns("libcudart.so", &[], Some(dir.as_os_str()));
    let found = find_libraries("libcudart.so", &patterns);
    assert_eq!(found, vec![dir.join("libcudart.so.12")]);
}

#[test]
fn test_nothing_found_is_empty() {
    let (_dir, root) = scratch();
    let patterns = search_patterns("librocm_smi64.so", &[], Some(OsStr::new(&root)));
    assert!(find_libraries("librocm_smi64.so", &patterns).is_empty());
}
