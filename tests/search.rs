//! End-to-end searches: parsed command lines driven through the evaluator
//! against real temporary trees, with captured output.

use std::fs;
use std::path::Path;

use bfind_cli::parse_args;
use bfind_eval::{evaluate, OutFile};

struct Outcome {
    status: i32,
    stdout: String,
    stderr: String,
}

fn bfind(args: &[&str]) -> Outcome {
    let args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
    let (cout, out) = OutFile::memory();
    let (cerr, err) = OutFile::memory();
    let ctx = parse_args(&args, cout, cerr).expect("command line parses");
    let status = evaluate(&ctx);
    Outcome {
        status,
        stdout: out.text(),
        stderr: err.text(),
    }
}

fn line_position(outcome: &Outcome, suffix: &str) -> usize {
    outcome
        .stdout
        .lines()
        .position(|line| line.ends_with(suffix))
        .unwrap_or_else(|| panic!("no output line ends with '{suffix}'"))
}

#[test]
fn shallow_matches_come_first() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("root");
    fs::create_dir_all(root.join("deep/1/2/3/4")).expect("mkdir");
    fs::create_dir_all(root.join("shallow")).expect("mkdir");
    fs::write(root.join("shallow/needle"), b"").expect("write");

    // The named search finds exactly the needle.
    let named = bfind(&[root.to_str().unwrap(), "-name", "needle"]);
    assert_eq!(named.status, 0);
    assert_eq!(named.stdout.lines().count(), 1);
    assert!(named.stdout.trim_end().ends_with("shallow/needle"));

    // Breadth-first order: the needle appears before anything under deep/1/2.
    let all = bfind(&[root.to_str().unwrap()]);
    let needle = line_position(&all, "shallow/needle");
    let deep = line_position(&all, "deep/1/2");
    assert!(needle < deep, "needle printed after the deep subtree");
}

#[test]
fn prune_hides_the_subtree() {
    let temp = tempfile::tempdir().expect("tempdir");
    let a = temp.path().join("a");
    fs::create_dir_all(a.join("b")).expect("mkdir");
    fs::write(a.join("b/c"), b"").expect("write");
    fs::write(a.join("d"), b"").expect("write");

    let outcome = bfind(&[a.to_str().unwrap(), "-name", "b", "-prune", "-o", "-print"]);
    assert_eq!(outcome.status, 0);

    let mut lines: Vec<&str> = outcome.stdout.lines().collect();
    lines.sort_unstable();
    let expected = vec![
        a.to_str().unwrap().to_string(),
        a.join("d").to_str().unwrap().to_string(),
    ];
    assert_eq!(
        lines,
        expected.iter().map(String::as_str).collect::<Vec<_>>()
    );
    assert!(!outcome.stdout.contains("b/c"));
}

#[test]
fn maxdepth_stops_the_descent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("root");
    fs::create_dir_all(root.join("x/y")).expect("mkdir");

    let outcome = bfind(&[root.to_str().unwrap(), "-maxdepth", "1"]);
    assert_eq!(outcome.status, 0);

    let mut lines: Vec<&str> = outcome.stdout.lines().collect();
    lines.sort_unstable();
    let expected = vec![
        root.to_str().unwrap().to_string(),
        root.join("x").to_str().unwrap().to_string(),
    ];
    assert_eq!(
        lines,
        expected.iter().map(String::as_str).collect::<Vec<_>>()
    );
}

#[test]
fn exit_status_comes_from_the_expression() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("anything"), b"").expect("write");

    let outcome = bfind(&[
        temp.path().to_str().unwrap(),
        "-name",
        "zzz-never-matches",
        "-o",
        "-exit",
        "7",
    ]);
    assert_eq!(outcome.status, 7);
}

#[test]
fn xargs_safe_rejects_awkward_paths() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("has space"), b"").expect("write");

    let outcome = bfind(&["--xargs-safe", temp.path().to_str().unwrap()]);
    assert_eq!(outcome.status, 1);
    assert!(outcome.stderr.contains("has space"));
    assert!(!outcome.stdout.contains("has space"));
}

#[test]
fn vanished_files_are_tolerated_when_asked() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("victim"), b"payload").expect("write");

    // Delete each regular file mid-visit, then stat it again: the second
    // look races with the deletion exactly like a concurrent rm would.
    let vanish = [
        "--ignore-races",
        temp.path().to_str().unwrap(),
        "-type",
        "f",
        "(",
        "-delete",
        ",",
        "-size",
        "+0c",
        ")",
    ];
    let outcome = bfind(&vanish);
    assert_eq!(outcome.status, 0, "stderr: {}", outcome.stderr);
    assert!(outcome.stderr.is_empty());
    assert!(!temp.path().join("victim").exists());
}

#[test]
fn depth_mode_prints_contents_before_directories() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("root");
    fs::create_dir_all(root.join("dir")).expect("mkdir");
    fs::write(root.join("dir/file"), b"").expect("write");

    let outcome = bfind(&["-d", root.to_str().unwrap()]);
    assert_eq!(outcome.status, 0);
    let file = line_position(&outcome, "dir/file");
    let dir = line_position(&outcome, "dir");
    let top = line_position(&outcome, "root");
    assert!(file < dir);
    assert!(dir < top);
}

#[test]
fn print0_terminates_with_nul_bytes() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("only"), b"").expect("write");

    let outcome = bfind(&[
        temp.path().to_str().unwrap(),
        "-name",
        "only",
        "-print0",
    ]);
    assert_eq!(outcome.status, 0);
    assert!(outcome.stdout.ends_with('\0'));
}

#[test]
fn hard_links_collapse_under_unique() {
    let temp = tempfile::tempdir().expect("tempdir");
    let original = temp.path().join("original");
    fs::write(&original, b"data").expect("write");
    fs::hard_link(&original, temp.path().join("alias")).expect("link");

    let outcome = bfind(&[
        "--unique",
        temp.path().to_str().unwrap(),
        "-type",
        "f",
    ]);
    assert_eq!(outcome.status, 0);
    assert_eq!(outcome.stdout.lines().count(), 1);
}

#[test]
fn exec_batches_flush_after_the_traversal() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("root");
    fs::create_dir(&root).expect("mkdir");
    fs::write(root.join("one"), b"").expect("write");
    fs::write(root.join("two"), b"").expect("write");

    let log = temp.path().join("log");
    let script = format!("echo \"$@\" >> {}", log.display());
    let outcome = bfind(&[
        root.to_str().unwrap(),
        "-type",
        "f",
        "-exec",
        "sh",
        "-c",
        &script,
        "sh",
        "{}",
        "+",
    ]);
    assert_eq!(outcome.status, 0, "stderr: {}", outcome.stderr);

    let logged = fs::read_to_string(&log).expect("exec ran");
    assert!(logged.contains("one"));
    assert!(logged.contains("two"));
}

#[test]
fn ls_lines_carry_mode_and_size(){
    let temp = tempfile::tempdir().expect("tempdir");
    let target = temp.path().join("listing");
    fs::write(&target, b"12345").expect("write");

    let outcome = bfind(&[target.to_str().unwrap(), "-ls"]);
    assert_eq!(outcome.status, 0);
    let line = outcome.stdout.lines().next().expect("one line");
    assert!(line.contains("-rw"));
    assert!(line.contains('5'));
    assert!(line.ends_with("listing"));
}

#[test]
fn printf_renders_per_file_fields() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("root");
    fs::create_dir(&root).expect("mkdir");
    fs::write(root.join("data"), b"xyz").expect("write");

    let outcome = bfind(&[
        root.to_str().unwrap(),
        "-type",
        "f",
        "-printf",
        "%f:%s:%y\\n",
    ]);
    assert_eq!(outcome.status, 0);
    assert_eq!(outcome.stdout, "data:3:f\n");
}

#[test]
fn symlinks_resolve_under_logical_mode() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("root");
    fs::create_dir_all(root.join("real")).expect("mkdir");
    fs::write(root.join("real/inside"), b"").expect("write");
    std::os::unix::fs::symlink(root.join("real"), root.join("alias")).expect("symlink");

    // Physical walk: the alias is a symlink, nothing under it is visited.
    let physical = bfind(&[root.to_str().unwrap(), "-name", "inside"]);
    assert_eq!(physical.stdout.lines().count(), 1);

    // Logical walk: the alias is a directory too.
    let logical = bfind(&["-L", root.to_str().unwrap(), "-name", "inside"]);
    assert_eq!(logical.stdout.lines().count(), 2);
}

#[test]
fn fprint_writes_to_its_own_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("root");
    fs::create_dir(&root).expect("mkdir");
    fs::write(root.join("inside"), b"").expect("write");
    let output = temp.path().join("out.txt");

    let outcome = bfind(&[
        root.to_str().unwrap(),
        "-name",
        "inside",
        "-fprint",
        output.to_str().unwrap(),
    ]);
    assert_eq!(outcome.status, 0);
    assert!(outcome.stdout.is_empty());

    let written = fs::read_to_string(&output).expect("fprint file");
    assert!(written.trim_end().ends_with("inside"));
}

fn tree_with(paths: &[&str], root: &Path) {
    for rel in paths {
        let full = root.join(rel);
        fs::create_dir_all(full.parent().expect("parent")).expect("mkdir");
        fs::write(full, b"").expect("write");
    }
}

#[test]
fn mindepth_and_maxdepth_bound_the_window() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("root");
    tree_with(&["a/b/c/d"], &root);

    let outcome = bfind(&[
        root.to_str().unwrap(),
        "-mindepth",
        "2",
        "-maxdepth",
        "3",
    ]);
    let mut seen: Vec<String> = outcome
        .stdout
        .lines()
        .map(|line| line.trim_start_matches(root.to_str().unwrap()).to_string())
        .collect();
    seen.sort();
    assert_eq!(seen, vec!["/a/b".to_string(), "/a/b/c".to_string()]);
}
