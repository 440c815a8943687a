#![cfg(unix)]

mod support;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, mpsc};

use bootforge::config::ConfigDoc;
use bootforge::error::ErrorKind;
use bootforge::executor::{ChannelSink, ExecCtx, RunOptions};
use bootforge::modules::Pipeline;
use bootforge::workspace::PackagePaths;

/// A `patch` stand-in: appends each patch body to `log` and fails on "FAIL".
fn write_stub_patch(path: &Path, log: &Path) {
    let script = format!(
        "#!/bin/sh\nbody=$(cat)\nprintf '%s %s\\n' \"$1\" \"$body\" >> '{}'\ncase \"$body\" in *FAIL*) exit 1 ;; esac\nexit 0\n",
        log.display()
    );
    fs::write(path, script).expect("write stub");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod stub");
}

fn spec(series: &[&str], tool: &Path) -> ConfigDoc {
    let series = series
        .iter()
        .map(|s| format!("\"{s}\""))
        .collect::<Vec<_>>()
        .join(", ");
    ConfigDoc::from_str(
        "<mem>",
        &format!(
            r#"
[target]
name = "demo"
kind = "kernel"
require_pins = false

[container]

[source]
url = "http://127.0.0.1:9/demo-1.0.tar.gz"

[patches]
series = [{series}]
tool = "{}"

[build]
targets = ["all"]

[[collect.artifacts]]
path = "out.bin"
dest = "demo/out.bin"
"#,
            tool.display()
        ),
    )
    .expect("doc")
}

fn apply(doc: &ConfigDoc, pkg: &Path, work: &Path) -> (bootforge::Result<()>, Vec<String>) {
    let reg = Pipeline::Driver.registry().expect("registry");
    let exec = reg.get("patches.apply").expect("patches.apply registered");
    let (tx, rx) = mpsc::channel();
    let mut opts = RunOptions::new(PackagePaths::new(pkg));
    opts.work_dir = work.to_path_buf();
    let mut ctx = ExecCtx::new(false, Arc::new(ChannelSink::new(tx)), opts);
    ctx.set_task("patches.apply");
    let res = exec(doc, &mut ctx);
    drop(ctx);
    (res, support::log_lines(&rx.try_iter().collect::<Vec<_>>()))
}

#[test]
fn patching_stops_at_first_failure() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let pkg = tmp.path().join("pkg");
    let work = tmp.path().join("work");
    fs::create_dir_all(pkg.join("patches")).expect("mkdir patches");
    fs::create_dir_all(work.join("demo-1.0")).expect("mkdir src");
    fs::write(pkg.join("patches/a.patch"), "A ok").expect("write a");
    fs::write(pkg.join("patches/b.patch"), "B FAIL").expect("write b");
    fs::write(pkg.join("patches/c.patch"), "C ok").expect("write c");
    let log = tmp.path().join("applied.log");
    let tool = tmp.path().join("patch-stub");
    write_stub_patch(&tool, &log);

    let doc = spec(
        &["patches/a.patch", "patches/b.patch", "patches/c.patch"],
        &tool,
    );
    let (res, lines) = apply(&doc, &pkg, &work);

    let err = res.expect_err("b must fail");
    assert_eq!(err.kind(), ErrorKind::Subprocess);
    assert!(err.to_string().contains("patches/b.patch"), "{err}");

    let applied = fs::read_to_string(&log).expect("read log");
    assert_eq!(applied, "-p1 A ok\n-p1 B FAIL\n");
    assert!(lines.iter().any(|l| l.contains("patches/b.patch")));
    assert!(!lines.iter().any(|l| l.contains("patches/c.patch")));
}

#[test]
fn empty_series_is_a_noop() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let missing_tool = tmp.path().join("no-such-patch");
    let doc = spec(&[], &missing_tool);
    // No source tree either: nothing may be touched.
    let (res, lines) = apply(&doc, tmp.path(), &tmp.path().join("work"));
    res.expect("empty series");
    assert_eq!(lines, ["no patches declared"]);
}

#[test]
fn patches_apply_in_declared_order() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let pkg = tmp.path().join("pkg");
    let work = tmp.path().join("work");
    fs::create_dir_all(&pkg).expect("mkdir pkg");
    fs::create_dir_all(work.join("demo-1.0")).expect("mkdir src");
    // Declared order differs from lexical order.
    fs::write(pkg.join("zz.patch"), "first").expect("write zz");
    fs::write(pkg.join("aa.patch"), "second").expect("write aa");
    let log = tmp.path().join("applied.log");
    let tool = tmp.path().join("patch-stub");
    write_stub_patch(&tool, &log);

    let (res, _) = apply(&spec(&["zz.patch", "aa.patch"], &tool), &pkg, &work);
    res.expect("apply");
    assert_eq!(
        fs::read_to_string(&log).expect("read log"),
        "-p1 first\n-p1 second\n"
    );
}
