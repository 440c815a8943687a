#![cfg(unix)]

mod support;

use std::fs;
use std::path::Path;

use bootforge::config::ConfigDoc;
use bootforge::error::ErrorKind;
use bootforge::modules::util::sha256_file_hex;

/// A `make` stand-in. Each call appends `<cwd>|<argv>|<env>` to `log`; a
/// `*_defconfig` goal writes a small .config and `olddefconfig` snapshots it.
fn write_stub_make(path: &Path, log: &Path) {
    support::write_script(
        path,
        &format!(
            r#"printf '%s|%s|ARCH=%s|CROSS_COMPILE=%s|SOURCE_DATE_EPOCH=%s|KBUILD_BUILD_USER=%s\n' "$(basename "$PWD")" "$*" "$ARCH" "$CROSS_COMPILE" "$SOURCE_DATE_EPOCH" "$KBUILD_BUILD_USER" >> '{}'
for goal in "$@"; do
  case "$goal" in
    *_defconfig) printf 'CONFIG_A=y\n# CONFIG_B is not set\n' > .config ;;
    olddefconfig) cp .config .config.normalized-from ;;
    all) printf 'built\n' > u-boot.bin ;;
  esac
done
"#,
            log.display()
        ),
    );
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .expect("read log")
        .lines()
        .map(str::to_string)
        .collect()
}

struct Tree {
    _tmp: tempfile::TempDir,
    root: std::path::PathBuf,
    pkg: std::path::PathBuf,
    work: std::path::PathBuf,
    out: std::path::PathBuf,
    make: std::path::PathBuf,
    log: std::path::PathBuf,
}

impl Tree {
    fn new() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().to_path_buf();
        let tree = Self {
            pkg: root.join("pkg"),
            work: root.join("work"),
            out: root.join("out"),
            make: root.join("bin/make"),
            log: root.join("make.log"),
            root,
            _tmp: tmp,
        };
        fs::create_dir_all(&tree.pkg).expect("mkdir pkg");
        fs::create_dir_all(tree.work.join("demo-1.0")).expect("mkdir src");
        write_stub_make(&tree.make, &tree.log);
        tree
    }

    fn src(&self) -> std::path::PathBuf {
        self.work.join("demo-1.0")
    }
}

fn spec(kind: &str, make: &Path, extra: &str) -> ConfigDoc {
    ConfigDoc::from_str(
        "<mem>",
        &format!(
            r#"
[target]
name = "demo"
kind = "{kind}"
require_pins = false

[container]

[source]
url = "http://127.0.0.1:9/demo-1.0.tar.gz"

[build]
targets = ["all"]
jobs = 1
tool = "{}"

[[collect.artifacts]]
path = "u-boot.bin"
dest = "demo/u-boot.bin"
{extra}
"#,
            make.display()
        ),
    )
    .expect("doc")
}

#[test]
fn kconfig_runs_defconfig_then_overlay_then_normalize() {
    let t = Tree::new();
    fs::create_dir_all(t.pkg.join("kernel")).expect("mkdir");
    fs::write(
        t.pkg.join("kernel/config.txt"),
        "CONFIG_B=y\nCONFIG_NEW=\"x\"\n",
    )
    .expect("write fragment");
    let doc = spec(
        "kernel",
        &t.make,
        "[configure]\ndefconfig = \"demo_defconfig\"\nfragment = \"kernel/config.txt\"\n",
    );

    let (res, _) = support::run_task(&doc, "configure.kconfig", &t.pkg, &t.work, &t.out);
    res.expect("configure");

    let calls = read_lines(&t.log);
    assert_eq!(calls.len(), 2, "{calls:?}");
    assert!(
        calls[0].starts_with(
            "demo-1.0|ARCH=arm demo_defconfig|ARCH=arm|CROSS_COMPILE=arm-linux-gnueabihf-|"
        ),
        "{}",
        calls[0]
    );
    assert!(calls[0].ends_with("|KBUILD_BUILD_USER=gokrazy"), "{}", calls[0]);
    assert!(
        calls[1].starts_with("demo-1.0|ARCH=arm olddefconfig|"),
        "{}",
        calls[1]
    );

    // The fragment was already applied when normalization ran.
    assert_eq!(
        fs::read_to_string(t.src().join(".config.normalized-from")).expect("snapshot"),
        "CONFIG_A=y\nCONFIG_B=y\nCONFIG_NEW=\"x\"\n"
    );
}

#[test]
fn kconfig_without_normalize_runs_make_once() {
    let t = Tree::new();
    let doc = spec(
        "uboot",
        &t.make,
        "[configure]\ndefconfig = \"odroid-xu3_defconfig\"\nnormalize = \"\"\n",
    );

    let (res, _) = support::run_task(&doc, "configure.kconfig", &t.pkg, &t.work, &t.out);
    res.expect("configure");

    let calls = read_lines(&t.log);
    assert_eq!(calls.len(), 1, "{calls:?}");
    assert!(calls[0].contains("|ARCH=arm odroid-xu3_defconfig|"), "{}", calls[0]);
    assert!(calls[0].contains("|SOURCE_DATE_EPOCH=1600000000|"), "{}", calls[0]);
    assert_eq!(
        fs::read_to_string(t.src().join(".config")).expect("config"),
        "CONFIG_A=y\n# CONFIG_B is not set\n"
    );
}

#[test]
fn missing_fragment_fails_configure() {
    let t = Tree::new();
    let doc = spec(
        "kernel",
        &t.make,
        "[configure]\ndefconfig = \"demo_defconfig\"\nfragment = \"kernel/missing.txt\"\n",
    );
    let (res, _) = support::run_task(&doc, "configure.kconfig", &t.pkg, &t.work, &t.out);
    let err = res.expect_err("missing fragment");
    assert_eq!(err.kind(), ErrorKind::Filesystem);
    assert!(err.to_string().contains("missing.txt"), "{err}");
}

#[test]
fn mkimage_gets_fixed_header_and_script_path() {
    let t = Tree::new();
    fs::create_dir_all(t.pkg.join("uboot")).expect("mkdir");
    fs::write(t.pkg.join("uboot/boot.cmd"), "bootz ${kernel_addr_r}\n").expect("write cmd");

    // The default tool path points into the bootloader source tree.
    let mkimage_log = t.root.join("mkimage.log");
    support::write_script(
        &t.src().join("tools/mkimage"),
        &format!(
            r#"printf '%s|SOURCE_DATE_EPOCH=%s\n' "$*" "$SOURCE_DATE_EPOCH" >> '{}'
for last; do :; done
printf 'scr\n' > "$last"
"#,
            mkimage_log.display()
        ),
    );
    let doc = spec(
        "uboot",
        &t.make,
        "[bootscript]\nsource = \"uboot/boot.cmd\"\nname = \"Demo Boot Script\"\n",
    );

    let (res, _) = support::run_task(&doc, "bootscript.mkimage", &t.pkg, &t.work, &t.out);
    res.expect("mkimage");

    let script = t.pkg.join("uboot/boot.cmd").canonicalize().expect("canon");
    assert_eq!(
        read_lines(&mkimage_log),
        [format!(
            "-A arm -O linux -T script -C none -a 0 -e 0 -n Demo Boot Script -d {} boot.scr|SOURCE_DATE_EPOCH=1600000000",
            script.display()
        )]
    );
    assert_eq!(
        fs::read_to_string(t.src().join("boot.scr")).expect("boot.scr"),
        "scr\n"
    );
}

#[test]
fn firmware_lands_under_dest_dir_by_name() {
    let base = support::serve(vec![
        ("/fw-1.0/rtl8153a-3.fw".into(), b"rtl".to_vec()),
        ("/s5p-mfc-v8.fw".into(), b"mfc".to_vec()),
    ]);
    let t = Tree::new();
    let upstream = t.root.join("rtl");
    fs::write(&upstream, b"rtl").expect("write");
    let pin = sha256_file_hex(&upstream).expect("hash");
    let doc = ConfigDoc::from_str(
        "<mem>",
        &format!(
            r#"
[target]
name = "demo"
kind = "kernel"
require_pins = false

[container]

[source]
url = "{base}/demo-{{revision}}.tar.gz"
revision = "1.0"

[[source.firmware]]
name = "rtl_nic/rtl8153a-3.fw"
url = "{base}/fw-{{revision}}/rtl8153a-3.fw"
sha256 = "{pin}"
dest_dir = "firmware"

[[source.firmware]]
name = "s5p-mfc-v8.fw"
url = "{base}/s5p-mfc-v8.fw"
dest_dir = "firmware"

[build]
targets = ["all"]

[[collect.artifacts]]
path = "out.bin"
dest = "demo/out.bin"
"#
        ),
    )
    .expect("doc");

    let (res, events) = support::run_task(&doc, "source.firmware", &t.pkg, &t.work, &t.out);
    res.expect("firmware");
    assert_eq!(
        fs::read(t.work.join("firmware/rtl_nic/rtl8153a-3.fw")).expect("rtl"),
        b"rtl"
    );
    assert_eq!(
        fs::read(t.work.join("firmware/s5p-mfc-v8.fw")).expect("mfc"),
        b"mfc"
    );
    let lines = support::log_lines(&events);
    assert!(
        lines
            .iter()
            .any(|l| l == &format!("rtl_nic/rtl8153a-3.fw: sha256 {pin} (3 bytes)")),
        "{lines:?}"
    );
}

#[test]
fn firmware_pin_mismatch_stops_the_fetch() {
    let base = support::serve(vec![
        ("/a.fw".into(), b"tampered".to_vec()),
        ("/b.fw".into(), b"fine".to_vec()),
    ]);
    let t = Tree::new();
    let doc = ConfigDoc::from_str(
        "<mem>",
        &format!(
            r#"
[target]
name = "demo"
kind = "kernel"

[container]

[source]
url = "{base}/demo-1.0.tar.gz"

[[source.firmware]]
name = "a.fw"
url = "{base}/a.fw"
sha256 = "{zero}"
dest_dir = "firmware"

[[source.firmware]]
name = "b.fw"
url = "{base}/b.fw"
sha256 = "{zero}"
dest_dir = "firmware"

[build]
targets = ["all"]

[[collect.artifacts]]
path = "out.bin"
dest = "demo/out.bin"
"#,
            zero = "0".repeat(64)
        ),
    )
    .expect("doc");

    let (res, _) = support::run_task(&doc, "source.firmware", &t.pkg, &t.work, &t.out);
    let err = res.expect_err("pin mismatch");
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert!(err.to_string().contains("/a.fw"), "{err}");
    assert!(!t.work.join("firmware/b.fw").exists());
}

/// `dir.tar.gz` holding `dir/` as laid out under `root`.
fn tarball(root: &Path, dir: &str) -> Vec<u8> {
    let name = format!("{dir}.tar.gz");
    let status = std::process::Command::new("tar")
        .args(["czf", &name, dir])
        .current_dir(root)
        .status()
        .expect("spawn tar");
    assert!(status.success());
    fs::read(root.join(name)).expect("read archive")
}

#[test]
fn tool_is_fetched_built_and_its_output_collected() {
    if !support::have_tools(&["tar", "gzip"]) {
        return;
    }
    let t = Tree::new();
    let upstream = t.root.join("upstream");
    fs::create_dir_all(upstream.join("demo-1.0")).expect("mkdir");
    fs::write(upstream.join("demo-1.0/README"), "demo\n").expect("write");
    support::write_script(
        &upstream.join("signer-1.0/sign"),
        "{ cat \"$1\"; echo signed; } > \"$2\"\n",
    );
    let base = support::serve(vec![
        ("/demo-1.0.tar.gz".into(), tarball(&upstream, "demo-1.0")),
        ("/signer-1.0.tar.gz".into(), tarball(&upstream, "signer-1.0")),
    ]);
    let doc = ConfigDoc::from_str(
        "<mem>",
        &format!(
            r#"
[target]
name = "demo"
kind = "uboot"
require_pins = false

[container]

[source]
url = "{base}/demo-1.0.tar.gz"

[build]
targets = ["all"]
jobs = 1
tool = "{make}"

[tool]
url = "{base}/signer-1.0.tar.gz"
build = ["signer"]
run = ["{{tool}}/sign", "{{src}}/u-boot.bin", "{{out}}/u-boot-signed.bin"]

[[collect.artifacts]]
path = "u-boot.bin"
dest = "uboot/u-boot.bin"

[[collect.artifacts]]
path = "u-boot-signed.bin"
from = "output"
dest = "uboot/u-boot-signed.bin"
"#,
            make = t.make.display()
        ),
    )
    .expect("doc");

    let (res, events) = support::drive(&doc, &t.pkg, &t.work, &t.out);
    res.expect("driver run");
    let ids: Vec<String> = support::finished(&events).into_iter().map(|(id, _)| id).collect();
    assert_eq!(
        ids,
        [
            "core.init",
            "source.fetch",
            "source.unpack",
            "build.make",
            "tool.fetch",
            "tool.build",
            "tool.sign",
            "collect.artifacts"
        ]
    );

    // The tool is built natively: no cross environment.
    let calls = read_lines(&t.log);
    assert_eq!(calls.len(), 2, "{calls:?}");
    assert!(calls[0].starts_with("demo-1.0|all -j1|ARCH=arm|"), "{}", calls[0]);
    assert!(calls[1].starts_with("signer-1.0|signer -j1|ARCH=|CROSS_COMPILE=|"), "{}", calls[1]);

    assert_eq!(
        fs::read_to_string(t.out.join("u-boot-signed.bin")).expect("signed"),
        "built\nsigned\n"
    );
    let records = bootforge::manifest::read_fetch_records(
        &t.out.join(bootforge::manifest::FETCH_RECORD_FILE),
    )
    .expect("records");
    let names: Vec<&str> = records.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["demo-1.0.tar.gz", "signer-1.0.tar.gz"]);

    let artifacts = bootforge::modules::container::export_artifacts(
        &doc,
        &bootforge::workspace::PackagePaths::new(&t.pkg),
        &t.out,
    )
    .expect("export");
    assert_eq!(artifacts.len(), 2);
    assert_eq!(
        fs::read_to_string(t.pkg.join("uboot/u-boot-signed.bin")).expect("delivered"),
        "built\nsigned\n"
    );
}
