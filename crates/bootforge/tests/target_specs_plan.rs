mod support;

use std::fs;
use std::sync::{Arc, mpsc};

use bootforge::config::{self, ConfigDoc};
use bootforge::error::ErrorKind;
use bootforge::executor::{ChannelSink, ExecCtx, RunOptions, execute_plan};
use bootforge::modules::container::{ContainerConfig, render_image_definition, staged_inputs};
use bootforge::modules::{Pipeline, build_plan};
use bootforge::workspace::{PackagePaths, default_pkg_dir};

fn shipped(target: &str) -> ConfigDoc {
    let pkg = PackagePaths::new(default_pkg_dir());
    config::load(&pkg.target_spec(target).expect("spec path")).expect("load spec")
}

fn ids(doc: &ConfigDoc, pipeline: Pipeline) -> Vec<String> {
    build_plan(doc, pipeline)
        .expect("plan")
        .ordered()
        .expect("order")
        .into_iter()
        .map(|t| t.id.clone())
        .collect()
}

/// Set `enabled = false` on the table at `path`, creating it if needed.
fn disable(doc: &mut ConfigDoc, path: &str) {
    let mut tbl = doc.value.as_table_mut().expect("root table");
    for seg in path.split('.') {
        tbl = tbl
            .entry(seg)
            .or_insert(toml::Value::Table(Default::default()))
            .as_table_mut()
            .expect("table");
    }
    tbl.insert("enabled".into(), toml::Value::Boolean(false));
}

const HOST: [&str; 6] = [
    "core.init",
    "container.stage",
    "container.driver",
    "container.image",
    "container.run",
    "container.export",
];

#[test]
fn kernel_spec_plans() {
    let doc = shipped("kernel");
    assert_eq!(ids(&doc, Pipeline::Host), HOST);
    assert_eq!(
        ids(&doc, Pipeline::Driver),
        [
            "core.init",
            "source.fetch",
            "source.firmware",
            "source.unpack",
            "patches.apply",
            "configure.kconfig",
            "build.make",
            "collect.artifacts"
        ]
    );
    assert_eq!(staged_inputs(&doc).expect("inputs"), ["kernel/config.txt"]);
}

#[test]
fn uboot_spec_plans() {
    let doc = shipped("uboot");
    assert_eq!(ids(&doc, Pipeline::Host), HOST);
    assert_eq!(
        ids(&doc, Pipeline::Driver),
        [
            "core.init",
            "source.fetch",
            "source.unpack",
            "patches.apply",
            "configure.kconfig",
            "build.make",
            "bootscript.mkimage",
            "collect.artifacts"
        ]
    );
    assert_eq!(staged_inputs(&doc).expect("inputs"), ["uboot/boot.cmd"]);
}

#[test]
fn shipped_template_renders() {
    let pkg = PackagePaths::new(default_pkg_dir());
    let doc = shipped("uboot");
    let container = ContainerConfig::load(&doc).expect("container");
    let template =
        fs::read_to_string(pkg.resolve(&container.template).expect("path")).expect("template");
    let out = render_image_definition(&template, &container, 1000, 1000, vec!["boot.cmd".into()])
        .expect("render");
    assert!(out.contains("USER 1000:1000"));
    assert!(out.contains("COPY boot.cmd /usr/src/bootforge/"));
    assert!(out.contains("\"--output\", \"/tmp/buildresult\""));
    assert!(!out.contains("{{"));
}

#[test]
fn dry_run_walks_the_host_plan_without_side_effects() {
    let doc = shipped("kernel");
    let plan = build_plan(&doc, Pipeline::Host).expect("plan");
    let reg = Pipeline::Host.registry().expect("registry");
    let staging_root = tempfile::tempdir().expect("tempdir");

    let (tx, rx) = mpsc::channel();
    let mut opts = RunOptions::new(PackagePaths::new(default_pkg_dir()));
    opts.staging_root = staging_root.path().to_path_buf();
    opts.engine_override = Some("no-such-engine".into());
    let mut ctx = ExecCtx::new(true, Arc::new(ChannelSink::new(tx)), opts);
    execute_plan(&doc, &plan, &reg, &mut ctx).expect("dry run");
    drop(ctx);

    let events: Vec<_> = rx.try_iter().collect();
    let finished = support::finished(&events);
    assert_eq!(finished.len(), HOST.len());
    assert!(finished.iter().all(|(_, ok)| *ok));
    assert_eq!(
        fs::read_dir(staging_root.path()).expect("read dir").count(),
        0
    );
}

#[test]
fn unknown_table_is_rejected_at_plan_time() {
    let mut doc = shipped("uboot");
    doc.value
        .as_table_mut()
        .expect("table")
        .insert("buildroot".into(), toml::Value::Table(Default::default()));
    let err = build_plan(&doc, Pipeline::Driver).expect_err("unknown table");
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.to_string().contains("buildroot"), "{err}");
}

#[test]
fn colliding_input_names_are_rejected() {
    let doc = ConfigDoc::from_str(
        "<mem>",
        r#"
[target]
name = "demo"
kind = "kernel"

[container]
inputs = ["a/config.txt"]

[source]
url = "https://example.org/demo-1.0.tar.xz"

[configure]
defconfig = "demo_defconfig"
fragment = "b/config.txt"

[build]
targets = ["all"]

[[collect.artifacts]]
path = "out.bin"
dest = "demo/out.bin"
"#,
    )
    .expect("doc");
    let err = build_plan(&doc, Pipeline::Host).expect_err("collision");
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.to_string().contains("config.txt"), "{err}");
}

#[test]
fn disabling_the_container_module_is_rejected() {
    let mut doc = shipped("kernel");
    disable(&mut doc, "container");
    let err = build_plan(&doc, Pipeline::Host).expect_err("container disabled");
    assert_eq!(err.kind(), ErrorKind::Config);
    let msg = err.to_string();
    assert!(msg.contains("[container]"), "{msg}");
    assert!(msg.contains("container.run") && msg.contains("container.export"), "{msg}");
}

#[test]
fn disabling_collect_is_rejected_in_the_driver_plan() {
    let mut doc = shipped("uboot");
    disable(&mut doc, "collect");
    let err = build_plan(&doc, Pipeline::Driver).expect_err("collect disabled");
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.to_string().contains("collect.artifacts"), "{err}");
}

#[test]
fn required_steps_cannot_be_switched_off_individually() {
    let mut doc = shipped("kernel");
    disable(&mut doc, "source.steps.unpack");
    let err = build_plan(&doc, Pipeline::Driver).expect_err("unpack disabled");
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.to_string().contains("source.steps.unpack"), "{err}");
}

#[test]
fn optional_steps_and_modules_drop_out_of_the_plan() {
    let mut doc = shipped("kernel");
    disable(&mut doc, "source.steps.firmware");
    disable(&mut doc, "configure");
    assert_eq!(
        ids(&doc, Pipeline::Driver),
        [
            "core.init",
            "source.fetch",
            "source.unpack",
            "patches.apply",
            "build.make",
            "collect.artifacts"
        ]
    );
}
