#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::Path;
use std::sync::{Arc, mpsc};
use std::thread;

use bootforge::config::ConfigDoc;
use bootforge::executor::{ChannelSink, ExecCtx, ExecEvent, RunOptions, execute_plan};
use bootforge::modules::{Pipeline, build_plan};
use bootforge::workspace::PackagePaths;

/// Serve `routes` (path -> body) over plain HTTP on loopback; anything else is
/// a 404. Returns the base URL. The server thread lives until the test exits.
pub fn serve(routes: Vec<(String, Vec<u8>)>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).is_err() {
                continue;
            }
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) if line == "\r\n" || line == "\n" => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            let target = request_line.split_whitespace().nth(1).unwrap_or("/");
            let path = target.split('?').next().unwrap_or(target);
            let (status, body): (&str, &[u8]) = match routes.iter().find(|(p, _)| p == path) {
                Some((_, body)) => ("200 OK", body.as_slice()),
                None => ("404 Not Found", &b"not found"[..]),
            };
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(body);
            let _ = stream.flush();
        }
    });
    format!("http://{addr}")
}

pub fn have_tools(tools: &[&str]) -> bool {
    for t in tools {
        if which::which(t).is_err() {
            eprintln!("skipping: {t} not found in PATH");
            return false;
        }
    }
    true
}

/// Run the in-container driver plan locally, collecting executor events.
pub fn drive(
    doc: &ConfigDoc,
    pkg: &Path,
    work: &Path,
    out: &Path,
) -> (bootforge::Result<()>, Vec<ExecEvent>) {
    let (tx, rx) = mpsc::channel();
    let res = (|| -> bootforge::Result<()> {
        let plan = build_plan(doc, Pipeline::Driver)?;
        let reg = Pipeline::Driver.registry()?;
        let mut opts = RunOptions::new(PackagePaths::new(pkg));
        opts.work_dir = work.to_path_buf();
        opts.output_dir = Some(out.to_path_buf());
        let mut ctx = ExecCtx::new(false, Arc::new(ChannelSink::new(tx)), opts);
        execute_plan(doc, &plan, &reg, &mut ctx)
    })();
    (res, rx.try_iter().collect())
}

/// Run a single registered driver task, as the executor would.
pub fn run_task(
    doc: &ConfigDoc,
    id: &str,
    pkg: &Path,
    work: &Path,
    out: &Path,
) -> (bootforge::Result<()>, Vec<ExecEvent>) {
    let (tx, rx) = mpsc::channel();
    let res = (|| -> bootforge::Result<()> {
        let reg = Pipeline::Driver.registry()?;
        let exec = reg
            .get(id)
            .ok_or_else(|| bootforge::Error::config(format!("no task '{id}'")))?;
        let mut opts = RunOptions::new(PackagePaths::new(pkg));
        opts.work_dir = work.to_path_buf();
        opts.output_dir = Some(out.to_path_buf());
        let mut ctx = ExecCtx::new(false, Arc::new(ChannelSink::new(tx)), opts);
        ctx.set_task(id);
        exec(doc, &mut ctx)
    })();
    (res, rx.try_iter().collect())
}

/// Write an executable shell script.
#[cfg(unix)]
pub fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("mkdir script dir");
    }
    std::fs::write(path, format!("#!/bin/sh\n{body}")).expect("write script");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).expect("chmod script");
}

pub fn log_lines(events: &[ExecEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|ev| match ev {
            ExecEvent::TaskLog { line, .. } => Some(line.clone()),
            _ => None,
        })
        .collect()
}

pub fn finished(events: &[ExecEvent]) -> Vec<(String, bool)> {
    events
        .iter()
        .filter_map(|ev| match ev {
            ExecEvent::TaskFinished { id, ok, .. } => Some((id.clone(), *ok)),
            _ => None,
        })
        .collect()
}
