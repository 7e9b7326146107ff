#![allow(dead_code)]

use std::{
    env,
    fs::File,
    io::Write,
    path::Path,
    process::{Command, Stdio},
};

use assert_cmd::assert::Assert;
use flate2::{write::GzEncoder, Compression};
use serde_json::Value;
use zip::{write::FileOptions, ZipWriter};

pub fn parse_json(assert: &Assert) -> Value {
    serde_json::from_slice(&assert.get_output().stdout).expect("valid json")
}

/// A small sdist with deliberately messy metadata.
pub fn write_sdist(path: &Path, mtime: u64) {
    let file = File::create(path).expect("create sdist");
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    let members: [(&str, &[u8], u32); 3] = [
        ("demo-0.1.0/PKG-INFO", b"Name: demo\n", 0o664),
        ("demo-0.1.0/demo/__init__.py", b"", 0o600),
        ("demo-0.1.0/run.sh", b"#!/bin/sh\n", 0o775),
    ];
    for (name, data, mode) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(mode);
        header.set_mtime(mtime);
        header.set_uid(1000);
        header.set_gid(1000);
        header.set_username("builder").expect("username");
        builder
            .append_data(&mut header, name, data)
            .expect("append member");
    }
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip");
}

pub fn write_wheel(path: &Path) {
    let mut zip = ZipWriter::new(File::create(path).expect("create wheel"));
    let entries: [(&str, &[u8]); 3] = [
        ("demo-0.1.0.dist-info/RECORD", b"demo/__init__.py,,\n"),
        ("demo/__init__.py", b"VALUE = 1\n"),
        ("demo-0.1.0.dist-info/METADATA", b"Name: demo\n"),
    ];
    for (name, data) in entries {
        zip.start_file(name, FileOptions::default().unix_permissions(0o666))
            .expect("start member");
        zip.write_all(data).expect("write member");
    }
    zip.finish().expect("finish wheel");
}

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

pub fn find_python_with_build() -> Option<String> {
    let candidates = [
        env::var("PYTHON").ok(),
        Some("python3".to_string()),
        Some("python".to_string()),
    ];
    for candidate in candidates.into_iter().flatten() {
        let status = Command::new(&candidate)
            .args(["-c", "import build"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if matches!(status, Ok(code) if code.success()) {
            return Some(candidate);
        }
    }
    None
}

pub fn require_online() -> bool {
    match env::var("REPRODUCIBLY_ONLINE").ok().as_deref() {
        Some("1") => true,
        _ => {
            eprintln!("skipping build test (REPRODUCIBLY_ONLINE!=1)");
            false
        }
    }
}
