use std::env;
use std::path::Path;
use std::process::Command;

fn git_version() -> String {
    Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "unknown".into()))
}

// PROFILE only reports "release" for profiles inheriting from it, so the
// profile directory under target/ is checked instead.
fn is_distribute() -> bool {
    env::var("OUT_DIR")
        .map(|dir| Path::new(&dir).components().any(|c| c.as_os_str() == "distribute"))
        .unwrap_or(false)
}

fn main() {
    println!("cargo:rustc-env=GIT_VERSION={}", git_version());
    println!("cargo::rustc-check-cfg=cfg(distribute)");

    if is_distribute() {
        println!("cargo:rustc-cfg=distribute");
    }

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs");
}
