//! Build script for the Hydra agent
//!
//! Exposes git state, build time, target, profile and compiler version to
//! `src/version.rs` as `HYDRA_*` compile-time variables.

use std::env;
use std::process::Command;

const UNKNOWN: &str = "unknown";

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let rustc = env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());

    // "clean", "dirty", or "unknown" outside a checkout
    let git_state = match stdout_of("git", &["status", "--porcelain"]) {
        Some(status) if status.is_empty() => "clean".to_string(),
        Some(_) => "dirty".to_string(),
        None => UNKNOWN.to_string(),
    };

    let vars = [
        ("HYDRA_GIT_COMMIT", stdout_of("git", &["rev-parse", "--short=8", "HEAD"])),
        ("HYDRA_GIT_BRANCH", stdout_of("git", &["rev-parse", "--abbrev-ref", "HEAD"])),
        ("HYDRA_GIT_STATE", Some(git_state)),
        (
            "HYDRA_BUILT_AT",
            Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        ),
        ("HYDRA_TARGET", env::var("TARGET").ok()),
        ("HYDRA_PROFILE", env::var("PROFILE").ok()),
        ("HYDRA_RUSTC", stdout_of(&rustc, &["--version"])),
    ];

    for (name, value) in vars {
        println!(
            "cargo:rustc-env={}={}",
            name,
            value.as_deref().unwrap_or(UNKNOWN)
        );
    }
}

/// Trimmed stdout of a successful command
fn stdout_of(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .map(|s| s.trim().to_string())
}
