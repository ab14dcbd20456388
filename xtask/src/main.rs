//! Build automation for EmberOS
//!
//! `cargo xtask build` cross-compiles the kernel binary, `cargo xtask run`
//! boots it under QEMU, `cargo xtask test` runs the hosted test suite.

use std::env;
use std::path::PathBuf;
use std::process::Command;

const KERNEL_TARGET: &str = "x86_64-unknown-none";

fn run(cmd: &mut Command) -> anyhow::Result<()> {
    eprintln!("[RUN] {:?}", cmd);
    let status = cmd.status()?;
    if !status.success() {
        anyhow::bail!("command failed: {:?}", cmd);
    }
    Ok(())
}

fn cargo() -> Command {
    Command::new("cargo")
}

fn root() -> anyhow::Result<PathBuf> {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    Ok(manifest_dir
        .parent()
        .ok_or_else(|| anyhow::anyhow!("xtask must live inside the workspace"))?
        .to_path_buf())
}

fn build(release: bool) -> anyhow::Result<PathBuf> {
    let root = root()?;
    let mut cmd = cargo();
    cmd.current_dir(&root)
        .args(["build", "-p", "ember_os", "--target", KERNEL_TARGET]);
    if release {
        cmd.arg("--release");
    }
    run(&mut cmd)?;

    let profile = if release { "release" } else { "debug" };
    Ok(root
        .join("target")
        .join(KERNEL_TARGET)
        .join(profile)
        .join("ember_os"))
}

fn qemu(release: bool) -> anyhow::Result<()> {
    let kernel = build(release)?;

    let qemu = which::which("qemu-system-x86_64")
        .map_err(|_| anyhow::anyhow!("qemu-system-x86_64 not found in PATH"))?;

    let mut cmd = Command::new(qemu);
    cmd.args(["-serial", "stdio", "-display", "none", "-no-reboot"])
        .arg("-kernel")
        .arg(&kernel);
    run(&mut cmd)
}

fn test() -> anyhow::Result<()> {
    let root = root()?;
    let mut cmd = cargo();
    cmd.current_dir(&root).args(["test", "-p", "ember_os"]);
    run(&mut cmd)
}

fn usage() -> ! {
    eprintln!("usage: cargo xtask <build|run|test> [--release]");
    std::process::exit(2);
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let release = args.iter().any(|a| a == "--release");

    match args.first().map(String::as_str) {
        Some("build") => {
            build(release)?;
        }
        Some("run") => qemu(release)?,
        Some("test") => test()?,
        _ => usage(),
    }
    Ok(())
}
