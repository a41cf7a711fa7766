use std::env;
use std::path::PathBuf;

fn main() {
    ensure_ts_bindings_dir();
    rerun_on_migrations();
}

fn ensure_ts_bindings_dir() {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| "".into());
    let bindings_dir = PathBuf::from(manifest_dir).join("bindings");
    if let Err(err) = std::fs::create_dir_all(&bindings_dir) {
        println!(
            "cargo:warning=failed to create TS bindings directory {}: {}",
            bindings_dir.display(),
            err
        );
    }
}

fn rerun_on_migrations() {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| "".into());
    let migrations = PathBuf::from(manifest_dir).join("migrations");
    println!("cargo:rerun-if-changed={}", migrations.display());
}
