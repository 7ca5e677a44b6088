// build.rs
//! Build script for compiling the agent protocol definitions

use std::io::Result;

fn main() -> Result<()> {
    // Fall back to the vendored protoc when none is configured
    if std::env::var_os("PROTOC").is_none() {
        if let Ok(protoc) = protoc_bin_vendored::protoc_bin_path() {
            std::env::set_var("PROTOC", protoc);
        }
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile(&["proto/agent.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/agent.proto");

    Ok(())
}
