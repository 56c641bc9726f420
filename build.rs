fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only rerun if proto files change
    println!("cargo:rerun-if-changed=proto/veza/chat.proto");
    println!("cargo:rerun-if-changed=proto/veza/stream.proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &["proto/veza/chat.proto", "proto/veza/stream.proto"],
            &["proto"],
        )?;
    Ok(())
}
