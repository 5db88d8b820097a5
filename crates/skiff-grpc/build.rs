fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true) // Used by the integration tests
        .compile_protos(&["proto/skiff.proto"], &["proto/"])?;
    Ok(())
}
