fn main() -> Result<(), Box<dyn std::error::Error>> {
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    std::env::set_var("PROTOC", protoc);

    let proto_dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("proto");

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&[proto_dir.join("identity.proto")], &[proto_dir])?;
    Ok(())
}
