fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_path = if std::path::Path::new("/rust-build/proto").exists() {
        // Docker build path
        "/rust-build/proto/ruleset_distribution.proto"
    } else {
        // Local development path
        "../proto/ruleset_distribution.proto"
    };

    let include_path = if std::path::Path::new("/rust-build/proto").exists() {
        "/rust-build/proto"
    } else {
        "../proto"
    };

    println!("cargo:rerun-if-changed={}", proto_path);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&[proto_path], &[include_path])?;
    Ok(())
}
