use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR")?;
    let manifest_path = PathBuf::from(manifest_dir);

    let proto_dir = manifest_path
        .parent() // crates/
        .and_then(|p| p.parent()) // workspace root
        .map(|p| p.join("proto"))
        .ok_or("Failed to find proto directory")?;

    println!("cargo:rerun-if-changed={}", proto_dir.display());

    let common_proto = proto_dir.join("skein/common/v1/common.proto");
    let runner_proto = proto_dir.join("skein/runner/v1/runner.proto");
    let handler_proto = proto_dir.join("skein/handler/v1/handler.proto");
    let manager_proto = proto_dir.join("skein/manager/v1/manager.proto");

    let protoc = protoc_bin_vendored::protoc_bin_path()?;

    // Common messages carry no services.
    let mut common_config = prost_build::Config::new();
    common_config.protoc_executable(&protoc);
    tonic_build::configure()
        .build_server(false)
        .build_client(false)
        .compile_protos_with_config(common_config, &[common_proto], &[proto_dir.clone()])?;

    let mut service_config = prost_build::Config::new();
    service_config.protoc_executable(&protoc);
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos_with_config(
            service_config,
            &[runner_proto, handler_proto, manager_proto],
            &[proto_dir],
        )?;
    Ok(())
}
