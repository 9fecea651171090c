// Build script for aegis-edge-core
// Compiles the datastore wire-surface and health Protocol Buffer definitions

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The vendored protoc keeps the build self-contained on hosts without
    // a system protobuf toolchain.
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[
                "../../proto/kv.proto",
                "../../proto/rpc.proto",
                "../../proto/health.proto",
            ],
            &["../../proto"],
        )?;

    println!("cargo:rerun-if-changed=../../proto/kv.proto");
    println!("cargo:rerun-if-changed=../../proto/rpc.proto");
    println!("cargo:rerun-if-changed=../../proto/health.proto");

    Ok(())
}
