fn main() -> Result<(), Box<dyn std::error::Error>> {
    // prost-build shells out to protoc; point it at the vendored binary so
    // the build works on hosts without a protobuf toolchain.
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/simda.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/simda.proto");
    Ok(())
}
