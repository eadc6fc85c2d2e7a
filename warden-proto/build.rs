fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    println!("cargo:rerun-if-changed=proto/types.proto");
    println!("cargo:rerun-if-changed=proto/node.proto");
    println!("cargo:rerun-if-changed=proto/registration.proto");

    let out_dir = std::path::PathBuf::from(std::env::var("OUT_DIR")?);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(out_dir.join("warden_descriptor.bin"))
        .compile_protos(
            &[
                "proto/types.proto",
                "proto/node.proto",
                "proto/registration.proto",
            ],
            &["proto"],
        )?;

    Ok(())
}
