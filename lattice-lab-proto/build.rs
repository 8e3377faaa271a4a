use std::path::Path;

fn main() {
    let protoc = protoc_bin_vendored::protoc_bin_path().expect("failed to find protoc");
    std::env::set_var("PROTOC", protoc);

    let include = protoc_bin_vendored::include_path().expect("failed to find protoc includes");

    println!("cargo:rerun-if-changed=proto/latticelab.proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &[Path::new("proto/latticelab.proto")],
            &[Path::new("proto"), include.as_path()],
        )
        .expect("failed to compile latticelab proto");
}
