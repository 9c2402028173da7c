// Build script to compile protobuf files into Rust code.
//
// Runs at compile time and generates the message structs and the CommitLog
// client/server traits from proto/log.proto.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var(
        "PROTOC",
        protoc_bin_vendored::protoc_bin_path()?,
    );

    tonic_build::compile_protos("proto/log.proto")?;

    Ok(())
}
