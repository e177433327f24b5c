//! Generates the gRPC client and server bindings for `proto/maplet.proto`.
//!
//! Byte-carrying fields are mapped to `bytes::Bytes` instead of `Vec<u8>` so
//! that response chunks coming out of the worker pipe are forwarded to the
//! gRPC stream without an extra copy. A file descriptor set is emitted
//! alongside the bindings for use by the reflection service.

use std::env;
use std::path::PathBuf;

fn main() {
    if env::var_os("PROTOC").is_none() {
        if let Ok(protoc) = protoc_bin_vendored::protoc_bin_path() {
            unsafe { env::set_var("PROTOC", protoc) };
        }
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("maplet_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config
        .bytes([
            ".maplet.ResponseChunk.chunk",
            ".maplet.OwsRequest.body",
            ".maplet.ApiRequest.data",
        ])
        .file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/maplet.proto"], &["proto"])
        .unwrap();
}
