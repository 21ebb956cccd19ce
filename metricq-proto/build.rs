fn main() {
    println!("cargo:rerun-if-changed=proto/metricq.proto");
    prost_build::compile_protos(&["proto/metricq.proto"], &["proto/"]).expect("failed to compile metricq.proto");
}
