//! Generated protobuf messages for the MetricQ data and history wire format.
//!
//! This crate only holds the [`prost`]-generated structs; the delta-encoding,
//! mode-detection and conversion invariants layered on top of them live in
//! the `metricq` crate.

include!(concat!(env!("OUT_DIR"), "/metricq.rs"));
