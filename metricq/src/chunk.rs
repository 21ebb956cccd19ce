//! Delta-encoding and decoding on top of the generated [`metricq_proto::DataChunk`].
//!
//! The wire message only carries parallel `time_delta`/`value` arrays; the
//! decoding invariant (equal lengths, running-sum of deltas) lives here so
//! the generated protobuf type stays a dumb data holder.

use metricq_proto::DataChunk as WireDataChunk;
use prost::Message;

use crate::error::AgentError;
use crate::time::{TimeValue, Timestamp};

/// A decoded run of `(timestamp, value)` samples for one metric.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataChunk {
    samples: Vec<TimeValue>,
}

impl DataChunk {
    pub fn samples(&self) -> &[TimeValue] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<TimeValue> {
        self.samples
    }

    /// Encodes a run of samples into the wire delta format.
    ///
    /// `previous_timestamp` is the absolute time the delta run continues
    /// from (0 for a fresh chunk), matching `SourceMetric`'s bookkeeping.
    pub fn encode(samples: &[TimeValue], mut previous_timestamp: i64) -> WireDataChunk {
        let mut time_delta = Vec::with_capacity(samples.len());
        let mut value = Vec::with_capacity(samples.len());
        for sample in samples {
            let ts = sample.timestamp.posix_ns();
            time_delta.push(ts - previous_timestamp);
            value.push(sample.value);
            previous_timestamp = ts;
        }
        WireDataChunk { time_delta, value }
    }

    pub fn encode_to_vec(samples: &[TimeValue], previous_timestamp: i64) -> Vec<u8> {
        Self::encode(samples, previous_timestamp).encode_to_vec()
    }

    /// Decodes a wire chunk, restoring absolute timestamps by running sum.
    pub fn decode(wire: WireDataChunk) -> Result<Self, AgentError> {
        if wire.time_delta.len() != wire.value.len() {
            return Err(AgentError::MalformedChunk(format!(
                "time_delta has {} entries but value has {}",
                wire.time_delta.len(),
                wire.value.len()
            )));
        }
        let mut absolute = 0i64;
        let samples = wire
            .time_delta
            .iter()
            .zip(wire.value.iter())
            .map(|(&delta, &value)| {
                absolute += delta;
                TimeValue::new(Timestamp::from_ns(absolute), value)
            })
            .collect();
        Ok(DataChunk { samples })
    }

    pub fn decode_from_slice(bytes: &[u8]) -> Result<Self, AgentError> {
        let wire = WireDataChunk::decode(bytes).map_err(|e| {
            AgentError::MalformedChunk(format!("failed to decode DataChunk: {e}"))
        })?;
        Self::decode(wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tv(ns: i64, v: f64) -> TimeValue {
        TimeValue::new(Timestamp::from_ns(ns), v)
    }

    #[test]
    fn round_trips_a_run_of_samples() {
        let samples = vec![tv(1_000, 1.0), tv(1_500, 2.0), tv(3_000, 3.0)];
        let wire = DataChunk::encode(&samples, 0);
        assert_eq!(wire.time_delta, vec![1_000, 500, 1_500]);

        let decoded = DataChunk::decode(wire).unwrap();
        assert_eq!(decoded.samples(), samples.as_slice());
    }

    #[test]
    fn continues_from_a_nonzero_previous_timestamp() {
        let samples = vec![tv(2_000, 1.0)];
        let wire = DataChunk::encode(&samples, 1_000);
        assert_eq!(wire.time_delta, vec![1_000]);
    }

    #[test]
    fn rejects_mismatched_lengths() {
        let wire = WireDataChunk {
            time_delta: vec![1, 2, 3],
            value: vec![1.0, 2.0],
        };
        assert!(matches!(
            DataChunk::decode(wire),
            Err(AgentError::MalformedChunk(_))
        ));
    }

    #[test]
    fn empty_chunk_decodes_to_empty_samples() {
        let wire = WireDataChunk::default();
        let decoded = DataChunk::decode(wire).unwrap();
        assert!(decoded.samples().is_empty());
    }
}
