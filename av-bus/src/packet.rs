use bytes::Bytes;

use crate::stream::{Rational, rescale};

/// A compressed, timestamped unit of one elementary stream.
///
/// Once a packet leaves the demuxer its timestamps are in
/// [`PIPELINE_TIME_BASE`](crate::stream::PIPELINE_TIME_BASE).
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    stream_index: usize,
    data: Bytes,
    pts: Option<i64>,
    dts: Option<i64>,
    duration: i64,
    is_key: bool,
}

impl Packet {
    pub fn new(stream_index: usize, data: impl Into<Bytes>) -> Self {
        Self {
            stream_index,
            data: data.into(),
            pts: None,
            dts: None,
            duration: 0,
            is_key: false,
        }
    }

    pub fn with_pts(mut self, pts: Option<i64>) -> Self {
        self.pts = pts;
        self
    }

    pub fn with_dts(mut self, dts: Option<i64>) -> Self {
        self.dts = dts;
        self
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_key(mut self, is_key: bool) -> Self {
        self.is_key = is_key;
        self
    }

    pub fn with_stream_index(mut self, stream_index: usize) -> Self {
        self.stream_index = stream_index;
        self
    }

    pub fn index(&self) -> usize {
        self.stream_index
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    pub fn dts(&self) -> Option<i64> {
        self.dts
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn is_key(&self) -> bool {
        self.is_key
    }

    pub fn rescale_ts(&mut self, from: Rational, to: Rational) {
        self.pts = self.pts.map(|v| rescale(v, from, to));
        self.dts = self.dts.map(|v| rescale(v, from, to));
        self.duration = rescale(self.duration, from, to);
    }
}
