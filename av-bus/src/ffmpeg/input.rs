use std::path::Path;

use bytes::Bytes;
use ffmpeg_next::format::context::Input;
use ffmpeg_next::format::{Pixel, Sample};
use ffmpeg_next::media;

use super::{codec_from_av, is_again, pixel_from_av, rational_from_av, sample_from_av};
use crate::backend::{ContainerSource, Fetch};
use crate::error::{PipelineError, Result};
use crate::packet::Packet;
use crate::stream::{MediaFormat, StreamDescriptor};

/// File or network input opened through libavformat.
pub struct AvContainer {
    url: String,
    input: Input,
    streams: Vec<StreamDescriptor>,
}

impl AvContainer {
    pub fn open(url: &str) -> Result<Self> {
        let input = ffmpeg_next::format::input(Path::new(url))
            .map_err(|e| PipelineError::open("demuxer", format!("{url}: {e}")))?;
        let streams = input
            .streams()
            .filter_map(|s| describe(&s))
            .collect::<Vec<_>>();
        log::info!("{url}: {} streams", streams.len());
        Ok(Self {
            url: url.to_string(),
            input,
            streams,
        })
    }
}

fn describe(stream: &ffmpeg_next::format::stream::Stream) -> Option<StreamDescriptor> {
    let params = stream.parameters();
    let codec = codec_from_av(params.id());
    let medium = params.medium();
    let ctx = match ffmpeg_next::codec::context::Context::from_parameters(params) {
        Ok(ctx) => ctx,
        Err(e) => {
            log::warn!("stream {}: unreadable parameters: {e}", stream.index());
            return None;
        }
    };
    let raw = unsafe { &*ctx.as_ptr() };
    let extradata = if raw.extradata.is_null() || raw.extradata_size <= 0 {
        Bytes::new()
    } else {
        Bytes::copy_from_slice(unsafe {
            std::slice::from_raw_parts(raw.extradata, raw.extradata_size as usize)
        })
    };

    let descriptor = match medium {
        media::Type::Video => {
            let mut d =
                StreamDescriptor::video(stream.index(), codec, raw.width as u32, raw.height as u32);
            if let Some(format) = pixel_from_av(Pixel::from(raw.pix_fmt)) {
                d = d.with_format(MediaFormat::Pixel(format));
            }
            let rate = stream.avg_frame_rate();
            if rate.numerator() > 0 && rate.denominator() > 0 {
                d = d.with_frame_rate(rational_from_av(rate));
            }
            d
        }
        media::Type::Audio => StreamDescriptor::audio(
            stream.index(),
            codec,
            raw.sample_rate as u32,
            raw.ch_layout.nb_channels as u16,
        )
        .with_format(MediaFormat::Sample(sample_from_av(Sample::from(raw.sample_fmt)))),
        media::Type::Subtitle => StreamDescriptor::subtitle(stream.index(), codec),
        _ => return None,
    };
    Some(
        descriptor
            .with_time_base(rational_from_av(stream.time_base()))
            .with_bit_rate(raw.bit_rate.max(0) as u64)
            .with_extradata(extradata),
    )
}

impl ContainerSource for AvContainer {
    fn streams(&self) -> Vec<StreamDescriptor> {
        self.streams.clone()
    }

    fn read_packet(&mut self) -> Fetch<Packet> {
        let mut packet = ffmpeg_next::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => {}
            Err(ffmpeg_next::Error::Eof) => return Fetch::EndOfStream,
            Err(e) if is_again(&e) => return Fetch::Pending,
            Err(e) => return Fetch::Fatal(format!("{}: {e}", self.url)),
        }
        let data = packet.data().map(Bytes::copy_from_slice).unwrap_or_default();
        Fetch::Ready(
            Packet::new(packet.stream(), data)
                .with_pts(packet.pts())
                .with_dts(packet.dts())
                .with_duration(packet.duration())
                .with_key(packet.is_key()),
        )
    }
}
