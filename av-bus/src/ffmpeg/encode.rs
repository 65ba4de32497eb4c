use bytes::Bytes;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;
use ffmpeg_next::{Dictionary, frame};

use super::hw::{AvSurface, download};
use super::{codec_to_av, is_again, pixel_to_av, rational_to_av};
use crate::backend::{EncoderBackend, Fetch};
use crate::encoder::pixel_format_for_encoder;
use crate::error::{BackendStatus, PipelineError, Result};
use crate::frame::{Frame, FrameShape, FrameStorage};
use crate::hw::{HwDeviceType, HwFramesContext};
use crate::packet::Packet;
use crate::registry::{hw_encoder_names, is_hw_codec_name};
use crate::stream::StreamDescriptor;

const NAME: &str = "libavcodec";

/// Candidate encoders for `output`, hardware first. VAAPI encoders only take
/// device surfaces and are left out.
fn candidates(output: &StreamDescriptor) -> Vec<ffmpeg_next::Codec> {
    let mut found: Vec<_> = hw_encoder_names(output.codec())
        .iter()
        .filter(|name| !name.contains("vaapi"))
        .filter_map(|name| ffmpeg_next::encoder::find_by_name(name))
        .collect();
    if let Some(sw) = ffmpeg_next::encoder::find(codec_to_av(output.codec())) {
        found.push(sw);
    }
    found
}

/// Video encoder over libavcodec. Takes system-memory frames; hardware
/// surfaces from the decoder are downloaded first.
pub struct AvEncoderBackend {
    name: String,
    output: Option<StreamDescriptor>,
    gop: u32,
    encoder: Option<ffmpeg_next::encoder::Video>,
    format: Pixel,
    scaler: Option<(Pixel, scaling::Context)>,
    eos: bool,
}

// The codec and scaler contexts are only touched under the owning component's lock.
unsafe impl Send for AvEncoderBackend {}

impl AvEncoderBackend {
    pub fn new() -> Self {
        Self {
            name: NAME.to_string(),
            output: None,
            gop: 1,
            encoder: None,
            format: Pixel::YUV420P,
            scaler: None,
            eos: false,
        }
    }

    fn open_encoder(
        &self,
        codec: ffmpeg_next::Codec,
        output: &StreamDescriptor,
        shape: &FrameShape,
        format: Pixel,
    ) -> std::result::Result<ffmpeg_next::encoder::Video, ffmpeg_next::Error> {
        let ctx = ffmpeg_next::codec::Context::new_with_codec(codec);
        let mut encoder = ctx.encoder().video()?;
        encoder.set_width(shape.width);
        encoder.set_height(shape.height);
        encoder.set_format(format);
        encoder.set_frame_rate(Some(rational_to_av(output.frame_rate())));
        encoder.set_time_base(rational_to_av(output.time_base()));
        encoder.set_bit_rate(output.bit_rate() as usize);
        encoder.set_gop(self.gop);

        let mut opts = Dictionary::new();
        opts.set("preset", "ultrafast");
        opts.set("tune", "zerolatency");
        encoder.open_with(opts)
    }

    /// System-memory copy of `frame` in the encoder's input format.
    fn to_av(&mut self, frame: &Frame) -> std::result::Result<frame::Video, String> {
        let src = match frame.storage() {
            FrameStorage::Cpu(planes) => {
                let format = frame
                    .pixel_format()
                    .ok_or_else(|| "frame without pixel format".to_string())?;
                let mut av = frame::Video::new(pixel_to_av(format), frame.width(), frame.height());
                for (i, plane) in planes.iter().enumerate().take(av.planes()) {
                    let dst_stride = av.stride(i);
                    let row = dst_stride.min(plane.stride);
                    let rows = av.plane_height(i) as usize;
                    let dst = av.data_mut(i);
                    for y in 0..rows {
                        let s = y * plane.stride;
                        if s + row > plane.data.len() {
                            break;
                        }
                        dst[y * dst_stride..y * dst_stride + row]
                            .copy_from_slice(&plane.data[s..s + row]);
                    }
                }
                av
            }
            FrameStorage::Hardware(surface) => {
                let native = surface.native::<AvSurface>().ok_or_else(|| {
                    format!("cannot read {:?} surfaces", surface.format())
                })?;
                native
                    .with_frame(download)
                    .map_err(|e| format!("surface download: {e}"))?
            }
        };
        if src.format() == self.format {
            return Ok(src);
        }
        if self.scaler.as_ref().map(|(f, _)| *f) != Some(src.format()) {
            let ctx = scaling::Context::get(
                src.format(),
                src.width(),
                src.height(),
                self.format,
                src.width(),
                src.height(),
                scaling::flag::Flags::BILINEAR,
            )
            .map_err(|e| format!("scaler: {e}"))?;
            self.scaler = Some((src.format(), ctx));
        }
        let mut converted = frame::Video::empty();
        if let Some((_, scaler)) = self.scaler.as_mut() {
            scaler
                .run(&src, &mut converted)
                .map_err(|e| format!("scaler: {e}"))?;
        }
        Ok(converted)
    }
}

impl Default for AvEncoderBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl EncoderBackend for AvEncoderBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn hw_device_type(&self) -> Option<HwDeviceType> {
        None
    }

    fn open(&mut self, output: &StreamDescriptor, gop: u32) -> Result<()> {
        self.output = Some(output.clone());
        self.gop = gop.max(1);
        self.encoder = None;
        self.scaler = None;
        self.eos = false;
        Ok(())
    }

    fn prepare(&mut self, shape: &FrameShape, _frames: Option<&HwFramesContext>) -> Result<()> {
        let Some(output) = self.output.clone() else {
            return Err(PipelineError::open(NAME, "encoder not open"));
        };
        let mut last = None;
        for codec in candidates(&output) {
            let hw = is_hw_codec_name(codec.name());
            let format = pixel_to_av(pixel_format_for_encoder(shape.format, hw));
            match self.open_encoder(codec, &output, shape, format) {
                Ok(encoder) => {
                    log::info!("encoder opened: {}", codec.name());
                    self.name = codec.name().to_string();
                    self.format = format;
                    self.encoder = Some(encoder);
                    self.scaler = None;
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("encoder {} failed: {e}, trying next", codec.name());
                    last = Some(format!("{}: {e}", codec.name()));
                }
            }
        }
        Err(PipelineError::open(
            NAME,
            last.unwrap_or_else(|| format!("no encoder for {}", output.codec())),
        ))
    }

    fn submit(&mut self, frame: &Frame, pts: i64) -> BackendStatus {
        if self.eos {
            return BackendStatus::EndOfStream;
        }
        if self.encoder.is_none() {
            return BackendStatus::Fatal("encoder not prepared".to_string());
        }
        let mut av = match self.to_av(frame) {
            Ok(av) => av,
            Err(reason) => return BackendStatus::Fatal(reason),
        };
        av.set_pts(Some(pts));
        let Some(encoder) = self.encoder.as_mut() else {
            return BackendStatus::Fatal("encoder not prepared".to_string());
        };
        match encoder.send_frame(&av) {
            Ok(()) => BackendStatus::Ok,
            Err(e) if is_again(&e) => BackendStatus::Retry,
            Err(ffmpeg_next::Error::Eof) => BackendStatus::EndOfStream,
            Err(e) => BackendStatus::Fatal(format!("{}: {e}", self.name)),
        }
    }

    fn submit_eos(&mut self) -> BackendStatus {
        self.eos = true;
        let Some(encoder) = self.encoder.as_mut() else {
            return BackendStatus::Ok;
        };
        match encoder.send_eof() {
            Ok(()) | Err(ffmpeg_next::Error::Eof) => BackendStatus::Ok,
            Err(e) => BackendStatus::Fatal(format!("{}: {e}", self.name)),
        }
    }

    fn receive(&mut self) -> Fetch<Packet> {
        let Some(encoder) = self.encoder.as_mut() else {
            return if self.eos {
                Fetch::EndOfStream
            } else {
                Fetch::Pending
            };
        };
        let mut packet = ffmpeg_next::Packet::empty();
        match encoder.receive_packet(&mut packet) {
            Ok(()) => {
                let data = packet.data().map(Bytes::copy_from_slice).unwrap_or_default();
                Fetch::Ready(
                    Packet::new(0, data)
                        .with_pts(packet.pts())
                        .with_dts(packet.dts())
                        .with_duration(packet.duration())
                        .with_key(packet.is_key()),
                )
            }
            Err(e) if is_again(&e) => Fetch::Pending,
            Err(ffmpeg_next::Error::Eof) => Fetch::EndOfStream,
            Err(e) => Fetch::Fatal(format!("{}: {e}", self.name)),
        }
    }

    fn close(&mut self) {
        self.encoder = None;
        self.scaler = None;
        self.output = None;
    }
}
