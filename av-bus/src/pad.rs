//! Typed connection points between components.
//!
//! Pads live in a [`PadGraph`] shared by every component of one pipeline. An
//! output pad fans out to any number of input pads; `produce` delivers to each
//! of them synchronously, in subscription order, on the caller's thread. The
//! graph lock is never held while a consumer runs, so a consumer may produce
//! on its own output pads or tear down pads from inside `consume`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{PipelineError, Result};
use crate::hw::HwDeviceType;
use crate::message::Message;
use crate::stream::{PixelFormat, SampleFormat, StreamDescriptor};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PadId(u64);

impl fmt::Display for PadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pad#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PadDirection {
    Input,
    Output,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PacketPadParams {
    pub stream: StreamDescriptor,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VideoPadParams {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Set when frames on this pad reference surfaces of this device type.
    pub hw_device: Option<HwDeviceType>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AudioPadParams {
    pub format: SampleFormat,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Shape of the data that flows across a pad.
#[derive(Clone, Debug, PartialEq)]
pub enum PadParams {
    Packet(PacketPadParams),
    Video(VideoPadParams),
    Audio(AudioPadParams),
}

impl PadParams {
    pub fn packet(stream: StreamDescriptor) -> Self {
        Self::Packet(PacketPadParams { stream })
    }

    pub fn as_packet(&self) -> Option<&PacketPadParams> {
        match self {
            Self::Packet(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_video(&self) -> Option<&VideoPadParams> {
        match self {
            Self::Video(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_audio(&self) -> Option<&AudioPadParams> {
        match self {
            Self::Audio(a) => Some(a),
            _ => None,
        }
    }
}

/// Receiver side of an input pad.
pub trait MessageConsumer: Send + Sync {
    fn consume(&self, pad: PadId, message: Message);

    /// The component upstream of `pad` is stopping. A `consume` blocked on
    /// backpressure for this pad should give up its message and return.
    fn interrupt(&self, _pad: PadId) {}
}

struct PadEntry {
    owner: String,
    direction: PadDirection,
    params: Option<PadParams>,
    consumer: Option<Weak<dyn MessageConsumer>>,
    // Outputs: subscribed inputs in subscription order. Inputs: upstream outputs.
    peers: Vec<PadId>,
    warned_unconnected: bool,
}

#[derive(Default)]
pub struct PadGraph {
    next_id: AtomicU64,
    pads: Mutex<HashMap<PadId, PadEntry>>,
}

impl PadGraph {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create_input_pad(
        &self,
        owner: &str,
        params: Option<PadParams>,
        consumer: Weak<dyn MessageConsumer>,
    ) -> PadId {
        self.insert(owner, PadDirection::Input, params, Some(consumer))
    }

    pub fn create_output_pad(&self, owner: &str, params: Option<PadParams>) -> PadId {
        self.insert(owner, PadDirection::Output, params, None)
    }

    fn insert(
        &self,
        owner: &str,
        direction: PadDirection,
        params: Option<PadParams>,
        consumer: Option<Weak<dyn MessageConsumer>>,
    ) -> PadId {
        let id = PadId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.pads.lock().insert(
            id,
            PadEntry {
                owner: owner.to_string(),
                direction,
                params,
                consumer,
                peers: Vec::new(),
                warned_unconnected: false,
            },
        );
        log::trace!("{owner}: created {direction:?} {id}");
        id
    }

    pub fn connect(&self, output: PadId, input: PadId) -> Result<()> {
        let mut pads = self.pads.lock();
        let out = pads.get(&output).ok_or(PipelineError::PadNotFound(output))?;
        if out.direction != PadDirection::Output {
            return Err(PipelineError::PadLink(format!("{output} is not an output pad")));
        }
        if out.peers.contains(&input) {
            return Err(PipelineError::PadLink(format!(
                "{output} already connected to {input}"
            )));
        }
        let out_owner = out.owner.clone();
        let inp = pads.get_mut(&input).ok_or(PipelineError::PadNotFound(input))?;
        if inp.direction != PadDirection::Input {
            return Err(PipelineError::PadLink(format!("{input} is not an input pad")));
        }
        inp.peers.push(output);
        let in_owner = inp.owner.clone();
        if let Some(out) = pads.get_mut(&output) {
            out.peers.push(input);
            out.warned_unconnected = false;
        }
        log::debug!("connected {out_owner}:{output} -> {in_owner}:{input}");
        Ok(())
    }

    pub fn disconnect(&self, output: PadId, input: PadId) -> Result<()> {
        let mut pads = self.pads.lock();
        let out = pads
            .get_mut(&output)
            .ok_or(PipelineError::PadNotFound(output))?;
        let before = out.peers.len();
        out.peers.retain(|p| *p != input);
        if out.peers.len() == before {
            return Err(PipelineError::PadLink(format!(
                "{output} is not connected to {input}"
            )));
        }
        if let Some(inp) = pads.get_mut(&input) {
            inp.peers.retain(|p| *p != output);
        }
        Ok(())
    }

    /// Delivers `message` to every input pad subscribed to `output`.
    ///
    /// Returns the number of consumers reached. Producing on an unconnected or
    /// destroyed pad delivers nothing and only logs.
    pub fn produce(&self, output: PadId, message: Message) -> usize {
        let targets = {
            let mut pads = self.pads.lock();
            let Some(entry) = pads.get(&output) else {
                log::warn!("produce {} on destroyed {output}", message.action());
                return 0;
            };
            if entry.direction != PadDirection::Output {
                log::warn!("produce {} on input {output}", message.action());
                return 0;
            }
            let targets: Vec<(PadId, Arc<dyn MessageConsumer>)> = entry
                .peers
                .iter()
                .filter_map(|id| {
                    let consumer = pads.get(id)?.consumer.as_ref()?.upgrade()?;
                    Some((*id, consumer))
                })
                .collect();
            if targets.is_empty() {
                if let Some(entry) = pads.get_mut(&output) {
                    if !entry.warned_unconnected {
                        entry.warned_unconnected = true;
                        log::warn!(
                            "{}: produce {} on unconnected {output}",
                            entry.owner,
                            message.action()
                        );
                    } else {
                        log::trace!("{}: dropped {} on {output}", entry.owner, message.action());
                    }
                }
            }
            targets
        };

        let delivered = targets.len();
        let mut message = Some(message);
        for (i, (pad, consumer)) in targets.into_iter().enumerate() {
            let msg = if i + 1 == delivered {
                message.take()
            } else {
                message.clone()
            };
            if let Some(msg) = msg {
                consumer.consume(pad, msg);
            }
        }
        delivered
    }

    /// Calls [`MessageConsumer::interrupt`] on every input subscribed to `output`.
    pub fn interrupt(&self, output: PadId) {
        let targets: Vec<(PadId, Arc<dyn MessageConsumer>)> = {
            let pads = self.pads.lock();
            let Some(entry) = pads.get(&output) else {
                return;
            };
            entry
                .peers
                .iter()
                .filter_map(|id| {
                    let consumer = pads.get(id)?.consumer.as_ref()?.upgrade()?;
                    Some((*id, consumer))
                })
                .collect()
        };
        for (pad, consumer) in targets {
            consumer.interrupt(pad);
        }
    }

    pub fn destroy_pad(&self, id: PadId) {
        let mut pads = self.pads.lock();
        let Some(entry) = pads.remove(&id) else {
            return;
        };
        for peer in &entry.peers {
            if let Some(p) = pads.get_mut(peer) {
                p.peers.retain(|x| *x != id);
            }
        }
        log::trace!("{}: destroyed {id}", entry.owner);
    }

    pub fn params(&self, id: PadId) -> Option<PadParams> {
        self.pads.lock().get(&id).and_then(|e| e.params.clone())
    }

    pub fn set_params(&self, id: PadId, params: Option<PadParams>) -> Result<()> {
        let mut pads = self.pads.lock();
        let entry = pads.get_mut(&id).ok_or(PipelineError::PadNotFound(id))?;
        entry.params = params;
        Ok(())
    }

    pub fn direction(&self, id: PadId) -> Option<PadDirection> {
        self.pads.lock().get(&id).map(|e| e.direction)
    }

    /// Input pads subscribed to `output`, in delivery order.
    pub fn subscribers(&self, output: PadId) -> Vec<PadId> {
        self.pads
            .lock()
            .get(&output)
            .filter(|e| e.direction == PadDirection::Output)
            .map(|e| e.peers.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, id: PadId) -> bool {
        self.pads.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[path = "pad_test.rs"]
mod pad_test;
