//! The envelope that carries both control and data across pads.

use std::fmt;

use crate::frame::Frame;
use crate::mapper::TimedFramebuffer;
use crate::packet::Packet;
use crate::pad::PadParams;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Init,
    Open,
    Start,
    Stop,
    Pause,
    Data,
    Reset,
    Cleanup,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Open => "OPEN",
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::Pause => "PAUSE",
            Self::Data => "DATA",
            Self::Reset => "RESET",
            Self::Cleanup => "CLEANUP",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Text(String),
    Params(PadParams),
    Packet(Packet),
    Frame(Frame),
    Framebuffer(TimedFramebuffer),
}

pub mod keys {
    pub const PARAMS: &str = "params";
    pub const PACKET: &str = "packet";
    pub const FRAME: &str = "frame";
    pub const FRAMEBUFFER: &str = "framebuffer";
    pub const PAUSED: &str = "paused";
    /// Set on STOP when the upstream reached end of stream and expects a flush.
    pub const EOS: &str = "eos";
}

/// An action tag plus an ordered list of named payload values.
///
/// DATA messages always carry exactly one payload.
#[derive(Clone, Debug)]
pub struct Message {
    action: Action,
    payload: Vec<(&'static str, Value)>,
}

impl Message {
    pub fn control(action: Action) -> Self {
        debug_assert!(action != Action::Data);
        Self {
            action,
            payload: Vec::new(),
        }
    }

    pub fn init(params: PadParams) -> Self {
        Self {
            action: Action::Init,
            payload: vec![(keys::PARAMS, Value::Params(params))],
        }
    }

    pub fn pause(paused: bool) -> Self {
        Self::control(Action::Pause).with_flag(keys::PAUSED, paused)
    }

    pub fn stop(eos: bool) -> Self {
        Self::control(Action::Stop).with_flag(keys::EOS, eos)
    }

    pub fn data_packet(packet: Packet) -> Self {
        Self {
            action: Action::Data,
            payload: vec![(keys::PACKET, Value::Packet(packet))],
        }
    }

    pub fn data_frame(frame: Frame) -> Self {
        Self {
            action: Action::Data,
            payload: vec![(keys::FRAME, Value::Frame(frame))],
        }
    }

    pub fn data_framebuffer(fb: TimedFramebuffer) -> Self {
        Self {
            action: Action::Data,
            payload: vec![(keys::FRAMEBUFFER, Value::Framebuffer(fb))],
        }
    }

    pub fn with_flag(self, key: &'static str, value: bool) -> Self {
        self.with_value(key, Value::Bool(value))
    }

    pub fn with_value(mut self, key: &'static str, value: Value) -> Self {
        if self.action == Action::Data {
            log::warn!("ignoring extra payload {key:?} on DATA message");
            return self;
        }
        self.payload.retain(|(k, _)| *k != key);
        self.payload.push((key, value));
        self
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn is_data(&self) -> bool {
        self.action == Action::Data
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.payload.iter().map(|(k, _)| *k)
    }

    /// Boolean flag, `false` when absent.
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some(Value::Bool(true)))
    }

    pub fn params(&self) -> Option<&PadParams> {
        match self.get(keys::PARAMS) {
            Some(Value::Params(p)) => Some(p),
            _ => None,
        }
    }

    pub fn packet(&self) -> Option<&Packet> {
        match self.get(keys::PACKET) {
            Some(Value::Packet(p)) => Some(p),
            _ => None,
        }
    }

    pub fn frame(&self) -> Option<&Frame> {
        match self.get(keys::FRAME) {
            Some(Value::Frame(f)) => Some(f),
            _ => None,
        }
    }

    pub fn framebuffer(&self) -> Option<&TimedFramebuffer> {
        match self.get(keys::FRAMEBUFFER) {
            Some(Value::Framebuffer(f)) => Some(f),
            _ => None,
        }
    }

    pub fn into_packet(self) -> Option<Packet> {
        self.into_value(keys::PACKET).and_then(|v| match v {
            Value::Packet(p) => Some(p),
            _ => None,
        })
    }

    pub fn into_frame(self) -> Option<Frame> {
        self.into_value(keys::FRAME).and_then(|v| match v {
            Value::Frame(f) => Some(f),
            _ => None,
        })
    }

    pub fn into_framebuffer(self) -> Option<TimedFramebuffer> {
        self.into_value(keys::FRAMEBUFFER).and_then(|v| match v {
            Value::Framebuffer(f) => Some(f),
            _ => None,
        })
    }

    fn into_value(self, key: &str) -> Option<Value> {
        self.payload
            .into_iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.action)?;
        for (k, v) in &self.payload {
            match v {
                Value::Bool(b) => write!(f, " {k}={b}")?,
                Value::Int(i) => write!(f, " {k}={i}")?,
                Value::Text(s) => write!(f, " {k}={s:?}")?,
                _ => write!(f, " {k}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "message_test.rs"]
mod message_test;
