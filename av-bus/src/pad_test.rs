use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::*;
use crate::message::{Action, Message};
use crate::packet::Packet;
use crate::stream::CodecId;

#[derive(Default)]
struct Collector {
    seen: Mutex<Vec<(PadId, Action, Option<usize>)>>,
}

impl MessageConsumer for Collector {
    fn consume(&self, pad: PadId, message: Message) {
        let size = message.packet().map(|p| p.size());
        self.seen.lock().push((pad, message.action(), size));
    }
}

fn input(graph: &PadGraph, owner: &str, c: &Arc<Collector>) -> PadId {
    let weak: Weak<dyn MessageConsumer> = Arc::downgrade(c) as Weak<Collector>;
    graph.create_input_pad(owner, None, weak)
}

#[test]
fn fan_out_in_subscription_order() {
    let graph = PadGraph::new();
    let a = Arc::new(Collector::default());
    let b = Arc::new(Collector::default());
    let out = graph.create_output_pad("src", None);
    let in_b = input(&graph, "b", &b);
    let in_a = input(&graph, "a", &a);
    graph.connect(out, in_b).unwrap();
    graph.connect(out, in_a).unwrap();
    assert_eq!(graph.subscribers(out), vec![in_b, in_a]);

    for n in 0..5 {
        let delivered = graph.produce(out, Message::data_packet(Packet::new(0, vec![0u8; n])));
        assert_eq!(delivered, 2);
    }

    let sizes = |c: &Collector| c.seen.lock().iter().map(|s| s.2).collect::<Vec<_>>();
    assert_eq!(sizes(&a), (0..5).map(Some).collect::<Vec<_>>());
    assert_eq!(sizes(&b), sizes(&a));
    assert!(a.seen.lock().iter().all(|s| s.0 == in_a));
}

#[test]
fn unconnected_and_destroyed_pads_are_noops() {
    let graph = PadGraph::new();
    let out = graph.create_output_pad("src", None);
    assert_eq!(graph.produce(out, Message::control(Action::Start)), 0);
    assert_eq!(graph.produce(out, Message::control(Action::Start)), 0);

    graph.destroy_pad(out);
    assert!(!graph.contains(out));
    assert_eq!(graph.produce(out, Message::control(Action::Start)), 0);
}

#[test]
fn destroying_an_input_unsubscribes_it() {
    let graph = PadGraph::new();
    let c = Arc::new(Collector::default());
    let out = graph.create_output_pad("src", None);
    let inp = input(&graph, "sink", &c);
    graph.connect(out, inp).unwrap();
    graph.destroy_pad(inp);

    assert!(graph.subscribers(out).is_empty());
    assert_eq!(graph.produce(out, Message::control(Action::Stop)), 0);
}

#[test]
fn dropped_consumer_is_skipped() {
    let graph = PadGraph::new();
    let c = Arc::new(Collector::default());
    let out = graph.create_output_pad("src", None);
    let inp = input(&graph, "sink", &c);
    graph.connect(out, inp).unwrap();
    drop(c);
    assert_eq!(graph.produce(out, Message::control(Action::Stop)), 0);
}

#[test]
fn connect_checks_direction_and_duplicates() {
    let graph = PadGraph::new();
    let c = Arc::new(Collector::default());
    let out = graph.create_output_pad("src", None);
    let inp = input(&graph, "sink", &c);

    assert_eq!(graph.connect(inp, out).unwrap_err().code(), 401);
    graph.connect(out, inp).unwrap();
    assert_eq!(graph.connect(out, inp).unwrap_err().code(), 401);
    graph.disconnect(out, inp).unwrap();
    assert!(graph.disconnect(out, inp).is_err());

    graph.destroy_pad(inp);
    assert_eq!(graph.connect(out, inp).unwrap_err().code(), 400);
}

#[test]
fn params_follow_the_pad() {
    let graph = PadGraph::new();
    let desc = StreamDescriptor::video(0, CodecId::H264, 320, 240);
    let out = graph.create_output_pad("src", Some(PadParams::packet(desc.clone())));
    assert_eq!(
        graph.params(out).and_then(|p| p.as_packet().map(|p| p.stream.clone())),
        Some(desc)
    );
    graph.set_params(out, None).unwrap();
    assert!(graph.params(out).is_none());
}

struct Relay {
    graph: Arc<PadGraph>,
    out: PadId,
}

impl MessageConsumer for Relay {
    fn consume(&self, _pad: PadId, message: Message) {
        self.graph.produce(self.out, message);
    }
}

#[test]
fn consumers_may_produce_reentrantly() {
    let graph = PadGraph::new();
    let sink = Arc::new(Collector::default());
    let head = graph.create_output_pad("head", None);
    let relay_out = graph.create_output_pad("relay", None);
    let relay = Arc::new(Relay {
        graph: graph.clone(),
        out: relay_out,
    });
    let weak: Weak<dyn MessageConsumer> = Arc::downgrade(&relay) as Weak<Relay>;
    let relay_in = graph.create_input_pad("relay", None, weak);
    let sink_in = input(&graph, "sink", &sink);
    graph.connect(head, relay_in).unwrap();
    graph.connect(relay_out, sink_in).unwrap();

    graph.produce(head, Message::control(Action::Start));
    assert_eq!(sink.seen.lock().len(), 1);
}
