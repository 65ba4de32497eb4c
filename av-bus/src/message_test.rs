use super::*;

#[test]
fn data_message_carries_exactly_one_payload() {
    let msg = Message::data_packet(Packet::new(0, vec![1, 2, 3]))
        .with_flag(keys::EOS, true)
        .with_value("extra", Value::Int(4));

    assert!(msg.is_data());
    assert_eq!(msg.keys().count(), 1);
    assert!(!msg.flag(keys::EOS));
    assert_eq!(msg.into_packet().map(|p| p.size()), Some(3));
}

#[test]
fn control_flags_keep_insertion_order() {
    let msg = Message::control(Action::Stop)
        .with_flag(keys::EOS, true)
        .with_value("reason", Value::Text("eof".to_string()));

    assert_eq!(msg.keys().collect::<Vec<_>>(), vec![keys::EOS, "reason"]);
    assert!(msg.flag(keys::EOS));
    assert!(!msg.flag(keys::PAUSED));
    assert_eq!(msg.to_string(), "STOP eos=true reason=\"eof\"");
}

#[test]
fn repeated_flag_replaces_the_previous_value() {
    let msg = Message::pause(true).with_flag(keys::PAUSED, false);
    assert_eq!(msg.keys().count(), 1);
    assert!(!msg.flag(keys::PAUSED));
}

#[test]
fn typed_getters_reject_other_payloads() {
    let msg = Message::data_packet(Packet::new(1, Vec::new()));
    assert!(msg.frame().is_none());
    assert!(msg.params().is_none());
    assert_eq!(msg.packet().map(|p| p.index()), Some(1));
}
