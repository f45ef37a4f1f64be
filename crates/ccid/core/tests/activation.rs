mod common;

use common::*;
use nexum_ccid_core::message::ParameterBlock;
use nexum_ccid_core::t1::{Block, SKind};
use nexum_ccid_core::{
    AtrError, Error, NegotiationError, Protocol, Protocols, ReaderCapabilities, ReaderFeatures,
    SlotError, SlotState,
};

fn programmed_fi_di(block: &ParameterBlock) -> u8 {
    match block {
        ParameterBlock::T0 { fi_di, .. } | ParameterBlock::T1 { fi_di, .. } => *fi_di,
    }
}

fn activation_error(state: SlotState) -> Error {
    match state {
        SlotState::NotActivated(e) => e.root().clone(),
        other => panic!("expected a failed activation, got {other:?}"),
    }
}

#[test]
fn test_pps_accepted() {
    let (reader, mock) = attach(vec![CardSim::t1()]);
    reader.handle_event(inserted(0)).unwrap();

    let slot = reader.slot(0).unwrap();
    assert_eq!(slot.state(), SlotState::Active);
    let params = slot.operating_parameters().unwrap();
    assert_eq!(params.protocol, Protocol::T1);
    assert_eq!(params.fi_di(), 0x96);

    let state = mock.state();
    let card = &state.cards[0];
    assert_eq!(card.pps_requests, vec![vec![0xFF, 0x11, 0x96, 0x78]]);
    assert_eq!(card.set_parameters.len(), 1);
    assert_eq!(programmed_fi_di(&card.set_parameters[0]), 0x96);
}

#[test]
fn test_pps_fallback_to_default_rates() {
    let (reader, mock) = attach(vec![CardSim::t1().with_pps(PpsMode::EchoDefaults)]);
    reader.handle_event(inserted(0)).unwrap();

    let slot = reader.slot(0).unwrap();
    assert_eq!(slot.state(), SlotState::Active);
    let params = slot.operating_parameters().unwrap();
    assert_eq!(params.protocol, Protocol::T1);
    assert_eq!((params.fi_index, params.di_index), (1, 1));

    let engine = slot.t1_engine().unwrap();
    assert_eq!(engine.ifsc(), 0xFE);
    assert_eq!(engine.ifsd(), 254);

    let state = mock.state();
    assert_eq!(programmed_fi_di(&state.cards[0].set_parameters[0]), 0x11);
}

#[test]
fn test_pps_declined() {
    let (reader, _mock) = attach(vec![CardSim::t1().with_pps(PpsMode::Decline)]);
    reader.handle_event(inserted(0)).unwrap();

    let params = reader.slot(0).unwrap().operating_parameters().unwrap();
    assert_eq!(params.fi_di(), 0x11);
}

#[test]
fn test_ifsd_announced_after_activation() {
    let (reader, mock) = attach(vec![CardSim::t1()]);
    reader.handle_event(inserted(0)).unwrap();

    let state = mock.state();
    let card = &state.cards[0];
    assert!(card.information_blocks().is_empty());
    assert_eq!(card.host_blocks.len(), 1);
    assert!(matches!(
        &card.host_blocks[0],
        Block::Supervisory { kind: SKind::Ifs, response: false, data } if data[..] == [254]
    ));
    let engine = reader.slot(0).unwrap().t1_engine().unwrap();
    assert_eq!(engine.ifsd(), 254);
    assert!(!engine.is_started());
}

#[test]
fn test_no_common_protocol() {
    let caps = tpdu_caps().with_protocols(Protocols::T0);
    let (reader, mock) = attach_with(vec![CardSim::t1()], caps, test_config());

    let err = reader.handle_event(inserted(0)).unwrap_err();
    assert_eq!(
        err.root(),
        &Error::Negotiation(NegotiationError::NoCommonProtocol)
    );

    let slot = reader.slot(0).unwrap();
    assert!(slot.is_present());
    assert!(slot.parsed_atr().is_some());
    assert!(slot.operating_parameters().is_none());
    assert_eq!(
        activation_error(slot.state()),
        Error::Negotiation(NegotiationError::NoCommonProtocol)
    );
    assert!(mock.state().cards[0].set_parameters.is_empty());

    let owner = reader.new_owner();
    slot.begin_transaction(owner, false).unwrap();
    assert_eq!(
        slot.write(owner, vec![0x00, 0xA4, 0x04, 0x00]),
        Err(Error::Slot(SlotError::NotActivated))
    );
}

#[test]
fn test_crc_card_rejected() {
    let card = CardSim::new(atr_with_tck("3B 80 81 41 01"));
    let (reader, _mock) = attach(vec![card]);
    reader.handle_event(inserted(0)).unwrap_err();

    assert_eq!(
        activation_error(reader.slot(0).unwrap().state()),
        Error::Negotiation(NegotiationError::UnsupportedChecksum)
    );
}

#[test]
fn test_malformed_atr() {
    let card = CardSim::new(vec![0x3B, 0x05, 0x01]);
    let (reader, _mock) = attach(vec![card]);
    reader.handle_event(inserted(0)).unwrap_err();

    let slot = reader.slot(0).unwrap();
    assert!(slot.parsed_atr().is_none());
    assert_eq!(activation_error(slot.state()), Error::Atr(AtrError::Overrun));
}

#[test]
fn test_mute_card_on_insert() {
    let (reader, _mock) = attach(vec![CardSim::t1().absent()]);
    let err = reader.handle_event(inserted(0)).unwrap_err();
    assert!(err.is_card_absent());
}

#[test]
fn test_rejected_parameters() {
    let mut card = CardSim::t1();
    card.reject_parameters = true;
    let (reader, _mock) = attach(vec![card]);
    reader.handle_event(inserted(0)).unwrap_err();

    assert_eq!(
        activation_error(reader.slot(0).unwrap().state()),
        Error::Negotiation(NegotiationError::DeviceRejectedParameters)
    );
}

#[test]
fn test_t0_card_needs_apdu_reader() {
    let (reader, _mock) = attach(vec![CardSim::t0_apdu()]);
    reader.handle_event(inserted(0)).unwrap_err();

    assert_eq!(
        activation_error(reader.slot(0).unwrap().state()),
        Error::Negotiation(NegotiationError::UnsupportedExchangeLevel(Protocol::T0))
    );
}

#[test]
fn test_apdu_level_reader() {
    fn reverse(apdu: &[u8]) -> Vec<u8> {
        let mut response: Vec<u8> = apdu.iter().rev().copied().collect();
        response.extend_from_slice(&[0x90, 0x00]);
        response
    }

    let caps = ReaderCapabilities::default().with_features(
        ReaderFeatures::SHORT_APDU | ReaderFeatures::AUTO_PARAM_NEG | ReaderFeatures::AUTO_PPS,
    );
    let card = CardSim::t0_apdu().with_responder(reverse);
    let (reader, mock) = attach_with(vec![card], caps, test_config());
    reader.handle_event(inserted(0)).unwrap();

    let slot = reader.slot(0).unwrap();
    assert_eq!(slot.state(), SlotState::Active);
    assert!(slot.t1_engine().is_none());
    assert!(mock.state().cards[0].pps_requests.is_empty());

    let owner = reader.new_owner();
    slot.begin_transaction(owner, false).unwrap();
    let response = slot.transmit(owner, vec![0x01, 0x02, 0x03]).unwrap();
    assert_eq!(&response[..], &[0x03, 0x02, 0x01, 0x90, 0x00]);
}

#[test]
fn test_time_extension_during_power_on() {
    let mock_card = CardSim::t1();
    let (reader, mock) = attach(vec![mock_card]);
    mock.state().time_extensions = 2;

    reader.handle_event(inserted(0)).unwrap();
    assert_eq!(reader.slot(0).unwrap().state(), SlotState::Active);
    assert_eq!(mock.state().overlap_violations, 0);
}
