mod common;

use common::FakeOs;
use devhook::card::{Card, CardType, StaticCards};
use devhook::emu::ezusb::{
    ControlHeader, EzusbEmulator, IdleIo, NodeMessage, NodeReply, SecurityNode, id, ioctl,
};
use devhook::emu::serial::{
    CardReader, FIRMWARE_VERSION, Frame, FrameDecoder, FrameEvent, SerialPortEmulator, cmd, status,
};
use devhook::security::{Mcode, TokenSeed, compute_response};
use devhook::{
    Dispatcher, Handle, Handler, IoError, Irp, OpenParams, OsDevice, SecurityToken, TokenPhase,
};
use std::sync::{Arc, Mutex};
use std::thread;

const BRIDGE_PATH: &str =
    r"\\?\usb#vid_0547&pid_2750#5&2c1e4a&0&1#{ae18aa60-7f6a-11d4-97dd-00010229b959}";

const SEEDS: [u32; 3] = [0x1234_5678, 0x9ABC_DEF0, 0x0F1E_2D3C];

fn token(boot_version: &str) -> Arc<Mutex<SecurityToken>> {
    Arc::new(Mutex::new(SecurityToken::seeded(TokenSeed {
        boot_version: boot_version.parse().unwrap(),
        boot_seeds: SEEDS,
        black_mcode: "GQC02JAA".parse().unwrap(),
        white_mcode: None,
        pcbid: None,
        eamid: None,
    })))
}

fn bridge(token: Arc<Mutex<SecurityToken>>) -> Handler {
    let nodes = EzusbEmulator::standard_nodes(token, None);
    Handler::UsbBridge(EzusbEmulator::new(
        0x0547,
        0x2750,
        r"\\.\Ezusb-0",
        nodes,
        Arc::new(IdleIo),
    ))
}

fn card_reader(port: &str, card: &str) -> Handler {
    let cards = StaticCards::new(vec![Some(Card {
        id: card.parse().unwrap(),
        kind: CardType::Iso15693,
    })]);
    let reader = CardReader::new(vec![true], Box::new(cards));
    Handler::SerialPort(SerialPortEmulator::new(port, Arc::new(Mutex::new(reader))))
}

fn open(dispatcher: &Dispatcher<FakeOs>, path: &str) -> Handle {
    let mut irp = Irp::open(path, OpenParams::default());
    dispatcher.submit(&mut irp).unwrap();
    irp.handle
}

fn node_request(dispatcher: &Dispatcher<FakeOs>, handle: Handle, msg: &NodeMessage) -> NodeReply {
    let mut input = ControlHeader::default().encode().to_vec();
    input.extend(msg.encode());
    let mut output = [0u8; 64];

    let mut irp = Irp::control(handle, ioctl::VENDOR_OR_CLASS_REQUEST, &input, &mut output);
    dispatcher.submit(&mut irp).unwrap();
    let n = irp.transferred;
    NodeReply::decode(&output[..n]).unwrap()
}

fn serial_write(dispatcher: &Dispatcher<FakeOs>, handle: Handle, frame: &Frame) {
    let bytes = frame.encode().unwrap();
    let mut irp = Irp::write(handle, &bytes);
    dispatcher.submit(&mut irp).unwrap();
    assert_eq!(irp.transferred, bytes.len());
}

fn serial_read_all(dispatcher: &Dispatcher<FakeOs>, handle: Handle) -> Vec<u8> {
    let mut data = Vec::new();
    loop {
        let mut buf = [0u8; 256];
        let mut irp = Irp::read(handle, &mut buf);
        dispatcher.submit(&mut irp).unwrap();
        let n = irp.transferred;
        if n == 0 {
            return data;
        }
        data.extend_from_slice(&buf[..n]);
    }
}

fn frames(bytes: &[u8]) -> Vec<Frame> {
    FrameDecoder::new()
        .push(bytes)
        .into_iter()
        .map(|event| match event {
            FrameEvent::Frame(frame) => frame,
            other => panic!("unexpected {:?}", other),
        })
        .collect()
}

#[test]
fn first_claiming_handler_wins() {
    let dispatcher = Dispatcher::new(
        FakeOs::default(),
        vec![bridge(token("GEC02JAA")), bridge(token("GQC02JAA"))],
    );

    let handle = open(&dispatcher, BRIDGE_PATH);
    assert!(dispatcher.is_claimed(handle));
    assert_eq!(dispatcher.owner(handle), Some("ezusb"));

    let reply = node_request(
        &dispatcher,
        handle,
        &NodeMessage::new(id::SECURITY, SecurityNode::READ_BOOT_VERSION),
    );
    assert!(reply.is_ok());
    assert_eq!(reply.payload, b"GEC02JAA");
}

#[test]
fn unclaimed_requests_match_direct_os_calls() {
    const PATH: &str = r"C:\game\data\music.bin";
    let dispatcher = Dispatcher::new(
        FakeOs::with_file(PATH, b"0123456789abcdef"),
        vec![bridge(token("GEC02JAA")), card_reader("COM1", "E004010000000001")],
    );

    assert!(dispatcher.route(&mut Irp::open(PATH, OpenParams::default())).is_pass_through());

    let via = open(&dispatcher, PATH);
    assert!(!dispatcher.is_claimed(via));
    let direct = dispatcher.os().open(PATH, &OpenParams::default()).unwrap();

    let mut routed = [0u8; 10];
    let mut irp = Irp::read(via, &mut routed);
    dispatcher.submit(&mut irp).unwrap();
    let n = irp.transferred;

    let mut plain = [0u8; 10];
    let m = dispatcher.os().read(direct, &mut plain).unwrap();
    assert_eq!(&routed[..n], &plain[..m]);

    let mut irp = Irp::close(via);
    dispatcher.submit(&mut irp).unwrap();
    assert_eq!(
        dispatcher.submit(&mut Irp::open(r"C:\missing.bin", OpenParams::default())),
        Err(IoError::NotFound)
    );
}

#[test]
fn emulated_handles_are_backed_by_the_null_device() {
    let dispatcher = Dispatcher::new(
        FakeOs::default(),
        vec![card_reader("COM1", "E004010000000001")],
    );

    let a = open(&dispatcher, r"\\.\COM1");
    let b = open(&dispatcher, "COM1");
    assert_ne!(a, b);
    assert!(dispatcher.os().is_null(a));
    assert!(dispatcher.os().is_null(b));
    assert_eq!(dispatcher.claimed_count(), 2);

    dispatcher.submit(&mut Irp::close(a)).unwrap();
    dispatcher.submit(&mut Irp::close(b)).unwrap();
    assert_eq!(dispatcher.claimed_count(), 0);
    assert_eq!(dispatcher.os().open_handles(), 0);
}

#[test]
fn failed_null_device_open_leaves_nothing_bound() {
    let dispatcher = Dispatcher::new(
        FakeOs::without_null_device(),
        vec![card_reader("COM1", "E004010000000001")],
    );

    let mut irp = Irp::open("COM1", OpenParams::default());
    assert_eq!(dispatcher.submit(&mut irp), Err(IoError::NotFound));
    assert_eq!(dispatcher.claimed_count(), 0);
    assert_eq!(dispatcher.os().open_handles(), 0);
}

#[test]
fn closed_handle_reports_invalid_handle() {
    let dispatcher = Dispatcher::new(FakeOs::default(), vec![bridge(token("GEC02JAA"))]);
    let handle = open(&dispatcher, r"\\.\Ezusb-0");

    dispatcher.submit(&mut Irp::close(handle)).unwrap();
    assert!(!dispatcher.is_claimed(handle));

    let mut buf = [0u8; 8];
    assert_eq!(
        dispatcher.submit(&mut Irp::read(handle, &mut buf)),
        Err(IoError::InvalidHandle)
    );
    assert_eq!(
        dispatcher.submit(&mut Irp::control(handle, ioctl::RESET, &[], &mut [])),
        Err(IoError::InvalidHandle)
    );
    assert_eq!(
        dispatcher.submit(&mut Irp::close(handle)),
        Err(IoError::InvalidHandle)
    );
}

#[test]
fn serial_port_answers_framed_commands() {
    let dispatcher = Dispatcher::new(
        FakeOs::default(),
        vec![card_reader("COM1", "E004010000000001")],
    );
    let handle = open(&dispatcher, "COM1");

    serial_write(&dispatcher, handle, &Frame::new(0, cmd::GET_VERSION, Vec::new()));
    serial_write(&dispatcher, handle, &Frame::new(0, cmd::READ_CARD, Vec::new()));

    let replies = frames(&serial_read_all(&dispatcher, handle));
    assert_eq!(replies.len(), 2);

    let mut version = vec![status::OK];
    version.extend_from_slice(FIRMWARE_VERSION);
    assert_eq!(replies[0].payload, version);
    assert_eq!(
        replies[1].payload,
        [status::OK, 0, 0xE0, 0x04, 0x01, 0, 0, 0, 0, 0x01]
    );
}

#[test]
fn security_handshake_through_the_dispatcher() {
    let token = token("GEC02JAA");
    let dispatcher = Dispatcher::new(FakeOs::default(), vec![bridge(Arc::clone(&token))]);
    let handle = open(&dispatcher, BRIDGE_PATH);

    let challenge = [1u8, 2, 3, 4, 5, 6, 7, 8];
    let reply = node_request(
        &dispatcher,
        handle,
        &NodeMessage::new(id::SECURITY, SecurityNode::CHALLENGE).with_payload(challenge),
    );
    assert!(reply.is_ok());
    assert_eq!(
        reply.payload,
        [0x0D, 0xDE, 0xBF, 0x57, 0xA8, 0x2C, 0xB0, 0x8F]
    );
    assert_eq!(
        reply.payload,
        compute_response(&SEEDS, &"GQC02JAA".parse::<Mcode>().unwrap(), &challenge)
    );

    let verify = node_request(
        &dispatcher,
        handle,
        &NodeMessage::new(id::SECURITY, SecurityNode::VERIFY).with_payload(reply.payload),
    );
    assert!(verify.is_ok());
    assert_eq!(token.lock().unwrap().phase(), TokenPhase::Verified);
}

#[test]
fn handles_on_different_emulators_run_independently() {
    let dispatcher = Dispatcher::new(
        FakeOs::default(),
        vec![
            bridge(token("GEC02JAA")),
            card_reader("COM1", "E004010000000001"),
        ],
    );
    let usb = open(&dispatcher, BRIDGE_PATH);
    let serial = open(&dispatcher, "COM1");

    thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..200 {
                let reply = node_request(
                    &dispatcher,
                    usb,
                    &NodeMessage::new(id::SECURITY, SecurityNode::READ_BOOT_VERSION),
                );
                assert_eq!(reply.payload, b"GEC02JAA");
            }
        });
        s.spawn(|| {
            for _ in 0..200 {
                serial_write(&dispatcher, serial, &Frame::new(0, cmd::GET_STATUS, Vec::new()));
                let replies = frames(&serial_read_all(&dispatcher, serial));
                assert_eq!(replies, vec![Frame::new(0, cmd::GET_STATUS, vec![status::OK, 1])]);
            }
        });
    });
}

#[test]
fn calls_on_one_handle_are_serialized() {
    let dispatcher = Dispatcher::new(
        FakeOs::default(),
        vec![
            bridge(token("GEC02JAA")),
            card_reader("COM1", "E004010000000001"),
        ],
    );
    let usb = open(&dispatcher, BRIDGE_PATH);
    let serial = open(&dispatcher, "COM1");

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..100 {
                    let reply = node_request(
                        &dispatcher,
                        usb,
                        &NodeMessage::new(id::SECURITY, SecurityNode::READ_BOOT_VERSION),
                    );
                    assert_eq!(reply.payload, b"GEC02JAA");
                    serial_write(&dispatcher, serial, &Frame::new(0, cmd::GET_VERSION, Vec::new()));
                }
            });
        }
    });

    // Every write landed whole: the stream decodes into exactly one reply
    // per request, none corrupt.
    let replies = frames(&serial_read_all(&dispatcher, serial));
    assert_eq!(replies.len(), 400);
    assert!(replies.iter().all(|f| f.cmd == cmd::GET_VERSION));
}
