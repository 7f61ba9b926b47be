use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use codec::{Frame, OpCode};
use parking_lot::Mutex;
use rand::Rng;
use websocketd_service::{
    Error, FrameKind, Options, Protocol, Server, SessionContext, SessionHandler, SessionId, State,
    Transport, TransportError,
};

const MASK: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

const REQUEST: &[u8] = b"GET / HTTP/1.1\r\n\
    Host: 127.0.0.1\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Sec-WebSocket-Protocol: chat, superchat\r\n\
    Sec-WebSocket-Version: 13\r\n\r\n";

#[derive(Default)]
struct Wire {
    sent: Vec<u8>,
    capacity: usize,
    /// Sends larger than this are refused even when the window is open.
    max_send: Option<usize>,
    received: usize,
    closed: bool,
    aborted: bool,
}

#[derive(Clone)]
struct MockTransport(Arc<Mutex<Wire>>);

impl MockTransport {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Wire {
            capacity: 65536,
            ..Default::default()
        })))
    }

    fn take_sent(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.lock().sent)
    }

    fn set_capacity(&self, capacity: usize) {
        self.0.lock().capacity = capacity;
    }

    fn set_max_send(&self, max: Option<usize>) {
        self.0.lock().max_send = max;
    }

    fn acked(&self) -> usize {
        self.0.lock().received
    }

    fn is_closed(&self) -> bool {
        self.0.lock().closed
    }

    fn is_aborted(&self) -> bool {
        self.0.lock().aborted
    }
}

impl Transport for MockTransport {
    fn send_capacity(&self) -> usize {
        self.0.lock().capacity
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut wire = self.0.lock();
        if wire.closed || wire.aborted {
            return Err(TransportError::Closed);
        }

        if bytes.len() > wire.capacity || wire.max_send.is_some_and(|max| bytes.len() > max) {
            return Err(TransportError::WouldBlock);
        }

        wire.sent.extend_from_slice(bytes);
        Ok(())
    }

    fn received(&mut self, len: usize) {
        self.0.lock().received += len;
    }

    fn close(&mut self) {
        self.0.lock().closed = true;
    }

    fn abort(&mut self) {
        self.0.lock().aborted = true;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Connect(SessionId),
    Disconnect(SessionId),
    Message(SessionId, Vec<u8>),
}

#[derive(Clone, Default)]
struct Handler {
    events: Arc<Mutex<Vec<Event>>>,
    policy: Option<Protocol>,
    text_handler: bool,
}

impl Handler {
    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl SessionHandler for Handler {
    fn on_protocol_select(&self, _: SessionId, _: &[&str]) -> Option<Protocol> {
        self.policy.clone()
    }

    fn on_client_connect(&self, ctx: &mut SessionContext<'_>) {
        self.events.lock().push(Event::Connect(ctx.id));

        if self.text_handler {
            let events = self.events.clone();
            ctx.register_frame_handler(
                FrameKind::Text,
                Box::new(move |id, message| {
                    events.lock().push(Event::Message(id, message.to_vec()));
                }),
            );
        }
    }

    fn on_client_disconnect(&self, id: SessionId) {
        self.events.lock().push(Event::Disconnect(id));
    }
}

fn client_frame(opcode: OpCode, fin: bool, payload: &[u8]) -> Vec<u8> {
    let mut bytes = BytesMut::new();
    Frame::new(opcode, payload)
        .with_fin(fin)
        .with_mask(MASK)
        .encode(&mut bytes)
        .unwrap();

    bytes.to_vec()
}

/// Split unmasked server frames into (first header byte, payload).
fn server_frames(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut frames = Vec::new();

    while bytes.len() >= 2 {
        let (header, size) = match bytes[1] {
            126 => (4, u16::from_be_bytes([bytes[2], bytes[3]]) as usize),
            len => (2, len as usize),
        };

        frames.push((bytes[0], bytes[header..header + size].to_vec()));
        bytes = &bytes[header + size..];
    }

    frames
}

fn upgrade(server: &mut Server<MockTransport, Handler>) -> Result<(SessionId, MockTransport)> {
    let transport = MockTransport::new();
    let id = server.accept(transport.clone())?;

    server.on_receive(id, Some(Bytes::from_static(REQUEST)))?;
    assert_eq!(server.state(id), State::Connected);

    transport.take_sent();
    Ok((id, transport))
}

fn read_all(server: &Server<MockTransport, Handler>, id: SessionId) -> Vec<u8> {
    let mut bytes = Vec::new();
    if let Some(stream) = server.stream(id) {
        while let Some(byte) = stream.read_byte() {
            bytes.push(byte);
        }
    }

    bytes
}

#[test]
fn test_handshake_upgrade() -> Result<()> {
    let handler = Handler::default();
    let mut server = Server::new(Options::default(), handler.clone());

    let transport = MockTransport::new();
    let id = server.accept(transport.clone())?;
    assert_eq!(server.state(id), State::Connecting);

    for chunk in REQUEST.chunks(7) {
        server.on_receive(id, Some(Bytes::copy_from_slice(chunk)))?;
    }

    assert_eq!(server.state(id), State::Connected);
    assert_eq!(server.protocol(id), Some("chat"));
    assert_eq!(transport.acked(), REQUEST.len());
    assert_eq!(handler.events(), vec![Event::Connect(id)]);
    assert_eq!(
        transport.take_sent(),
        b"HTTP/1.1 101 Switching Protocols\r\n\
          Upgrade: websocket\r\n\
          Connection: Upgrade\r\n\
          Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
          Sec-WebSocket-Protocol: chat\r\n\r\n"
    );

    Ok(())
}

#[test]
fn test_handshake_missing_key() -> Result<()> {
    let handler = Handler::default();
    let mut server = Server::new(Options::default(), handler.clone());

    let transport = MockTransport::new();
    let id = server.accept(transport.clone())?;

    let result = server.on_receive(
        id,
        Some(Bytes::from_static(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")),
    );

    assert!(matches!(result, Err(Error::Codec(codec::Error::MissingKey))));
    assert_eq!(server.state(id), State::Free);
    assert_eq!(
        transport.take_sent(),
        b"HTTP/1.1 400\r\nStatus: 400 Bad Request\r\n\r\n"
    );
    assert!(transport.is_closed());
    assert!(handler.events().is_empty());

    // The slot is reusable.
    upgrade(&mut server)?;

    Ok(())
}

#[test]
fn test_handshake_request_too_large() -> Result<()> {
    let mut server = Server::new(Options::default(), Handler::default());

    let transport = MockTransport::new();
    let id = server.accept(transport.clone())?;

    let mut result = Ok(());
    for _ in 0..12 {
        result = server.on_receive(id, Some(Bytes::from_static(&[b'a'; 100])));
        if result.is_err() {
            break;
        }
    }

    assert!(matches!(
        result,
        Err(Error::Codec(codec::Error::RequestTooLarge))
    ));
    assert_eq!(server.state(id), State::Free);
    assert!(transport.take_sent().starts_with(b"HTTP/1.1 400"));

    Ok(())
}

#[test]
fn test_protocol_selection() -> Result<()> {
    // Policy wins over the first candidate.
    let mut server = Server::new(
        Options::default(),
        Handler {
            policy: Some(Protocol {
                name: "superchat".to_string(),
                binary: false,
            }),
            ..Default::default()
        },
    );

    let transport = MockTransport::new();
    let id = server.accept(transport.clone())?;
    server.on_receive(id, Some(Bytes::from_static(REQUEST)))?;

    let response = String::from_utf8(transport.take_sent())?;
    assert!(response.ends_with("Sec-WebSocket-Protocol: superchat\r\n\r\n"));
    assert_eq!(server.protocol(id), Some("superchat"));

    // A client asking for arduino first gets binary frames.
    let mut server = Server::new(Options::default(), Handler::default());
    let transport = MockTransport::new();
    let id = server.accept(transport.clone())?;
    server.on_receive(
        id,
        Some(Bytes::from_static(
            b"GET / HTTP/1.1\r\nSec-WebSocket-Key: abc\r\nSec-WebSocket-Protocol:  arduino , chat\r\n\r\n",
        )),
    )?;

    assert_eq!(server.protocol(id), Some("arduino"));
    transport.take_sent();

    let stream = server.stream(id).unwrap();
    assert_eq!(stream.write_str("ok\r\n"), 4);
    server.poll(server.now());

    assert_eq!(
        server_frames(&transport.take_sent()),
        vec![(0x82, b"ok\r\n".to_vec())]
    );

    // No protocol header, no protocol in the answer.
    let mut server = Server::new(Options::default(), Handler::default());
    let transport = MockTransport::new();
    let id = server.accept(transport.clone())?;
    server.on_receive(
        id,
        Some(Bytes::from_static(
            b"GET / HTTP/1.1\r\nSec-WebSocket-Key: abc\r\n\r\n",
        )),
    )?;

    assert_eq!(server.protocol(id), None);
    let response = String::from_utf8(transport.take_sent())?;
    assert!(!response.contains("Sec-WebSocket-Protocol"));

    Ok(())
}

#[test]
fn test_frames_after_request_in_same_chunk() -> Result<()> {
    let mut server = Server::new(Options::default(), Handler::default());

    let transport = MockTransport::new();
    let id = server.accept(transport.clone())?;

    let mut bytes = REQUEST.to_vec();
    bytes.extend(client_frame(OpCode::Text, true, b"$$\n"));
    server.on_receive(id, Some(Bytes::from(bytes.clone())))?;

    assert_eq!(read_all(&server, id), b"$$\n");
    assert_eq!(transport.acked(), bytes.len());

    Ok(())
}

#[test]
fn test_random_chunk_boundaries() -> Result<()> {
    let mut rng = rand::rng();

    for _ in 0..16 {
        let mut server = Server::new(Options::default(), Handler::default());
        let (id, transport) = upgrade(&mut server)?;

        let mut wire = Vec::new();
        let mut expected = Vec::new();
        let mut pings = Vec::new();

        for _ in 0..40 {
            let len = rng.random_range(0..400);
            let payload = (0..len)
                .map(|_| rng.random_range(b' '..=b'~'))
                .collect::<Vec<_>>();

            if len > 2 && rng.random_bool(0.3) {
                let split = rng.random_range(1..len);
                wire.extend(client_frame(OpCode::Text, false, &payload[..split]));
                wire.extend(client_frame(OpCode::Continuation, true, &payload[split..]));
            } else {
                wire.extend(client_frame(OpCode::Text, true, &payload));
            }

            expected.extend_from_slice(&payload);

            if rng.random_bool(0.2) {
                let ping = (0..rng.random_range(0..6))
                    .map(|_| rng.random::<u8>())
                    .collect::<Vec<_>>();

                wire.extend(client_frame(OpCode::Ping, true, &ping));
                pings.push(ping);
            }
        }

        let mut output = Vec::new();
        let mut input = &wire[..];
        while !input.is_empty() {
            let size = rng.random_range(1..=input.len().min(64));
            let (chunk, rest) = input.split_at(size);
            input = rest;

            server.on_receive(id, Some(Bytes::copy_from_slice(chunk)))?;
            output.extend(read_all(&server, id));
        }

        assert_eq!(output, expected);
        assert_eq!(transport.acked(), REQUEST.len() + wire.len());

        let pongs = server_frames(&transport.take_sent())
            .into_iter()
            .map(|(token, payload)| {
                assert_eq!(token, 0x8A);
                payload
            })
            .collect::<Vec<_>>();

        assert_eq!(pongs, pings);
    }

    Ok(())
}

#[test]
fn test_fragmented_message_single_callback() -> Result<()> {
    let handler = Handler {
        text_handler: true,
        ..Default::default()
    };

    let mut server = Server::new(Options::default(), handler.clone());
    let (id, transport) = upgrade(&mut server)?;

    let mut wire = client_frame(OpCode::Text, false, b"Hel");
    wire.extend(client_frame(OpCode::Ping, true, b"p"));
    wire.extend(client_frame(OpCode::Continuation, false, b"lo, "));
    wire.extend(client_frame(OpCode::Continuation, true, b"world"));

    for chunk in wire.chunks(5) {
        server.on_receive(id, Some(Bytes::copy_from_slice(chunk)))?;
    }

    assert_eq!(
        handler.events(),
        vec![
            Event::Connect(id),
            Event::Message(id, b"Hello, world".to_vec())
        ]
    );

    assert!(read_all(&server, id).is_empty());
    assert_eq!(
        server_frames(&transport.take_sent()),
        vec![(0x8A, b"p".to_vec())]
    );

    // Binary data still goes to the stream.
    server.on_receive(
        id,
        Some(Bytes::from(client_frame(OpCode::Binary, true, b"G0"))),
    )?;

    assert_eq!(read_all(&server, id), b"G0");

    Ok(())
}

#[test]
fn test_inbound_backpressure() -> Result<()> {
    let mut server = Server::new(
        Options {
            rx_buffer_size: 16,
            ..Default::default()
        },
        Handler::default(),
    );

    let (id, transport) = upgrade(&mut server)?;
    let stream = server.stream(id).unwrap();

    let payload = (0..100u8).collect::<Vec<_>>();
    let mut wire = client_frame(OpCode::Binary, true, &payload);
    wire.extend(client_frame(OpCode::Text, true, b"end"));

    server.on_receive(id, Some(Bytes::from(wire.clone())))?;

    assert_eq!(stream.rx_count(), 15);
    assert_eq!(stream.rx_free(), 0);
    assert!(stream.is_overflow());
    stream.clear_overflow();

    let mut output = Vec::new();
    for _ in 0..20 {
        output.extend(read_all(&server, id));
        server.poll(server.now());
    }

    output.extend(read_all(&server, id));

    let mut expected = payload.clone();
    expected.extend_from_slice(b"end");
    assert_eq!(output, expected);
    assert_eq!(transport.acked(), REQUEST.len() + wire.len());

    Ok(())
}

#[test]
fn test_ping_liveness() -> Result<()> {
    let handler = Handler::default();
    let mut server = Server::new(Options::default(), handler.clone());
    let (id, transport) = upgrade(&mut server)?;

    let start = server.now();
    let at = |secs: f64| start + Duration::from_secs_f64(secs);

    server.poll(at(2.9));
    assert!(transport.take_sent().is_empty());

    server.poll(at(3.0));
    assert_eq!(transport.take_sent(), [0x89, 0x02, b'H', b'i']);

    server.poll(at(6.0));
    assert_eq!(server_frames(&transport.take_sent()).len(), 1);

    // A pong resets the counter.
    server.on_receive(id, Some(Bytes::from(client_frame(OpCode::Pong, true, b"Hi"))))?;

    for secs in [9.0, 12.0, 15.0, 18.0] {
        server.poll(at(secs));
        assert_eq!(server.state(id), State::Connected);
    }

    assert_eq!(server_frames(&transport.take_sent()).len(), 4);

    server.poll(at(18.5));
    assert_eq!(server.state(id), State::Closing);

    server.poll(at(18.6));
    assert_eq!(server.state(id), State::Free);
    assert!(transport.is_closed());
    assert_eq!(
        handler.events(),
        vec![Event::Connect(id), Event::Disconnect(id)]
    );

    Ok(())
}

#[test]
fn test_outbound_traffic_delays_ping() -> Result<()> {
    let mut server = Server::new(Options::default(), Handler::default());
    let (id, transport) = upgrade(&mut server)?;

    let start = server.now();
    let stream = server.stream(id).unwrap();

    stream.write_str("ok\r\n");
    server.poll(start + Duration::from_secs(2));
    assert_eq!(
        server_frames(&transport.take_sent()),
        vec![(0x81, b"ok\r\n".to_vec())]
    );

    server.poll(start + Duration::from_secs(4));
    assert!(transport.take_sent().is_empty());

    server.poll(start + Duration::from_secs(5));
    assert_eq!(transport.take_sent(), [0x89, 0x02, b'H', b'i']);

    Ok(())
}

#[test]
fn test_close_echo() -> Result<()> {
    let handler = Handler::default();
    let mut server = Server::new(Options::default(), handler.clone());
    let (id, transport) = upgrade(&mut server)?;

    let mut wire = client_frame(OpCode::Close, true, &[0x03, 0xE8]);
    wire.extend(client_frame(OpCode::Text, true, b"ignored"));

    server.on_receive(id, Some(Bytes::from(wire.clone())))?;

    assert_eq!(transport.take_sent(), [0x88, 0x02, 0x03, 0xE8]);
    assert_eq!(server.state(id), State::Closing);
    assert!(read_all(&server, id).is_empty());
    assert_eq!(transport.acked(), REQUEST.len() + wire.len());

    // Ping frames are not answered while closing.
    server.on_receive(id, Some(Bytes::from(client_frame(OpCode::Ping, true, b""))))?;
    assert!(transport.take_sent().is_empty());

    server.poll(server.now());
    assert_eq!(server.state(id), State::Free);
    assert!(transport.is_closed());
    assert!(!transport.is_aborted());
    assert_eq!(
        handler.events(),
        vec![Event::Connect(id), Event::Disconnect(id)]
    );

    // The old id is stale now.
    assert!(matches!(
        server.on_receive(id, Some(Bytes::from_static(b"x"))),
        Err(Error::UnknownSession)
    ));

    Ok(())
}

#[test]
fn test_unsupported_payload_length() -> Result<()> {
    let handler = Handler::default();
    let mut server = Server::new(Options::default(), handler.clone());
    let (id, transport) = upgrade(&mut server)?;

    let result = server.on_receive(
        id,
        Some(Bytes::from_static(&[0x82, 0xFF, 0, 0, 0, 0, 0, 1, 0, 0])),
    );

    assert!(matches!(
        result,
        Err(Error::Codec(codec::Error::UnsupportedPayloadLength(127)))
    ));
    assert_eq!(server.state(id), State::Free);
    assert!(transport.is_aborted());
    assert_eq!(
        handler.events(),
        vec![Event::Connect(id), Event::Disconnect(id)]
    );

    Ok(())
}

#[test]
fn test_reserved_opcode_discarded() -> Result<()> {
    let mut server = Server::new(Options::default(), Handler::default());
    let (id, _transport) = upgrade(&mut server)?;

    let mut wire = client_frame(OpCode::Reserved(0x3), true, &[0xAA; 200]);
    wire.extend(client_frame(OpCode::Continuation, true, b"stray"));
    wire.extend(client_frame(OpCode::Text, true, b"?"));

    server.on_receive(id, Some(Bytes::from(wire)))?;
    assert_eq!(read_all(&server, id), b"?");

    Ok(())
}

#[test]
fn test_slot_exhaustion_and_recovery() -> Result<()> {
    let mut server = Server::new(
        Options {
            max_sessions: 2,
            ..Default::default()
        },
        Handler::default(),
    );

    let (first, first_transport) = upgrade(&mut server)?;
    let (second, _) = upgrade(&mut server)?;
    assert_ne!(first.slot, second.slot);

    let refused = MockTransport::new();
    assert!(matches!(server.accept(refused.clone()), Err(Error::Busy)));
    assert!(refused.is_aborted());

    server.on_receive(first, None)?;
    assert_eq!(server.state(first), State::Free);
    assert!(first_transport.is_closed());

    let (third, _) = upgrade(&mut server)?;
    assert_eq!(third.slot, first.slot);
    assert_ne!(third, first);

    // After a link loss the oldest session makes room, once.
    server.notify_link_status(false);

    let (fourth, _) = upgrade(&mut server)?;
    assert_eq!(server.state(second), State::Free);
    assert_eq!(fourth.slot, second.slot);

    assert!(matches!(
        server.accept(MockTransport::new()),
        Err(Error::Busy)
    ));

    server.stop();
    assert_eq!(server.state(third), State::Free);
    assert_eq!(server.state(fourth), State::Free);

    Ok(())
}

#[test]
fn test_outbound_drain() -> Result<()> {
    let mut server = Server::new(
        Options {
            tx_buffer_size: 4096,
            ..Default::default()
        },
        Handler::default(),
    );

    let (id, transport) = upgrade(&mut server)?;
    let stream = server.stream(id).unwrap();

    let text = (0..3000).map(|i| b'a' + (i % 26) as u8).collect::<Vec<_>>();
    assert_eq!(stream.write_bytes(&text), text.len());

    let mut output = Vec::new();
    let mut sizes = Vec::new();
    for _ in 0..3 {
        server.poll(server.now());

        for (token, payload) in server_frames(&transport.take_sent()) {
            assert_eq!(token, 0x81);
            sizes.push(payload.len());
            output.extend(payload);
        }
    }

    assert_eq!(sizes, vec![1460, 1460, 80]);
    assert_eq!(output, text);
    assert_eq!(stream.tx_count(), 0);

    // A small window caps the frame at the window minus its header.
    transport.set_capacity(104);
    stream.write_bytes(&text[..500]);
    server.poll(server.now());

    let frames = server_frames(&transport.take_sent());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].1.len(), 100);

    // Nothing is sent through a window of 4 bytes or less.
    transport.set_capacity(4);
    server.poll(server.now());
    assert!(transport.take_sent().is_empty());
    assert_eq!(stream.tx_count(), 400);

    Ok(())
}

#[test]
fn test_refused_write_halves_batch() -> Result<()> {
    let mut server = Server::new(Options::default(), Handler::default());
    let (id, transport) = upgrade(&mut server)?;
    let stream = server.stream(id).unwrap();

    stream.write_bytes(&[b'x'; 1000]);
    transport.set_max_send(Some(300));

    // 1000 -> 500 -> 250 fits.
    server.poll(server.now());
    server.poll(server.now());
    assert!(transport.take_sent().is_empty());
    assert_eq!(stream.tx_count(), 1000);

    server.poll(server.now());
    let frames = server_frames(&transport.take_sent());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].1.len(), 250);
    assert_eq!(stream.tx_count(), 750);

    transport.set_max_send(None);
    let mut total = 250;
    for _ in 0..4 {
        server.poll(server.now());
        total += server_frames(&transport.take_sent())
            .iter()
            .map(|(_, payload)| payload.len())
            .sum::<usize>();
    }

    assert_eq!(total, 1000);
    assert_eq!(stream.tx_count(), 0);

    Ok(())
}

#[test]
fn test_send_and_broadcast_frame() -> Result<()> {
    let mut server = Server::new(Options::default(), Handler::default());
    let (first, first_transport) = upgrade(&mut server)?;
    let (second, second_transport) = upgrade(&mut server)?;

    server.send_frame(first, b"{}", false)?;
    assert_eq!(first_transport.take_sent(), [0x81, 0x02, b'{', b'}']);

    assert_eq!(server.broadcast_frame(&[1, 2, 3], true), 2);
    assert_eq!(first_transport.take_sent(), [0x82, 0x03, 1, 2, 3]);
    assert_eq!(second_transport.take_sent(), [0x82, 0x03, 1, 2, 3]);

    second_transport.set_capacity(0);
    assert!(matches!(
        server.send_frame(second, b"x", false),
        Err(Error::Transport(TransportError::WouldBlock))
    ));
    assert_eq!(server.state(second), State::Connected);

    let pending = server.accept(MockTransport::new())?;
    assert!(matches!(
        server.send_frame(pending, b"x", false),
        Err(Error::NotConnected)
    ));

    Ok(())
}

#[test]
fn test_registered_handler_after_connect() -> Result<()> {
    let mut server = Server::new(Options::default(), Handler::default());
    let (id, _) = upgrade(&mut server)?;

    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = messages.clone();
    server.register_frame_handler(
        id,
        FrameKind::Binary,
        Box::new(move |_, message| sink.lock().push(message.to_vec())),
    )?;

    server.on_receive(
        id,
        Some(Bytes::from(client_frame(OpCode::Binary, true, &[0u8; 300]))),
    )?;

    assert_eq!(*messages.lock(), vec![vec![0u8; 300]]);
    assert!(read_all(&server, id).is_empty());

    Ok(())
}

#[test]
fn test_realtime_bytes_bypass_buffer() -> Result<()> {
    let mut server = Server::new(Options::default(), Handler::default());
    let (id, _) = upgrade(&mut server)?;
    let stream = server.stream(id).unwrap();

    let claimed = Arc::new(Mutex::new(Vec::new()));
    let sink = claimed.clone();
    stream.set_realtime_handler(Some(Box::new(move |byte| {
        if byte == b'?' || byte == b'!' {
            sink.lock().push(byte);
            true
        } else {
            false
        }
    })));

    server.on_receive(
        id,
        Some(Bytes::from(client_frame(OpCode::Text, true, b"G1?X10!\n"))),
    )?;

    assert_eq!(read_all(&server, id), b"G1X10\n");
    assert_eq!(*claimed.lock(), b"?!");

    Ok(())
}

#[test]
fn test_idle_timeout_and_detach() -> Result<()> {
    let handler = Handler::default();
    let mut server = Server::new(
        Options {
            max_idle_ticks: 2,
            ..Default::default()
        },
        handler.clone(),
    );

    let (id, transport) = upgrade(&mut server)?;
    let stream = server.stream(id).unwrap();

    server.poll(server.now());
    server.on_sent(id);
    server.poll(server.now());
    server.poll(server.now());
    assert_eq!(server.state(id), State::Connected);

    server.close_connections();
    assert!(!stream.is_connected());
    assert_eq!(stream.write_str("ok"), 0);

    server.poll(server.now());
    assert_eq!(server.state(id), State::Free);
    assert!(transport.is_aborted());
    assert_eq!(
        handler.events(),
        vec![Event::Connect(id), Event::Disconnect(id)]
    );

    Ok(())
}

#[test]
fn test_stream_buffers() {
    let mut server = Server::<MockTransport, _>::new(Options::default(), Handler::default());
    let transport = MockTransport::new();
    let id = server.accept(transport).unwrap();
    server
        .on_receive(id, Some(Bytes::from_static(REQUEST)))
        .unwrap();

    let stream = server.stream(id).unwrap();
    server
        .on_receive(id, Some(Bytes::from(client_frame(OpCode::Text, true, b"G0 X1\n"))))
        .unwrap();

    assert_eq!(stream.rx_count(), 6);
    assert_eq!(stream.rx_free(), 1023 - 6);

    stream.suspend_input(true);
    assert_eq!(stream.read_byte(), None);
    stream.suspend_input(false);
    assert_eq!(stream.read_byte(), Some(b'G'));

    stream.cancel_read_buffer();
    assert_eq!(stream.read_byte(), Some(0x18));
    assert_eq!(stream.read_byte(), None);

    server
        .on_receive(id, Some(Bytes::from(client_frame(OpCode::Text, true, b"$I\n"))))
        .unwrap();
    stream.reset_read_buffer();
    assert_eq!(stream.rx_count(), 0);

    assert!(stream.write_char('ö'));
    assert_eq!(stream.tx_count(), 2);
}

#[test]
fn test_poll_clock() {
    let mut server = Server::<MockTransport, _>::new(Options::default(), Handler::default());
    let now = Instant::now() + Duration::from_secs(1);

    server.poll(now);
    assert_eq!(server.now(), now);
    assert_eq!(server.connected().count(), 0);
}

#[test]
fn test_callback_random_chunk_boundaries() -> Result<()> {
    let mut rng = rand::rng();

    for _ in 0..16 {
        let handler = Handler {
            text_handler: true,
            ..Default::default()
        };

        let mut server = Server::new(Options::default(), handler.clone());
        let (id, transport) = upgrade(&mut server)?;

        let mut wire = Vec::new();
        let mut expected = vec![Event::Connect(id)];

        for _ in 0..20 {
            let len = rng.random_range(0..300);
            let payload = (0..len).map(|_| rng.random::<u8>()).collect::<Vec<_>>();

            // Up to four fragments, with pings between them.
            let mut cuts = (0..rng.random_range(0..4))
                .map(|_| rng.random_range(0..=len))
                .collect::<Vec<_>>();
            cuts.push(len);
            cuts.sort_unstable();

            let mut start = 0;
            for (i, cut) in cuts.iter().enumerate() {
                let opcode = if i == 0 {
                    OpCode::Text
                } else {
                    OpCode::Continuation
                };

                let fin = i == cuts.len() - 1;
                wire.extend(client_frame(opcode, fin, &payload[start..*cut]));
                start = *cut;

                if !fin && rng.random_bool(0.3) {
                    wire.extend(client_frame(OpCode::Ping, true, b"p"));
                }
            }

            expected.push(Event::Message(id, payload));
        }

        let mut input = &wire[..];
        while !input.is_empty() {
            let size = rng.random_range(1..=input.len().min(64));
            let (chunk, rest) = input.split_at(size);
            input = rest;

            server.on_receive(id, Some(Bytes::copy_from_slice(chunk)))?;
        }

        assert_eq!(handler.events(), expected);
        assert!(read_all(&server, id).is_empty());
        assert_eq!(transport.acked(), REQUEST.len() + wire.len());
    }

    Ok(())
}

#[test]
fn test_fragmented_message_size_limit() -> Result<()> {
    let handler = Handler {
        text_handler: true,
        ..Default::default()
    };

    let mut server = Server::new(
        Options {
            max_message_size: 1000,
            ..Default::default()
        },
        handler.clone(),
    );

    let (id, transport) = upgrade(&mut server)?;

    // Exactly at the limit is delivered.
    let mut wire = client_frame(OpCode::Text, false, &[b'a'; 600]);
    wire.extend(client_frame(OpCode::Continuation, true, &[b'b'; 400]));
    server.on_receive(id, Some(Bytes::from(wire)))?;

    let mut message = vec![b'a'; 600];
    message.extend_from_slice(&[b'b'; 400]);
    assert_eq!(
        handler.events(),
        vec![Event::Connect(id), Event::Message(id, message)]
    );

    // A new message starts from zero, and one byte over faults the session.
    server.on_receive(
        id,
        Some(Bytes::from(client_frame(OpCode::Text, false, &[b'c'; 1000]))),
    )?;
    assert_eq!(server.state(id), State::Connected);

    let result = server.on_receive(
        id,
        Some(Bytes::from(client_frame(OpCode::Continuation, false, b"d"))),
    );

    assert!(matches!(result, Err(Error::MessageTooLarge(1001))));
    assert_eq!(server.state(id), State::Free);
    assert!(transport.is_aborted());
    assert_eq!(handler.events().len(), 3);
    assert_eq!(handler.events()[2], Event::Disconnect(id));

    Ok(())
}

#[test]
fn test_frame_size_clamped_to_payload_limit() -> Result<()> {
    let mut server = Server::new(
        Options {
            max_frame_size: 100_000,
            tx_buffer_size: 1 << 17,
            ..Default::default()
        },
        Handler::default(),
    );

    assert_eq!(server.options().max_frame_size, 65535);

    let (id, transport) = upgrade(&mut server)?;
    transport.set_capacity(1 << 20);

    let stream = server.stream(id).unwrap();
    assert_eq!(stream.write_bytes(&[b'x'; 70000]), 70000);

    let mut sizes = Vec::new();
    for _ in 0..2 {
        server.poll(server.now());
        sizes.extend(
            server_frames(&transport.take_sent())
                .into_iter()
                .map(|(_, payload)| payload.len()),
        );
    }

    assert_eq!(sizes, vec![65535, 4465]);
    assert_eq!(server.state(id), State::Connected);

    Ok(())
}

#[test]
fn test_realtime_byte_offered_again_after_stall() -> Result<()> {
    let mut server = Server::new(
        Options {
            rx_buffer_size: 4,
            ..Default::default()
        },
        Handler::default(),
    );

    let (id, _) = upgrade(&mut server)?;
    let stream = server.stream(id).unwrap();

    let offered = Arc::new(Mutex::new(Vec::new()));
    let sink = offered.clone();
    stream.set_realtime_handler(Some(Box::new(move |byte| {
        sink.lock().push(byte);
        byte == b'!'
    })));

    server.on_receive(
        id,
        Some(Bytes::from(client_frame(OpCode::Text, true, b"abcd!"))),
    )?;

    // Three bytes fit, `d` stalls after being passed on.
    assert_eq!(*offered.lock(), b"abcd");
    assert_eq!(stream.read_byte(), Some(b'a'));

    server.poll(server.now());

    assert_eq!(*offered.lock(), b"abcdd!");
    assert_eq!(read_all(&server, id), b"bcd");

    Ok(())
}
