//! Send pipeline behaviour: handles, ordering, fragmentation, cancellation.

use bytes::BytesMut;
use scheelite::{
    frame::{mask::FixedMasker, Parser},
    CloseInfo, Connection, Endpoint, Error, MessageKind, Policy, Role, SendOptions,
};
use std::io::{self, Read, Write};

/// Write-side mock whose writes can be held back to keep sends queued.
#[derive(Debug, Default)]
struct Faucet {
    closed_tap: bool,
    output: Vec<u8>,
}

impl Read for Faucet {
    fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::WouldBlock, "nothing to read"))
    }
}

impl Write for Faucet {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed_tap {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "tap closed"));
        }
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.closed_tap {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "tap closed"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Sink {
    closes: Vec<CloseInfo>,
}

impl Endpoint for Sink {
    fn on_close(&mut self, close: &CloseInfo) {
        self.closes.push(close.clone());
    }
}

fn server(blocked: bool) -> Connection<Faucet, Sink> {
    Connection::new(
        Faucet { closed_tap: blocked, output: Vec::new() },
        Role::Server,
        Policy::default(),
        Sink::default(),
    )
}

/// Decode all frames out of a wire capture.
fn decode(wire: &[u8], role: Role) -> Vec<scheelite::Frame> {
    let mut parser = Parser::new(role, None);
    let mut buf = BytesMut::from(wire);
    let mut frames = Vec::new();
    while let Some(frame) = parser.parse(&mut buf).unwrap() {
        frames.push(frame);
    }
    assert!(buf.is_empty(), "trailing garbage on the wire");
    frames
}

#[test]
fn handle_resolves_after_flush() {
    let mut connection = server(false);
    let handle = connection.send_text("Hello").unwrap();
    connection.service();

    assert!(handle.is_done());
    assert!(handle.await_completion().is_ok());
    assert!(!handle.is_cancelled());
    assert_eq!(connection.get_ref().output, [0x81, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f]);
}

#[test]
fn fragmented_message_shares_one_handle() {
    let mut connection = server(false);
    let handle = connection
        .send_message(
            MessageKind::Text,
            "Hello".into(),
            SendOptions { fragment_threshold: Some(2) },
        )
        .unwrap();
    connection.service();

    assert!(handle.await_completion().is_ok());
    assert_eq!(
        connection.get_ref().output,
        [
            0x01, 0x02, 0x48, 0x65, // TEXT "He", FIN=0
            0x00, 0x02, 0x6c, 0x6c, // CONTINUATION "ll", FIN=0
            0x80, 0x01, 0x6f, // CONTINUATION "o", FIN=1
        ]
    );
}

#[test]
fn control_frames_overtake_queued_data() {
    let mut connection = server(true);
    let first = connection.send_text("first").unwrap();
    let second = connection.send_text("second").unwrap();
    let ping = connection.send_ping(&b"hb"[..]).unwrap();

    connection.get_mut().closed_tap = false;
    connection.service();

    // "first" was staged before the ping existed; the ping passes "second".
    let frames = decode(&connection.get_ref().output, Role::Client);
    assert_eq!(&frames[0].payload()[..], b"first");
    assert_eq!(&frames[1].payload()[..], b"hb");
    assert_eq!(&frames[2].payload()[..], b"second");
    assert!(first.await_completion().is_ok());
    assert!(second.await_completion().is_ok());
    assert!(ping.await_completion().is_ok());
}

#[test]
fn cancel_works_only_before_staging() {
    let mut connection = server(true);
    let staged = connection.send_text("staged").unwrap();
    let queued = connection.send_text("queued").unwrap();

    assert!(!staged.cancel(), "first send already started writing");
    assert!(queued.cancel());
    assert!(queued.is_cancelled());
    assert!(matches!(queued.await_completion().cause(), Some(Error::Cancelled)));

    connection.get_mut().closed_tap = false;
    connection.service();

    let frames = decode(&connection.get_ref().output, Role::Client);
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0].payload()[..], b"staged");
    assert!(staged.await_completion().is_ok());
}

#[test]
fn client_output_is_masked_and_decodes() {
    let mut connection = Connection::with_masker(
        Faucet::default(),
        Role::Client,
        Policy::default(),
        Sink::default(),
        Box::new(FixedMasker([1, 2, 3, 4])),
    );
    connection.send_text("Hello").unwrap();
    connection.service();

    let wire = &connection.get_ref().output;
    assert_eq!(wire[1] & 0x80, 0x80, "mask bit set");
    // A server-side parser accepts and unmasks it.
    let frames = decode(wire, Role::Server);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].header().mask, Some([1, 2, 3, 4]));
    assert_eq!(&frames[0].payload()[..], b"Hello");
}

#[test]
fn queue_bound_fails_sends_instead_of_buffering() {
    let mut connection = Connection::new(
        Faucet { closed_tap: true, output: Vec::new() },
        Role::Server,
        Policy::default().max_outbound_queue_bytes(Some(8)),
        Sink::default(),
    );
    connection.send_text("Hello").unwrap();
    assert!(matches!(
        connection.send_text("World"),
        Err(Error::Capacity(_))
    ));
}

#[test]
fn pending_sends_fail_on_transport_loss() {
    let mut connection = server(true);
    let handle = connection.send_text("doomed").unwrap();
    drop(connection);

    let outcome = handle.await_completion();
    assert!(!outcome.is_ok());
    assert!(matches!(outcome.cause(), Some(Error::ConnectionClosed)));
}

#[test]
fn await_completion_with_deadline() {
    use std::time::Duration;

    let mut connection = server(true);
    let handle = connection.send_text("stuck").unwrap();
    assert!(matches!(
        handle.await_completion_for(Duration::from_millis(5)),
        Err(Error::Timeout)
    ));

    connection.get_mut().closed_tap = false;
    connection.service();
    assert!(handle.await_completion_for(Duration::from_millis(5)).unwrap().is_ok());
}

#[test]
fn empty_message_is_a_single_frame() {
    let mut connection = server(false);
    connection.send_binary(Vec::new()).unwrap();
    connection.service();
    assert_eq!(connection.get_ref().output, [0x82, 0x00]);
}

#[test]
fn large_send_round_trips_through_a_parser() {
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let mut connection = server(false);
    let handle = connection
        .send_message(
            MessageKind::Binary,
            payload.clone().into(),
            SendOptions { fragment_threshold: Some(4096) },
        )
        .unwrap();
    connection.service();
    assert!(handle.await_completion().is_ok());

    let frames = decode(&connection.get_ref().output, Role::Client);
    assert_eq!(frames.len(), 25);
    assert!(frames.last().unwrap().header().is_final);
    let mut reassembled = Vec::new();
    for frame in frames {
        reassembled.extend_from_slice(frame.payload());
    }
    assert_eq!(reassembled, payload);

    let sink: &Sink = connection.endpoint();
    assert!(sink.closes.is_empty());
}
