//! Orderly bilateral close: every byte written before `close` reaches the
//! peer, both sides terminate, and the harness records the completion event.

use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dccp::runtime::{go, SyntheticRuntime, NANOS_PER_SEC};
use dccp::sandbox;
use dccp::{Ccid3Config, ConnConfig, SocketState};

const PAYLOADS: usize = 50;

/// Captures formatted log output so the test can assert on emitted events.
#[derive(Clone, Default)]
struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[test]
fn orderly_close_delivers_all_bytes_and_logs_completion() {
    let capture = LogCapture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(capture.clone())
        .finish();
    // Connection tasks run on their own threads, so the subscriber must be
    // process-global; this test has its own binary.
    tracing::subscriber::set_global_default(subscriber).expect("subscriber already set");

    let received = Arc::new(Mutex::new(Vec::<Bytes>::new()));
    let end_states = Arc::new(Mutex::new(None));
    let received_in = received.clone();
    let end_states_in = end_states.clone();

    let rt = SyntheticRuntime::run(move |rt| {
        let config = ConnConfig {
            timewait: 50_000_000,
            ccid3: Ccid3Config {
                ccmps: 1000,
                ..Default::default()
            },
            ..Default::default()
        };
        let pair = sandbox::client_server_pipe(&rt, config);
        let client = pair.client;
        let server = pair.server;

        go(&rt, "test-client", {
            let client = client.clone();
            move || {
                for i in 0..PAYLOADS {
                    let body = Bytes::from(vec![i as u8; 32]);
                    client.write(body).expect("write before close failed");
                }
                client.close();
            }
        });
        go(&rt, "test-server", {
            let server = server.clone();
            let received = received_in.clone();
            move || {
                while let Ok(chunk) = server.read() {
                    received.lock().unwrap().push(chunk);
                }
            }
        });
        go(&rt, "test-reducer", {
            let end_states = end_states_in.clone();
            move || {
                sandbox::wait_both_done(&client, &server);
                *end_states.lock().unwrap() = Some((client.state(), server.state()));
            }
        });
    });

    // The pipe is loss-free, so the server saw exactly the written bytes in
    // order.
    let received = received.lock().unwrap();
    assert_eq!(received.len(), PAYLOADS);
    for (i, chunk) in received.iter().enumerate() {
        assert_eq!(chunk.as_ref(), vec![i as u8; 32].as_slice(), "payload {i}");
    }

    let (client_state, server_state) = end_states.lock().unwrap().take().unwrap();
    assert_eq!(client_state, SocketState::Closed);
    assert_eq!(server_state, SocketState::Closed);

    // Both sides terminated and the simulation wound down cleanly, well
    // under any wall-clock-scale duration.
    assert_eq!(rt.residual_sleepers(), 0);
    assert!(rt.final_time() < 60 * NANOS_PER_SEC);

    let log = String::from_utf8_lossy(&capture.0.lock().unwrap()).to_string();
    assert!(
        log.contains("Server and client done."),
        "completion event missing from log"
    );
}
