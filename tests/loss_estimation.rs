//! End-to-end loss estimation: a sender pinned above the path's transmit
//! rate must see the receiver's loss-event-rate estimate converge to the
//! actual drop fraction.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dccp::ccid3::Phase;
use dccp::runtime::{go, SyntheticRuntime, NANOS_PER_SEC};
use dccp::sandbox;
use dccp::transport::HeaderTransport;
use dccp::{Ccid3Config, Conn, ConnConfig};

/// Fixed sender rate in packets per second.
const SEND_RATE_PPS: u32 = 40;
/// Transmit rate of the client→server path.
const TRANSMIT_RATE_PPS: u32 = 20;
/// Virtual duration of the experiment.
const RUN_FOR: i64 = 10 * NANOS_PER_SEC;

#[test_log::test]
fn loss_estimate_matches_path_loss() {
    let sender_outcome = Arc::new(Mutex::new(None));
    let receiver_outcome = Arc::new(Mutex::new(None));
    let sender_outcome_in = sender_outcome.clone();
    let receiver_outcome_in = receiver_outcome.clone();

    let rt = SyntheticRuntime::run(move |rt| {
        let config = ConnConfig {
            timewait: 100_000_000,
            ccid3: Ccid3Config {
                ccmps: 1000,
                // Hold the send rate above the path rate so every other
                // packet is dropped.
                fixed_rate_pps: Some(SEND_RATE_PPS),
                ..Default::default()
            },
            ..Default::default()
        };
        let (client_end, server_end) = sandbox::pipe(&rt);
        client_end.set_write_rate(NANOS_PER_SEC, TRANSMIT_RATE_PPS);
        let client = Conn::client(
            rt.clone(),
            client_end.clone() as Arc<dyn HeaderTransport>,
            config.clone(),
        );
        let server = Conn::server(
            rt.clone(),
            server_end.clone() as Arc<dyn HeaderTransport>,
            config,
        );

        let payload = Bytes::from_static(&[1, 2, 3]);
        go(&rt, "test-client", {
            let rt = rt.clone();
            let client = client.clone();
            let sender_outcome = sender_outcome_in.clone();
            move || {
                let t0 = rt.now();
                while rt.now() - t0 < RUN_FOR {
                    if client.write(payload.clone()).is_err() {
                        break;
                    }
                }
                // Snapshot before close flips the sender to CLOSED.
                *sender_outcome.lock().unwrap() = Some(client.sender_stats());
                client.close();
            }
        });
        go(&rt, "test-server", {
            let server = server.clone();
            move || while server.read().is_ok() {}
        });
        go(&rt, "test-reducer", {
            let receiver_outcome = receiver_outcome_in.clone();
            move || {
                sandbox::wait_both_done(&client, &server);
                *receiver_outcome.lock().unwrap() = Some(server.receiver_stats());
            }
        });
    });

    let sender = sender_outcome
        .lock()
        .unwrap()
        .take()
        .expect("client never finished its send window");
    let receiver = receiver_outcome
        .lock()
        .unwrap()
        .take()
        .expect("simulation did not run to completion");

    // Half the offered packets fit through the pipe, so the loss event rate
    // settles at 0.5; the estimate must land within a 10% window.
    let p_receiver = receiver.loss_event_rate;
    assert!(
        (p_receiver - 0.5).abs() <= 0.05,
        "receiver loss estimate {p_receiver}, expected ≈ 0.5 (observed {} lost / {} data)",
        receiver.total_lost,
        receiver.total_data,
    );

    // The same estimate made it back to the sender through feedback options
    // and pushed it into the equation phase.
    assert_eq!(sender.phase, Phase::Equation);
    assert!(
        (sender.loss_event_rate - 0.5).abs() <= 0.05,
        "sender-side reported loss rate {}",
        sender.loss_event_rate
    );

    // Quiescent termination: no sleeper left behind.
    assert_eq!(rt.residual_sleepers(), 0);
    assert!(rt.final_time() >= RUN_FOR);
}
