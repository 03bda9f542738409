//! Slow-start behavior end to end: over a lossless path the allowed rate
//! keeps doubling per RTT and the sender never leaves the slow-start phase.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dccp::ccid3::Phase;
use dccp::runtime::{go, SyntheticRuntime};
use dccp::sandbox;
use dccp::transport::HeaderTransport;
use dccp::{Ccid3Config, Conn, ConnConfig};

const MS: i64 = 1_000_000;
const PAYLOADS: usize = 200;

#[test_log::test]
fn slow_start_doubles_until_the_data_runs_out() {
    let samples = Arc::new(Mutex::new(Vec::<(Phase, f64, i64)>::new()));
    let samples_in = samples.clone();

    SyntheticRuntime::run(move |rt| {
        let config = ConnConfig {
            timewait: 50 * MS,
            ccid3: Ccid3Config {
                ccmps: 1000,
                ..Default::default()
            },
            ..Default::default()
        };
        // 50ms each way: a 100ms round trip, no loss, no rate cap.
        let (client_end, server_end) = sandbox::pipe(&rt);
        client_end.set_latency(50 * MS);
        server_end.set_latency(50 * MS);
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

        go(&rt, "test-client", {
            let client = client.clone();
            move || {
                for _ in 0..PAYLOADS {
                    if client.write(Bytes::from(vec![0u8; 1000])).is_err() {
                        break;
                    }
                }
                client.close();
            }
        });
        go(&rt, "test-server", {
            let server = server.clone();
            move || while server.read().is_ok() {}
        });
        // Sample the sender once per nominal RTT while the transfer runs.
        go(&rt, "test-monitor", {
            let rt = rt.clone();
            let client = client.clone();
            let samples = samples_in.clone();
            move || {
                for _ in 0..12 {
                    rt.sleep(100 * MS);
                    let stats = client.sender_stats();
                    samples
                        .lock()
                        .unwrap()
                        .push((stats.phase, stats.allowed_rate_bps, stats.rtt));
                }
                client.join();
                server.join();
            }
        });
    });

    let samples = samples.lock().unwrap();

    // The sender must never have left slow start: the path is lossless.
    for (phase, _, _) in samples.iter() {
        assert_ne!(*phase, Phase::Equation, "equation phase without loss");
    }

    // Once the first RTT sample exists it stays close to the configured
    // 100ms round trip.
    let measured: Vec<i64> = samples
        .iter()
        .filter(|(_, _, rtt)| *rtt > 0)
        .map(|(_, _, rtt)| *rtt)
        .collect();
    assert!(!measured.is_empty(), "no rtt sample was ever taken");
    for rtt in &measured {
        assert!(
            (90 * MS..140 * MS).contains(rtt),
            "rtt {} outside the expected band",
            rtt / MS
        );
    }

    // Rates never shrink while data lasts, and grow by well over 8x from
    // the initial window before the transfer drains.
    let rates: Vec<f64> = samples
        .iter()
        .filter(|(phase, rate, _)| *phase == Phase::SlowStart && *rate > 0.0)
        .map(|(_, rate, _)| *rate)
        .collect();
    let peak = rates.iter().cloned().fold(0.0f64, f64::max);
    // W_init/RTT = 4000 bytes / 100ms = 40 kB/s.
    assert!(
        peak >= 8.0 * 40_000.0,
        "rate never ramped: peak {peak} B/s, samples {samples:?}"
    );
    assert!(
        rates.windows(2).filter(|w| w[1] >= 2.0 * w[0]).count() >= 2,
        "no doubling steps observed: {rates:?}"
    );
}
