use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

const DAY: i64 = 86_400_000;
/// 2030-01-01T00:00:00Z
const BASE: i64 = 1_893_456_000_000;

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(host: &str, port: u16) -> Self {
        let socket = TcpStream::connect((host, port)).await.expect("connect failed");
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
        }
    }

    async fn call(&mut self, request: Value) -> Value {
        self.framed.send(request.to_string()).await.expect("send failed");
        let line = self.framed.next().await.expect("connection closed").expect("read failed");
        serde_json::from_str(&line).expect("bad response")
    }
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// A resource open every day of the week.
async fn open_resource(client: &mut Client, owner: &str) -> String {
    let created = client.call(json!({"op": "create_resource", "owner_id": owner})).await;
    let rid = created["data"]["id"].as_str().expect("create_resource failed").to_string();
    for weekday in ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"] {
        let resp = client
            .call(json!({
                "op": "set_weekly_rule",
                "resource_id": rid,
                "actor_id": owner,
                "rule": {"weekday": weekday, "available": true}
            }))
            .await;
        assert_eq!(resp["ok"], true, "set_weekly_rule: {resp}");
    }
    rid
}

fn reserve(rid: &str, renter: &str, day: i64) -> Value {
    json!({
        "op": "create_reservation",
        "resource_id": rid,
        "renter_id": renter,
        "start": BASE + day * DAY,
        "end": BASE + (day + 1) * DAY,
        "amount_cents": 5_000,
        "customer_ref": format!("cus_{renter}")
    })
}

async fn phase1_sequential(host: &str, port: u16) {
    let mut client = Client::connect(host, port).await;
    let rid = open_resource(&mut client, "bench_owner_seq").await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for day in 0..n as i64 {
        let t = Instant::now();
        let resp = client.call(reserve(&rid, "bench_renter", day)).await;
        latencies.push(t.elapsed());
        assert_eq!(resp["ok"], true, "reservation {day}: {resp}");
    }
    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("reservation latency", &mut latencies);
}

/// Many clients race for the same day. Exactly one may win each round.
async fn phase2_contention(host: &str, port: u16) {
    let n_tasks = 32;
    let rounds = 20;
    let mut setup = Client::connect(host, port).await;
    let rid = open_resource(&mut setup, "bench_owner_race").await;

    let start = Instant::now();
    let mut conflicts = 0;
    for round in 0..rounds {
        let mut handles = Vec::new();
        for i in 0..n_tasks {
            let host = host.to_string();
            let rid = rid.clone();
            handles.push(tokio::spawn(async move {
                let mut client = Client::connect(&host, port).await;
                client.call(reserve(&rid, &format!("racer_{i}"), round)).await
            }));
        }
        let mut winners = 0;
        for h in handles {
            let resp = h.await.expect("task panicked");
            if resp["ok"] == true {
                winners += 1;
            } else {
                assert_eq!(resp["error"]["code"], "conflict", "unexpected failure: {resp}");
                conflicts += 1;
            }
        }
        assert_eq!(winners, 1, "round {round}: {winners} reservations for the same day");
    }

    let rentals = setup.call(json!({"op": "list_rentals", "resource_id": rid})).await;
    let booked = rentals["data"].as_array().map_or(0, |r| r.len());
    assert_eq!(booked, rounds as usize);
    println!(
        "  {rounds} rounds x {n_tasks} racers: {booked} booked, {conflicts} rejected in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let mut setup = Client::connect(host, port).await;
    let rid = open_resource(&mut setup, "bench_owner_read").await;
    for day in (0..200).step_by(2) {
        setup.call(reserve(&rid, "seed_renter", day)).await;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..4i64 {
        let host = host.to_string();
        let rid = rid.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let mut client = Client::connect(&host, port).await;
            let mut day = 1000 + w * 10_000;
            while !stop.load(Ordering::Relaxed) {
                client.call(reserve(&rid, &format!("writer_{w}"), day)).await;
                day += 1;
            }
        }));
    }

    let mut reader_handles = Vec::new();
    for _ in 0..8 {
        let host = host.to_string();
        let rid = rid.clone();
        reader_handles.push(tokio::spawn(async move {
            let mut client = Client::connect(&host, port).await;
            let mut latencies = Vec::with_capacity(250);
            for i in 0..250i64 {
                let t = Instant::now();
                client
                    .call(json!({
                        "op": "check_availability",
                        "resource_id": rid,
                        "start": BASE + (i % 200) * DAY,
                        "end": BASE + (i % 200 + 1) * DAY
                    }))
                    .await;
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.expect("reader panicked"));
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }
    print_latency("availability check", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;
    let start = Instant::now();
    let success = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for c in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(&host, port).await;
            let owner = format!("storm_owner_{c}");
            let rid = open_resource(&mut client, &owner).await;
            for day in 0..ops_per_conn {
                let resp = client.call(reserve(&rid, "storm_renter", day)).await;
                assert_eq!(resp["ok"], true);
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("HOLDFAST_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("HOLDFAST_PORT")
        .unwrap_or_else(|_| "5480".into())
        .parse()
        .expect("invalid HOLDFAST_PORT");

    println!("=== holdfast stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential reservation throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contention on a single day");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== done ===");
}
