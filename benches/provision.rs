use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{Days, Local};
use tokio_postgres::{Config, NoTls};

const SLOTS_PER_DAY: usize = 24;

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config.host(host).port(port).dbname("slotcap").user("slotcap");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn day(offset: u64) -> String {
    Local::now()
        .date_naive()
        .checked_add_days(Days::new(offset))
        .unwrap()
        .to_string()
}

/// Hourly defaults under a per-run prefix so reruns against one server don't
/// collide with earlier slots.
async fn setup(client: &tokio_postgres::Client) -> Vec<String> {
    let run = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    let slots: Vec<String> = (0..SLOTS_PER_DAY).map(|h| format!("r{run}-{h:02}:00")).collect();

    let values: Vec<String> = slots.iter().map(|s| format!("('{s}', 10)")).collect();
    client
        .batch_execute(&format!(
            "INSERT INTO default_limits (time_slot, limit_count) VALUES {}",
            values.join(", ")
        ))
        .await
        .unwrap();

    println!("  created {} default slots", slots.len());
    slots
}

async fn phase1_provision(host: &str, port: u16) {
    let client = connect(host, port).await;

    let mut latencies = Vec::new();
    for horizon in ["twoMonths", "twoMonths", "twoWeeks", "oneWeek"] {
        let t = Instant::now();
        client
            .simple_query(&format!("CALL provision('{horizon}')"))
            .await
            .unwrap();
        let elapsed = t.elapsed();
        println!("  provision({horizon}) in {:.2}ms", elapsed.as_secs_f64() * 1000.0);
        latencies.push(elapsed);
    }
    print_latency("provision latency", &mut latencies);
}

async fn phase2_concurrent_updates(host: &str, port: u16, slots: &[String]) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();
    for task in 0..n_tasks {
        let host = host.to_string();
        let slots = slots.to_vec();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut latencies = Vec::with_capacity(n_per_task);
            let mut missing = 0usize;
            for i in 0..n_per_task {
                let date = day(((task * n_per_task + i) % 14) as u64);
                let slot = &slots[i % slots.len()];
                let t = Instant::now();
                // dates seeded by an earlier run lack this run's slots
                let result = client
                    .batch_execute(&format!(
                        r#"UPDATE date_limits SET limit_count = {} WHERE "date" = '{date}' AND time_slot = '{slot}'"#,
                        i % 20
                    ))
                    .await;
                latencies.push(t.elapsed());
                if result.is_err() {
                    missing += 1;
                }
            }
            (latencies, missing)
        }));
    }

    let mut all = Vec::new();
    let mut missing = 0;
    for h in handles {
        let (latencies, m) = h.await.unwrap();
        all.extend(latencies);
        missing += m;
    }
    if missing > 0 {
        println!("  {missing} updates hit dates provisioned before this run");
    }
    let elapsed = start.elapsed();
    let ops = all.len() as f64 / elapsed.as_secs_f64();
    println!(
        "  {} updates over {n_tasks} connections in {:.2}s = {ops:.0} ops/sec",
        all.len(),
        elapsed.as_secs_f64()
    );
    print_latency("update latency", &mut all);
}

async fn phase3_read_under_load(host: &str, port: u16, slots: &[String]) {
    let writer_host = host.to_string();
    let writer_slots = slots.to_vec();
    let writer = tokio::spawn(async move {
        let client = connect(&writer_host, port).await;
        for i in 0..1000 {
            let date = day((i % 14) as u64);
            let slot = &writer_slots[i % writer_slots.len()];
            let _ = client
                .batch_execute(&format!(
                    r#"UPDATE date_limits SET limit_count = 1 WHERE "date" = '{date}' AND time_slot = '{slot}'"#
                ))
                .await;
        }
    });

    let client = connect(host, port).await;
    let month = &day(0)[..7];
    let mut latencies = Vec::with_capacity(200);
    for _ in 0..200 {
        let t = Instant::now();
        client
            .simple_query(&format!("SELECT * FROM date_limits WHERE month = '{month}'"))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    writer.await.unwrap();
    print_latency("month view latency", &mut latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTCAP_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTCAP_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SLOTCAP_PORT");

    println!("=== slotcap provisioning benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[setup]");
    let setup_client = connect(&host, port).await;
    let slots = setup(&setup_client).await;
    drop(setup_client);

    println!("\n[phase 1] provisioning passes");
    phase1_provision(&host, port).await;

    println!("\n[phase 2] concurrent override updates");
    phase2_concurrent_updates(&host, port, &slots).await;

    println!("\n[phase 3] month view latency under write load");
    phase3_read_under_load(&host, port, &slots).await;

    println!("\n=== benchmark complete ===");
}
