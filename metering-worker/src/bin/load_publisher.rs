use anyhow::{bail, Context, Result};
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    BasicProperties,
};
use metering_worker::{
    broker,
    config::AppConfig,
    observability,
    pipeline::{IngestMessage, IngestPayload, RawReading},
};
use std::env;
use time::{macros::format_description, Duration, OffsetDateTime};

const METRICS: &[(&str, f64)] = &[
    ("active_power_kw", 4.2),
    ("voltage_v", 230.0),
    ("current_a", 18.5),
    ("energy_kwh", 1250.0),
];

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() > 4 {
        bail!("usage: load_publisher [messages] [readings_per_message] [clients]");
    }
    let messages = parse_arg(&args, 1, 100)?;
    let per_message = parse_arg(&args, 2, 4)?;
    let clients = parse_arg(&args, 3, 10)?.max(1);

    let cfg = AppConfig::load_rabbitmq()?;
    let connection = broker::connect(&cfg.url)
        .await
        .with_context(|| format!("failed to connect to {}", broker::redact_url(&cfg.url)))?;
    let channel = connection.create_channel().await?;
    channel.confirm_select(ConfirmSelectOptions::default()).await?;

    let fingerprints: Vec<String> = (0..clients)
        .map(|i| blake3::hash(format!("load-client-{i}").as_bytes()).to_hex().to_string())
        .collect();

    let mut nacked = 0usize;
    for seq in 0..messages {
        let msg = synthetic_message(seq, per_message, &fingerprints[seq % clients]);
        let body = serde_json::to_vec(&msg)?;

        let confirm = channel
            .basic_publish(
                &cfg.ingest_exchange,
                &cfg.ingest_routing_key,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await?
            .await?;
        if confirm.is_nack() {
            nacked += 1;
        }

        if (seq + 1) % 1000 == 0 {
            tracing::info!(published = seq + 1, "progress");
        }
    }

    tracing::info!(
        messages,
        readings_per_message = per_message,
        clients,
        nacked,
        exchange = %cfg.ingest_exchange,
        routing_key = %cfg.ingest_routing_key,
        "load publish complete"
    );

    channel.close(200, "load publish complete").await?;
    connection.close(200, "load publish complete").await?;
    Ok(())
}

fn parse_arg(args: &[String], idx: usize, default: usize) -> Result<usize> {
    match args.get(idx) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("argument {idx} must be a non-negative integer, got '{raw}'")),
        None => Ok(default),
    }
}

/// Builds one request. Every 7th reading is bracket-wrapped, every 5th uses
/// the transposed date layout and every 50th message carries a spike.
fn synthetic_message(seq: usize, per_message: usize, fingerprint: &str) -> IngestMessage {
    let received_at = OffsetDateTime::now_utc();
    let reading_at = received_at - Duration::seconds(30);

    let pm = (0..per_message)
        .map(|i| {
            let (name, base) = METRICS[i % METRICS.len()];
            let jitter = ((seq * 31 + i * 17) % 100) as f64 / 100.0;
            let mut value = base * (0.9 + 0.2 * jitter);
            if seq % 50 == 49 && i == 0 {
                value *= 10.0;
            }

            let data = if (seq + i) % 7 == 0 {
                format!("[{value:.3}]")
            } else {
                format!("{value:.3}")
            };

            RawReading {
                date: format_reading_date(reading_at, (seq + i) % 5 == 0),
                data,
                name: name.to_string(),
            }
        })
        .collect();

    IngestMessage {
        request_id: format!("load-{seq}"),
        client_fingerprint: fingerprint.to_string(),
        ip_address: format!("10.0.{}.{}", (seq / 250) % 250, seq % 250 + 1),
        user_agent: "load-publisher/1.0".to_string(),
        received_at,
        payload: IngestPayload { pm },
    }
}

fn format_reading_date(at: OffsetDateTime, transposed: bool) -> String {
    let formatted = if transposed {
        at.format(format_description!("[day] [hour]:[minute]:[second]/[month]/[year]"))
    } else {
        at.format(format_description!("[day]/[month]/[year] [hour]:[minute]:[second]"))
    };
    // Both layouts only use numeric components, which always format.
    formatted.unwrap_or_default()
}
