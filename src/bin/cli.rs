//! sensorvault CLI
//!
//! Command-line client for a running sensorvault server:
//! - Record readings, singly or from a file
//! - Query raw readings and hourly buckets
//! - Inspect chunks, statistics and health

use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sensorvault-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Client for the sensorvault sensor reading store")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// API server URL
    #[arg(long, default_value = "http://localhost:8082", global = true)]
    pub api_url: String,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table", global = true)]
    pub format: String,
}

/// Equality filters shared by the read commands
#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// Machine id
    #[arg(short, long)]
    pub machine: Option<String>,
    /// Sensor type (temperature, pressure, vibration, ...)
    #[arg(short, long)]
    pub sensor: Option<String>,
    /// Location
    #[arg(short = 'L', long)]
    pub location: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Record a single reading
    Ingest {
        /// Machine id
        machine: String,
        /// Sensor type
        sensor: String,
        /// Measured value
        value: f64,
        /// Timestamp (default: now). Unix milliseconds or RFC 3339
        #[arg(short, long)]
        time: Option<String>,
        #[arg(short = 'L', long)]
        location: Option<String>,
        #[arg(short, long)]
        unit: Option<String>,
        #[arg(short, long, default_value = "100")]
        quality: i64,
        #[arg(long, default_value = "OK")]
        status: String,
    },

    /// Record readings from a JSON array or newline-delimited JSON file
    Load {
        path: PathBuf,
        /// Readings per request
        #[arg(long, default_value = "1000")]
        batch_size: usize,
    },

    /// Query readings over a recent window
    Query {
        /// Window ending now (e.g. 30s, 15m, 6h, 7d, 2w)
        #[arg(long, default_value = "1h")]
        last: String,
        #[command(flatten)]
        filter: FilterArgs,
        /// Return hourly buckets instead of raw readings
        #[arg(long)]
        hourly: bool,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Most recent readings
    Latest {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// Readings with a non-OK status in the last N minutes
    Anomalies {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, default_value = "60")]
        minutes: i64,
    },

    /// List chunks and their lifecycle state
    Chunks,

    /// Show engine statistics
    Stats,

    /// Show server health
    Status,

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Ingest {
            machine,
            sensor,
            value,
            time,
            location,
            unit,
            quality,
            status,
        } => {
            let time = match time.as_deref() {
                None | Some("now") => chrono::Utc::now().timestamp_millis(),
                Some(s) => parse_time(s)?,
            };

            let mut body = json!({
                "time": time,
                "machine_id": machine,
                "sensor_type": sensor,
                "value": value,
                "quality": quality,
                "status": status,
            });
            if let Some(location) = location {
                body["location"] = json!(location);
            }
            if let Some(unit) = unit {
                body["unit"] = json!(unit);
            }

            let response = client
                .post(format!("{}/api/v1/readings", cli.api_url))
                .json(&body)
                .send()
                .await?;

            let ack = expect_success(response).await?;
            println!(
                "Stored {} {}={} at {} in chunk {} ({})",
                machine,
                sensor,
                value,
                format_time(time),
                ack["chunk_id"],
                ack["reading_status"].as_str().unwrap_or("-")
            );
        }

        Commands::Load { path, batch_size } => {
            let text = std::fs::read_to_string(&path)?;
            let readings = parse_readings_file(&text)?;
            if readings.is_empty() {
                println!("No readings in {:?}", path);
                return Ok(());
            }

            let mut accepted = 0;
            let mut rejected = 0;
            for batch in readings.chunks(batch_size.max(1)) {
                let response = client
                    .post(format!("{}/api/v1/readings/batch", cli.api_url))
                    .json(&json!({ "readings": batch }))
                    .send()
                    .await?;

                let body: Value = response.json().await?;
                accepted += body["accepted"].as_u64().unwrap_or(0);
                rejected += body["rejected"].as_u64().unwrap_or(0);

                if let Some(results) = body["results"].as_array() {
                    for result in results.iter().filter(|r| r["status"] == "rejected").take(10) {
                        eprintln!(
                            "  rejected #{}: {}",
                            result["index"],
                            result["error"]["message"].as_str().unwrap_or("-")
                        );
                    }
                }
            }

            println!("Loaded {}: {} accepted, {} rejected", path.display(), accepted, rejected);
        }

        Commands::Query {
            last,
            filter,
            hourly,
            limit,
        } => {
            let mut body = json!({
                "time_range": { "start": format!("now-{}", last.trim()), "end": "now" },
                "aggregate": if hourly { "hourly" } else { "none" },
            });
            apply_filter(&mut body, &filter);
            if let Some(limit) = limit {
                body["limit"] = json!(limit);
            }

            let response = client
                .post(format!("{}/api/v1/query", cli.api_url))
                .json(&body)
                .send()
                .await?;
            let data = expect_success(response).await?;

            if cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&data)?);
            } else {
                let results = data["results"].as_array().cloned().unwrap_or_default();
                if hourly {
                    print_buckets(&results);
                } else {
                    print_readings(&results);
                }
                println!();
                println!(
                    "{} results, {} chunks scanned, {}ms",
                    results.len(),
                    data["chunks_scanned"],
                    data["execution_time_ms"]
                );
            }
        }

        Commands::Latest { filter, limit } => {
            let mut params = filter_params(&filter);
            params.push(("limit", limit.to_string()));

            let response = client
                .get(format!("{}/api/v1/readings/latest", cli.api_url))
                .query(&params)
                .send()
                .await?;
            print_reading_list(&cli.format, expect_success(response).await?)?;
        }

        Commands::Anomalies { filter, minutes } => {
            let mut params = filter_params(&filter);
            params.push(("minutes", minutes.to_string()));

            let response = client
                .get(format!("{}/api/v1/anomalies", cli.api_url))
                .query(&params)
                .send()
                .await?;
            print_reading_list(&cli.format, expect_success(response).await?)?;
        }

        Commands::Chunks => {
            let response = client
                .get(format!("{}/api/v1/chunks", cli.api_url))
                .send()
                .await?;
            let data = expect_success(response).await?;

            if cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&data)?);
            } else {
                let chunks = data["chunks"].as_array().cloned().unwrap_or_default();
                if chunks.is_empty() {
                    println!("No chunks yet.");
                } else {
                    println!("{:<8} {:<22} {:<22} {:<12} {}", "ID", "From", "To", "State", "Rows");
                    println!("{}", "-".repeat(76));
                    for chunk in chunks {
                        println!(
                            "{:<8} {:<22} {:<22} {:<12} {}",
                            chunk["id"],
                            format_time(chunk["time_lower"].as_i64().unwrap_or(0)),
                            format_time(chunk["time_upper"].as_i64().unwrap_or(0)),
                            chunk["state"].as_str().unwrap_or("-"),
                            chunk["row_count"]
                        );
                    }
                }
                if let Some(floor) = data["retention_floor"].as_i64() {
                    println!();
                    println!("Retained from: {}", format_time(floor));
                }
            }
        }

        Commands::Stats => {
            let response = client
                .get(format!("{}/api/v1/stats", cli.api_url))
                .send()
                .await?;
            let stats = expect_success(response).await?;

            if cli.format == "json" {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!(
                    "Chunks:      {} ({} hot, {} compressed)",
                    stats["chunk_count"], stats["hot_chunks"], stats["compressed_chunks"]
                );
                println!(
                    "Rows:        {} ({} uncompressed)",
                    stats["total_rows"], stats["uncompressed_rows"]
                );
                println!(
                    "Size:        {:.2} MB",
                    stats["storage_size_bytes"].as_f64().unwrap_or(0.0) / (1024.0 * 1024.0)
                );
                println!(
                    "Ingest:      {} accepted, {} rejected",
                    stats["accepted"], stats["rejected"]
                );
                if let Some(latest) = stats["latest_reading_time"].as_i64() {
                    println!("Latest:      {}", format_time(latest));
                }
                if let Some(machines) = stats["rows_by_machine"].as_object() {
                    for (machine, rows) in machines {
                        println!("  {:<20} {} rows", machine, rows);
                    }
                }
                println!("Buckets:     {}", stats["bucket_count"]);
                match stats["watermark"].as_i64() {
                    Some(w) => println!("Watermark:   {}", format_time(w)),
                    None => println!("Watermark:   (not yet materialized)"),
                }
            }
        }

        Commands::Status => {
            let response = client.get(format!("{}/health", cli.api_url)).send().await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let health: Value = resp.json().await?;

                    println!("sensorvault v{}", env!("CARGO_PKG_VERSION"));
                    println!();
                    println!("Status:  {}", health["status"].as_str().unwrap_or("unknown"));
                    println!("Storage: {}", health["storage"].as_str().unwrap_or("unknown"));

                    if let Some(maintenance) = health.get("maintenance") {
                        let aggregate = &maintenance["aggregate"];
                        println!();
                        println!("Aggregate:");
                        println!("  Stale: {}", aggregate["stale"]);
                        if let Some(staleness) = aggregate["staleness_ms"].as_u64() {
                            println!("  Behind by: {}", format_duration(staleness / 1000));
                        }
                        if let Some(err) = aggregate["last_error"].as_str() {
                            println!("  Last error: {}", err);
                        }

                        if let Some(failing) = maintenance["failing_chunks"].as_array() {
                            if !failing.is_empty() {
                                println!();
                                println!("Chunks failing compression:");
                                for chunk in failing {
                                    println!(
                                        "  chunk {} ({} failures): {}",
                                        chunk["chunk_id"],
                                        chunk["error_count"],
                                        chunk["last_error"].as_str().unwrap_or("-")
                                    );
                                }
                            }
                        }
                    }

                    if let Some(uptime) = health["uptime_seconds"].as_u64() {
                        println!();
                        println!("Uptime: {}", format_duration(uptime));
                    }
                }
                Ok(resp) => {
                    anyhow::bail!("API returned error: {}", resp.status());
                }
                Err(e) => {
                    eprintln!("Cannot connect to sensorvault at {}", cli.api_url);
                    eprintln!();
                    eprintln!("Make sure the server is running:");
                    eprintln!("  cargo run --bin sensorvault");
                    return Err(e.into());
                }
            }
        }

        Commands::Config { output } => {
            let config = sensorvault::config::generate_default_config();

            match output {
                Some(path) => {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, &config)?;
                    println!("Config written to {:?}", path);
                }
                None => {
                    print!("{}", config);
                }
            }
        }
    }

    Ok(())
}

async fn expect_success(response: reqwest::Response) -> anyhow::Result<Value> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let text = response.text().await.unwrap_or_default();
    anyhow::bail!("Request failed ({}): {}", status, text)
}

fn apply_filter(body: &mut Value, filter: &FilterArgs) {
    for (key, value) in filter_params(filter) {
        body[key] = json!(value);
    }
}

fn filter_params(filter: &FilterArgs) -> Vec<(&'static str, String)> {
    [
        ("machine_id", &filter.machine),
        ("sensor_type", &filter.sensor),
        ("location", &filter.location),
    ]
    .into_iter()
    .filter_map(|(key, value)| value.clone().map(|v| (key, v)))
    .collect()
}

fn parse_time(s: &str) -> anyhow::Result<i64> {
    if let Ok(ts) = s.parse::<i64>() {
        return Ok(ts);
    }
    let dt = chrono::DateTime::parse_from_rfc3339(s)
        .map_err(|_| anyhow::anyhow!("Invalid timestamp format: {}", s))?;
    Ok(dt.timestamp_millis())
}

/// Either a JSON array of readings or one reading per line
fn parse_readings_file(text: &str) -> anyhow::Result<Vec<Value>> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }

    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|e| anyhow::anyhow!("line {}: {}", n + 1, e))
        })
        .collect()
}

fn format_time(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else if seconds < 86400 {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    } else {
        format!("{}d {}h", seconds / 86400, (seconds % 86400) / 3600)
    }
}

fn print_reading_list(format: &str, data: Value) -> anyhow::Result<()> {
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        print_readings(data["readings"].as_array().map(Vec::as_slice).unwrap_or(&[]));
    }
    Ok(())
}

fn print_readings(rows: &[Value]) {
    if rows.is_empty() {
        println!("No readings for the selected filters");
        return;
    }

    println!(
        "{:<22} {:<14} {:<12} {:>10} {:<6} {:>4} {}",
        "Time", "Machine", "Sensor", "Value", "Unit", "Q", "Status"
    );
    println!("{}", "-".repeat(84));
    for row in rows {
        println!(
            "{:<22} {:<14} {:<12} {:>10.3} {:<6} {:>4} {}",
            format_time(row["time"].as_i64().unwrap_or(0)),
            row["machine_id"].as_str().unwrap_or("-"),
            row["sensor_type"].as_str().unwrap_or("-"),
            row["value"].as_f64().unwrap_or(f64::NAN),
            row["unit"].as_str().unwrap_or(""),
            row["quality"],
            row["status"].as_str().unwrap_or("-")
        );
    }
}

fn print_buckets(buckets: &[Value]) {
    if buckets.is_empty() {
        println!("No data for the selected time range");
        return;
    }

    println!(
        "{:<22} {:<14} {:<12} {:>9} {:>9} {:>9} {:>7} {:>6}",
        "Hour", "Machine", "Sensor", "Avg", "Min", "Max", "Count", "Q%"
    );
    println!("{}", "-".repeat(96));
    for bucket in buckets {
        println!(
            "{:<22} {:<14} {:<12} {:>9.3} {:>9.3} {:>9.3} {:>7} {:>6.1}",
            format_time(bucket["hour"].as_i64().unwrap_or(0)),
            bucket["machine_id"].as_str().unwrap_or("-"),
            bucket["sensor_type"].as_str().unwrap_or("-"),
            bucket["avg_value"].as_f64().unwrap_or(f64::NAN),
            bucket["min_value"].as_f64().unwrap_or(f64::NAN),
            bucket["max_value"].as_f64().unwrap_or(f64::NAN),
            bucket["sample_count"],
            bucket["quality_pct"].as_f64().unwrap_or(0.0)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_readings_file_forms() {
        let array = r#"[{"machine_id": "MACHINE_001"}, {"machine_id": "MACHINE_002"}]"#;
        assert_eq!(parse_readings_file(array).unwrap().len(), 2);

        let ndjson = "{\"value\": 1.0}\n\n{\"value\": 2.0}\n";
        let readings = parse_readings_file(ndjson).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[1]["value"], 2.0);

        assert!(parse_readings_file("{\"value\": 1.0}\nnot json\n").is_err());
    }

    #[test]
    fn test_filter_params_skip_unset() {
        let filter = FilterArgs {
            machine: Some("MACHINE_001".into()),
            sensor: None,
            location: Some("Plant_A_Line_1".into()),
        };
        let params = filter_params(&filter);
        assert_eq!(params.len(), 2);
        assert_eq!(params[0], ("machine_id", "MACHINE_001".to_string()));
    }
}
