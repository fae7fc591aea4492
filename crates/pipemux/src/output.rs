use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    pipe_id: u64,
    sequence: usize,
    payload_size: usize,
    payload: String,
    handle_count: usize,
    process: &'a str,
    timestamp: String,
}

pub fn print_message(
    pipe_id: u64,
    sequence: usize,
    payload: &[u8],
    handle_count: usize,
    process: &str,
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                pipe_id,
                sequence,
                payload_size: payload.len(),
                payload: payload_preview(payload),
                handle_count,
                process,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["PIPE", "SEQ", "SIZE", "HANDLES", "PROC", "PAYLOAD"])
                .add_row(vec![
                    pipe_id.to_string(),
                    sequence.to_string(),
                    payload.len().to_string(),
                    handle_count.to_string(),
                    process.to_string(),
                    payload_preview(payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "pipe={} seq={} size={} handles={} proc={} payload={}",
                pipe_id,
                sequence,
                payload.len(),
                handle_count,
                process,
                payload_preview(payload)
            );
        }
        OutputFormat::Raw => {
            print_raw(payload);
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
